//! Engine configuration.

use uvcam_usbd::{Endpoint, EndpointAddress, TransferType, UsbSpeed};

use crate::format::{FormatTable, DEFAULT_FORMATS};
use crate::{ErrorCode, UvcError};

/// Streaming endpoint transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Bulk endpoint; no alternate setting, streaming starts on commit
    Bulk,
    /// Isochronous endpoint on alternate setting 1. `transactions` is the
    /// number of packets per microframe; anything above 1 is high-bandwidth
    /// mode and must be opted into explicitly.
    Isochronous { transactions: u8 },
}

impl Transport {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            Transport::Bulk => TransferType::Bulk,
            Transport::Isochronous { .. } => TransferType::Isochronous,
        }
    }

    pub fn is_isochronous(&self) -> bool {
        matches!(self, Transport::Isochronous { .. })
    }
}

/// Streaming engine configuration
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Streaming endpoint transport
    pub transport: Transport,
    /// Streaming data IN endpoint
    pub streaming_endpoint: EndpointAddress,
    /// VideoControl interface number
    pub control_interface: u8,
    /// VideoStreaming interface number
    pub streaming_interface: u8,
    /// Streaming endpoint max packet size at high speed
    pub max_packet_size_hs: u16,
    /// Streaming endpoint max packet size at full speed
    pub max_packet_size_fs: u16,
    /// URBs in the streaming pipe
    pub urb_count: usize,
    /// Extra passes over the pipe before a producer gives up on a URB
    pub spin_budget: u32,
    /// Largest payload accepted on a bulk endpoint
    pub bulk_transfer_limit: u32,
    /// Device clock reported in dwClockFrequency (Hz)
    pub clock_frequency: u32,
    /// Emit PTS/SCR fields when the sensor supplies a timestamp
    pub timestamps: bool,
    /// Formats offered to the host
    pub formats: FormatTable,
}

impl EngineConfig {
    /// Isochronous defaults: 1024-byte single-transaction endpoint.
    pub fn isochronous() -> Self {
        Self::default()
    }

    /// Bulk defaults: 512-byte endpoint.
    pub fn bulk() -> Self {
        Self {
            transport: Transport::Bulk,
            max_packet_size_hs: 512,
            max_packet_size_fs: 64,
            ..Self::default()
        }
    }

    /// Endpoint description for `speed`.
    pub fn endpoint(&self, speed: UsbSpeed) -> Endpoint {
        let mps = match speed {
            UsbSpeed::High | UsbSpeed::Super => self.max_packet_size_hs,
            UsbSpeed::Full | UsbSpeed::Low => self.max_packet_size_fs,
        };
        let mut ep = Endpoint::new(self.streaming_endpoint, self.transport.transfer_type(), mps);
        if let Transport::Isochronous { transactions } = self.transport {
            if speed == UsbSpeed::High {
                ep.transactions = transactions;
            }
        }
        ep
    }

    /// Hardware limit on one payload (header included) at high speed.
    pub fn payload_limit(&self) -> u32 {
        match self.transport {
            Transport::Bulk => self.bulk_transfer_limit,
            Transport::Isochronous { transactions } => {
                self.max_packet_size_hs as u32 * transactions as u32
            }
        }
    }

    /// Bytes per URB. Isochronous URBs carry one whole service interval;
    /// bulk URBs are packet sized and a payload may span several.
    pub fn urb_capacity(&self) -> usize {
        match self.transport {
            Transport::Bulk => self.max_packet_size_hs as usize,
            Transport::Isochronous { .. } => self.payload_limit() as usize,
        }
    }

    pub fn validate(&self) -> Result<(), UvcError> {
        let reject = UvcError::ConfigurationRejected(ErrorCode::OutOfRange);

        if self.urb_count == 0
            || self.spin_budget == 0
            || self.max_packet_size_hs == 0
            || self.formats.is_empty()
        {
            return Err(reject);
        }
        // Capture wakes up every `line_length` bytes
        let empty_frame = self
            .formats
            .formats()
            .iter()
            .flat_map(|format| format.frames.iter())
            .any(|frame| frame.line_length == 0 || frame.max_video_frame_size == 0);
        if empty_frame {
            return Err(reject);
        }
        if let Transport::Isochronous { transactions } = self.transport {
            if !(1..=3).contains(&transactions) || self.max_packet_size_hs > 1024 {
                return Err(reject);
            }
        }
        if self.transport == Transport::Bulk && self.max_packet_size_hs > 512 {
            return Err(reject);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Isochronous { transactions: 1 },
            streaming_endpoint: EndpointAddress::input(1),
            control_interface: 0,
            streaming_interface: 1,
            max_packet_size_hs: 1024,
            max_packet_size_fs: 512,
            urb_count: 4,
            spin_budget: 10_000,
            bulk_transfer_limit: 16 * 1024,
            clock_frequency: 48_000_000, // 48 MHz
            timestamps: false,
            formats: DEFAULT_FORMATS,
        }
    }
}
