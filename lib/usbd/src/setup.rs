//! SETUP packet decoding.
//!
//! Every control transfer starts with an 8-byte SETUP packet. The class
//! engines only see the decoded form.

/// Standard request codes (USB 2.0 table 9-4)
pub mod standard {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;

    /// Feature selector for CLEAR_FEATURE / SET_FEATURE on an endpoint
    pub const ENDPOINT_HALT: u16 = 0x0000;
}

/// Data stage direction encoded in `bmRequestType` bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    HostToDevice,
    DeviceToHost,
}

/// Request type encoded in `bmRequestType` bits 6..5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient encoded in `bmRequestType` bits 4..0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Decoded SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// Parse from the raw 8 bytes delivered by the controller.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            bm_request_type: data[0],
            b_request: data[1],
            w_value: u16::from_le_bytes([data[2], data[3]]),
            w_index: u16::from_le_bytes([data[4], data[5]]),
            w_length: u16::from_le_bytes([data[6], data[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.w_value.to_le_bytes();
        let index = self.w_index.to_le_bytes();
        let length = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Build a packet from its parts. Mostly useful for host-side tooling
    /// and tests.
    pub fn new(
        direction: RequestDirection,
        kind: RequestKind,
        recipient: Recipient,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        w_length: u16,
    ) -> Self {
        let dir = match direction {
            RequestDirection::HostToDevice => 0x00,
            RequestDirection::DeviceToHost => 0x80,
        };
        let kind = match kind {
            RequestKind::Standard => 0x00,
            RequestKind::Class => 0x20,
            RequestKind::Vendor => 0x40,
            RequestKind::Reserved => 0x60,
        };
        let recipient = match recipient {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
            Recipient::Other => 0x03,
        };
        Self {
            bm_request_type: dir | kind | recipient,
            b_request,
            w_value,
            w_index,
            w_length,
        }
    }

    pub fn direction(&self) -> RequestDirection {
        if self.bm_request_type & 0x80 != 0 {
            RequestDirection::DeviceToHost
        } else {
            RequestDirection::HostToDevice
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// High byte of `wValue` (control selector for class requests).
    pub fn value_high(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    /// Low byte of `wIndex` (interface number or endpoint address).
    pub fn index_low(&self) -> u8 {
        self.w_index as u8
    }

    /// High byte of `wIndex` (entity ID for class requests).
    pub fn index_high(&self) -> u8 {
        (self.w_index >> 8) as u8
    }
}
