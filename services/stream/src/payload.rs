//! # Payload Packetizer
//!
//! Wraps capture chunks in UVC payloads and writes them into URBs.
//!
//! ```text
//!   chunk ──┬─ body 0 ─► [hdr|body 0] ─► URB ─► URB ... (bulk)
//!           ├─ body 1 ─► [hdr|body 1] ─► URB
//!           └─ body n ─► [hdr(EOF)|body n] ─► URB
//! ```
//!
//! Every payload carries its own 12-byte header, so each one is
//! self-describing on the wire. A payload never exceeds the negotiated
//! `dwMaxPayloadTransferSize`. On isochronous endpoints one payload is one
//! URB; on bulk endpoints URBs are packet sized and a payload spans as many
//! as it needs.

use alloc::vec::Vec;

use bitflags::bitflags;
use uvcam_usbd::{Pipe, UsbController};

use crate::config::{EngineConfig, Transport};
use crate::{ErrorCode, UvcError};

bitflags! {
    /// `bmHeaderInfo` bits of the payload header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderInfo: u8 {
        /// Frame ID, toggles at each frame boundary
        const FID = 0x01;
        /// End of frame
        const EOF = 0x02;
        /// Presentation time present
        const PTS = 0x04;
        /// Source clock reference present
        const SCR = 0x08;
        const RES = 0x10;
        /// Still image
        const STI = 0x20;
        /// Error
        const ERR = 0x40;
        /// End of header
        const EOH = 0x80;
    }
}

/// Sensor timestamp carried in PTS/SCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Presentation time in device clock ticks
    pub presentation_time: u32,
    /// Source time clock at capture
    pub source_time: u32,
    /// USB SOF counter at capture
    pub sof_counter: u16,
}

/// Fixed-size UVC payload header with PTS and SCR slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub info: HeaderInfo,
    pub presentation_time: u32,
    pub source_time: u32,
    pub sof_counter: u16,
}

impl PayloadHeader {
    /// bHeaderLength: 2 + 4 (PTS) + 6 (SCR)
    pub const LEN: usize = 12;

    pub fn new(frame_toggle: bool, end_of_frame: bool, timestamp: Option<Timestamp>) -> Self {
        let mut info = HeaderInfo::EOH;
        info.set(HeaderInfo::FID, frame_toggle);
        info.set(HeaderInfo::EOF, end_of_frame);
        let ts = timestamp.unwrap_or_default();
        if timestamp.is_some() {
            info |= HeaderInfo::PTS | HeaderInfo::SCR;
        }
        Self {
            info,
            presentation_time: ts.presentation_time,
            source_time: ts.source_time,
            sof_counter: ts.sof_counter,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = Self::LEN as u8;
        out[1] = self.info.bits();
        out[2..6].copy_from_slice(&self.presentation_time.to_le_bytes());
        out[6..10].copy_from_slice(&self.source_time.to_le_bytes());
        out[10..12].copy_from_slice(&self.sof_counter.to_le_bytes());
        out
    }

    /// Parse a header from the start of a payload.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[0] as usize != Self::LEN {
            return None;
        }

        Some(Self {
            info: HeaderInfo::from_bits_retain(data[1]),
            presentation_time: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            source_time: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
            sof_counter: u16::from_le_bytes([data[10], data[11]]),
        })
    }

    pub fn frame_toggle(&self) -> bool {
        self.info.contains(HeaderInfo::FID)
    }

    pub fn end_of_frame(&self) -> bool {
        self.info.contains(HeaderInfo::EOF)
    }
}

/// What one `emit` call put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitReport {
    /// Payloads written
    pub payloads: usize,
    /// URBs submitted, zero-length terminators included
    pub urbs: usize,
    /// Zero-length URBs submitted to terminate bulk payloads
    pub zero_length: usize,
    /// Body bytes written (headers excluded)
    pub bytes: usize,
}

impl EmitReport {
    fn absorb(&mut self, other: EmitReport) {
        self.payloads += other.payloads;
        self.urbs += other.urbs;
        self.zero_length += other.zero_length;
        self.bytes += other.bytes;
    }
}

/// Splits chunks into header-prefixed payloads and submits them.
pub struct PayloadPacketizer {
    transport: Transport,
    max_payload: usize,
    spin_budget: u32,
    timestamps: bool,
}

impl PayloadPacketizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            transport: config.transport,
            max_payload: config.payload_limit() as usize,
            spin_budget: config.spin_budget,
            timestamps: config.timestamps,
        }
    }

    /// Applies the committed `dwMaxPayloadTransferSize`.
    pub fn configure(&mut self, max_payload_transfer_size: u32) {
        self.max_payload = max_payload_transfer_size as usize;
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Emits `chunk` as one or more payloads. Only the last payload of an
    /// end-of-frame chunk carries EOF.
    ///
    /// Returns [`UvcError::ResourceExhausted`] when no URB frees up within
    /// the spin budget. Payloads submitted before that stay submitted; the
    /// starved payload is not sent at all.
    pub fn emit<C>(
        &self,
        chunk: &[u8],
        is_end_of_frame: bool,
        frame_toggle: bool,
        timestamp: Option<Timestamp>,
        pipe: &Pipe,
        controller: &mut C,
    ) -> Result<EmitReport, UvcError>
    where
        C: UsbController + ?Sized,
    {
        if self.max_payload <= PayloadHeader::LEN || pipe.urb_capacity() < PayloadHeader::LEN {
            return Err(UvcError::ConfigurationRejected(ErrorCode::OutOfRange));
        }
        let timestamp = if self.timestamps { timestamp } else { None };
        let body_max = self.max_payload - PayloadHeader::LEN;

        let mut report = EmitReport::default();
        if chunk.is_empty() {
            if is_end_of_frame {
                let header = PayloadHeader::new(frame_toggle, true, timestamp);
                report.absorb(self.write_payload(&header, &[], pipe, controller)?);
            }
            return Ok(report);
        }

        let pieces = (chunk.len() + body_max - 1) / body_max;
        for (i, body) in chunk.chunks(body_max).enumerate() {
            let last = i + 1 == pieces;
            let header = PayloadHeader::new(frame_toggle, is_end_of_frame && last, timestamp);
            report.absorb(self.write_payload(&header, body, pipe, controller)?);
        }
        Ok(report)
    }

    /// Writes one header-prefixed payload. Every URB the payload needs is
    /// claimed before the first one is submitted, so a starved payload
    /// never reaches the wire in part.
    fn write_payload<C>(
        &self,
        header: &PayloadHeader,
        body: &[u8],
        pipe: &Pipe,
        controller: &mut C,
    ) -> Result<EmitReport, UvcError>
    where
        C: UsbController + ?Sized,
    {
        let total = PayloadHeader::LEN + body.len();
        let capacity = pipe.urb_capacity();
        // A bulk payload ending on a full packet needs a zero-length terminator
        let terminate = self.transport == Transport::Bulk && total % capacity == 0 && total < self.max_payload;
        let needed = (total + capacity - 1) / capacity + usize::from(terminate);
        if needed > pipe.capacity() {
            return Err(UvcError::ConfigurationRejected(ErrorCode::OutOfRange));
        }

        let mut urbs = Vec::with_capacity(needed);
        for _ in 0..needed {
            urbs.push(pipe.acquire_for_producer(self.spin_budget)?);
        }

        let header = header.to_bytes();
        let mut head: &[u8] = &header;
        let mut rest = body;
        let mut report = EmitReport {
            payloads: 1,
            bytes: body.len(),
            zero_length: usize::from(terminate),
            ..EmitReport::default()
        };
        for mut urb in urbs {
            let written = urb.write(head);
            head = &head[written..];
            let written = urb.write(rest);
            rest = &rest[written..];
            pipe.submit(urb, controller)?;
            report.urbs += 1;
        }
        Ok(report)
    }
}
