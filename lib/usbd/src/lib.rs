//! # USBD: Device-Side USB Plumbing
//!
//! Shared building blocks for USB *gadget* (device-side) class drivers:
//!
//! - Bus speed, transfer kind and endpoint addressing types
//! - SETUP packet decoding ([`setup`])
//! - The [`controller::UsbController`] seam to the device-controller driver
//! - Ownership-tagged transfer buffer pools ([`pipe`])
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Class Engine (UVC, ...)                  │
//! │   control handlers        capture producer                  │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ SetupPacket  │   Pipe ── Urb[0] Urb[1] ... Urb[n-1]         │
//! │  (decode)    │   Free → Producer → Consumer → Free          │
//! ├──────────────┴──────────────────────────────────────────────┤
//! │                UsbController (device driver)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod controller;
pub mod pipe;
pub mod setup;

use core::fmt;

pub use controller::UsbController;
pub use pipe::{Occupancy, Pipe, PipeStatistics, UrbHandle, UrbOwner};
pub use setup::{Recipient, RequestDirection, RequestKind, SetupPacket};

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// USB bus speed as reported by the device controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UsbSpeed {
    Low = 0,       // 1.5 Mbps
    Full = 1,      // 12 Mbps
    High = 2,      // 480 Mbps
    Super = 3,     // 5 Gbps
}

impl UsbSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsbSpeed::Low => "Low Speed (1.5 Mbps)",
            UsbSpeed::Full => "Full Speed (12 Mbps)",
            UsbSpeed::High => "High Speed (480 Mbps)",
            UsbSpeed::Super => "SuperSpeed (5 Gbps)",
        }
    }
}

/// USB endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out = 0, // Host to device
    In = 1,  // Device to host
}

/// Endpoint address as it appears in descriptors and `wIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// Device-to-host endpoint `number`.
    pub const fn input(number: u8) -> Self {
        Self(0x80 | (number & 0x0F))
    }

    /// Host-to-device endpoint `number`.
    pub const fn output(number: u8) -> Self {
        Self(number & 0x0F)
    }

    pub const fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Device-side endpoint configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint address (includes direction bit)
    pub address: EndpointAddress,
    /// Transfer type
    pub transfer_type: TransferType,
    /// Maximum packet size
    pub max_packet_size: u16,
    /// Transactions per microframe (high-bandwidth isochronous), 1..=3
    pub transactions: u8,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
            transactions: 1,
        }
    }

    /// Largest number of bytes one service interval can move.
    pub fn bytes_per_interval(&self) -> usize {
        self.max_packet_size as usize * self.transactions.max(1) as usize
    }
}

/// USB plumbing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// No free transfer buffer within the spin budget
    BufferStarved,
    /// URB identifier outside the pool
    InvalidUrb,
    /// URB was reclaimed (pipe purged) before it could be submitted
    Cancelled,
    /// Endpoint unknown to the controller
    InvalidEndpoint,
    /// Controller is not configured / bus not enumerated
    NotConfigured,
    /// Controller refused the transfer
    TransferFailed,
    /// Malformed SETUP packet
    MalformedSetup,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::BufferStarved => write!(f, "no free transfer buffer"),
            UsbError::InvalidUrb => write!(f, "invalid URB identifier"),
            UsbError::Cancelled => write!(f, "URB reclaimed before submit"),
            UsbError::InvalidEndpoint => write!(f, "invalid endpoint"),
            UsbError::NotConfigured => write!(f, "controller not configured"),
            UsbError::TransferFailed => write!(f, "transfer rejected by controller"),
            UsbError::MalformedSetup => write!(f, "malformed SETUP packet"),
        }
    }
}
