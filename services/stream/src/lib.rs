//! # STREAM: UVC Device Streaming Engine
//!
//! Device-side USB Video Class engine for a webcam gadget. It answers the
//! host's Probe/Commit negotiation, synchronises to the camera's vertical
//! sync, and packetizes scan lines into UVC payloads on a pool of
//! transfer buffers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       StreamingEngine                           │
//! ├───────────────────────┬─────────────────────────────────────────┤
//! │  control (SETUP)      │  capture interrupt                      │
//! │  ControlDispatcher    │  CapturePipeline                        │
//! │  ProbeCommitNegotiator│    └─► PayloadPacketizer                │
//! │          │            │          └─► Pipe (URBs) ─► controller  │
//! │          ▼            │                                         │
//! │  StreamingController ─┴─ main loop poll: Off/Starting/Active    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Contexts
//!
//! - **Control**: `handle_setup` answers class and standard requests
//! - **Vsync interrupt**: `vsync_interrupt` marks a frame start
//! - **Capture interrupt**: `capture_interrupt` moves sensor data to URBs
//! - **Completion interrupt**: `transfer_complete` returns drained URBs
//! - **Main loop**: `poll` applies start/stop requests

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod capture;
pub mod config;
pub mod engine;
pub mod format;
pub mod payload;
pub mod probe;
pub mod request;
pub mod streaming;

#[cfg(test)]
mod testing;

use core::fmt;

use uvcam_usbd::UsbError;

pub use capture::{
    CameraSensor, CapturePipeline, CaptureSession, CaptureState, CaptureStatistics, FrameSync,
};
pub use config::{EngineConfig, Transport};
pub use engine::{EngineStatistics, StreamingEngine};
pub use format::{Encoding, FormatGuid, FormatTable, VideoFormat, VideoFrame, DEFAULT_FORMATS};
pub use payload::{EmitReport, HeaderInfo, PayloadHeader, PayloadPacketizer, Timestamp};
pub use probe::{CommitOutcome, FramingInfo, ProbeCommitNegotiator, ProbeCommitState, ProbeHint};
pub use request::{ControlDispatcher, ControlResponse};
pub use streaming::{StreamContext, StreamRequest, StreamState, StreamingController};

/// STREAM service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// UVC Constants
// =============================================================================

/// Class minor version reported in the probe/commit version bytes (UVC 1.1).
pub const UVC_VERSION_MINOR: u8 = 1;

/// Class-specific request codes.
pub mod request_code {
    pub const SET_CUR: u8 = 0x01;
    pub const GET_CUR: u8 = 0x81;
    pub const GET_MIN: u8 = 0x82;
    pub const GET_MAX: u8 = 0x83;
    pub const GET_RES: u8 = 0x84;
    pub const GET_LEN: u8 = 0x85;
    pub const GET_INFO: u8 = 0x86;
    pub const GET_DEF: u8 = 0x87;
}

/// VideoStreaming interface control selectors.
pub mod vs_control {
    pub const PROBE: u8 = 0x01;
    pub const COMMIT: u8 = 0x02;
}

/// VideoControl interface control selectors.
pub mod vc_control {
    pub const VIDEO_POWER_MODE: u8 = 0x01;
    pub const REQUEST_ERROR_CODE: u8 = 0x02;
}

/// Entity IDs in the VideoControl topology.
pub mod entity {
    /// The VideoControl interface itself
    pub const INTERFACE: u8 = 0;
    pub const CAMERA_TERMINAL: u8 = 1;
    pub const OUTPUT_TERMINAL: u8 = 3;
    pub const PROCESSING_UNIT: u8 = 5;
}

/// GET_INFO response: supports GET and SET.
pub const INFO_GET_SET: u8 = 0x03;

// =============================================================================
// Errors
// =============================================================================

/// UVC Request Error Code Control values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0x00,
    NotReady = 0x01,
    WrongState = 0x02,
    Power = 0x03,
    OutOfRange = 0x04,
    InvalidUnit = 0x05,
    InvalidControl = 0x06,
    InvalidRequest = 0x07,
    InvalidValueWithinRange = 0x08,
    Unknown = 0xFF,
}

impl ErrorCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => ErrorCode::NoError,
            0x01 => ErrorCode::NotReady,
            0x02 => ErrorCode::WrongState,
            0x03 => ErrorCode::Power,
            0x04 => ErrorCode::OutOfRange,
            0x05 => ErrorCode::InvalidUnit,
            0x06 => ErrorCode::InvalidControl,
            0x07 => ErrorCode::InvalidRequest,
            0x08 => ErrorCode::InvalidValueWithinRange,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvcError {
    /// Malformed or unsupported control request; the host sees a stall
    Protocol(ErrorCode),
    /// Requested format/frame/interval/size is unsupported; probe and
    /// commit state are unchanged
    ConfigurationRejected(ErrorCode),
    /// No free transfer buffer within the spin budget
    ResourceExhausted,
    /// USB plumbing failure
    Usb(UsbError),
}

impl UvcError {
    /// Error code the host reads back through the error-code control.
    pub fn code(&self) -> ErrorCode {
        match self {
            UvcError::Protocol(code) | UvcError::ConfigurationRejected(code) => *code,
            UvcError::ResourceExhausted => ErrorCode::NotReady,
            UvcError::Usb(_) => ErrorCode::Unknown,
        }
    }
}

impl From<UsbError> for UvcError {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::BufferStarved => UvcError::ResourceExhausted,
            other => UvcError::Usb(other),
        }
    }
}

impl fmt::Display for UvcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UvcError::Protocol(code) => write!(f, "protocol error ({:?})", code),
            UvcError::ConfigurationRejected(code) => {
                write!(f, "configuration rejected ({:?})", code)
            }
            UvcError::ResourceExhausted => write!(f, "transfer buffers exhausted"),
            UvcError::Usb(err) => write!(f, "usb: {}", err),
        }
    }
}
