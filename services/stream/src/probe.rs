//! # Probe/Commit Negotiation
//!
//! The host proposes a streaming configuration with SET_CUR(PROBE), reads
//! back what the device is willing to do with GET_CUR(PROBE), and finally
//! applies it with SET_CUR(COMMIT).
//!
//! ```text
//!   host            probe slot                 commit slot
//!   SET_CUR(PROBE) ─► validate_and_fixup ─► probe
//!   GET_CUR(PROBE) ◄─ probe
//!   SET_CUR(COMMIT) ─► validate_and_fixup ───────────────► commit
//! ```
//!
//! Probe is scratch space and never reaches hardware. Commit is only
//! written by a successful commit and is never copied back into probe.

use bitflags::bitflags;
use uvcam_usbd::UsbSpeed;

use crate::config::{EngineConfig, Transport};
use crate::format::FormatTable;
use crate::payload::PayloadHeader;
use crate::{ErrorCode, UvcError, UVC_VERSION_MINOR};

bitflags! {
    /// `bmHint`: fields the host wants kept fixed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProbeHint: u16 {
        /// Keep dwFrameInterval (the "framing-info" hint)
        const FRAME_INTERVAL = 0x0001;
        const KEY_FRAME_RATE = 0x0002;
        const P_FRAME_RATE = 0x0004;
        const COMP_QUALITY = 0x0008;
        const COMP_WINDOW_SIZE = 0x0010;
    }
}

bitflags! {
    /// `bmFramingInfo`: header fields the device fills in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FramingInfo: u8 {
        /// Frame ID bit toggles per frame
        const FID = 0x01;
        /// End-of-frame bit marks the last payload
        const EOF = 0x02;
    }
}

// =============================================================================
// Wire Record
// =============================================================================

/// Video Probe and Commit Controls (UVC 1.1, 34 bytes, little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCommitState {
    pub hint: ProbeHint,
    /// 1-based format index (0 means "none")
    pub format_index: u8,
    /// 1-based frame index
    pub frame_index: u8,
    /// Frame interval (100ns units)
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    /// Internal latency in ms
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    /// Device clock (Hz)
    pub clock_frequency: u32,
    pub framing_info: FramingInfo,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
}

impl ProbeCommitState {
    pub const SIZE: usize = 34;

    /// All-zero record; `format_index == 0` marks "nothing negotiated".
    pub const fn empty() -> Self {
        Self {
            hint: ProbeHint::empty(),
            format_index: 0,
            frame_index: 0,
            frame_interval: 0,
            key_frame_rate: 0,
            p_frame_rate: 0,
            comp_quality: 0,
            comp_window_size: 0,
            delay: 0,
            max_video_frame_size: 0,
            max_payload_transfer_size: 0,
            clock_frequency: 0,
            framing_info: FramingInfo::empty(),
            preferred_version: 0,
            min_version: 0,
            max_version: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.format_index == 0
    }

    /// Parse a complete 34-byte record.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        Some(Self {
            hint: ProbeHint::from_bits_retain(u16_at(0)),
            format_index: data[2],
            frame_index: data[3],
            frame_interval: u32_at(4),
            key_frame_rate: u16_at(8),
            p_frame_rate: u16_at(10),
            comp_quality: u16_at(12),
            comp_window_size: u16_at(14),
            delay: u16_at(16),
            max_video_frame_size: u32_at(18),
            max_payload_transfer_size: u32_at(22),
            clock_frequency: u32_at(26),
            framing_info: FramingInfo::from_bits_retain(data[30]),
            preferred_version: data[31],
            min_version: data[32],
            max_version: data[33],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.hint.bits().to_le_bytes());
        out[2] = self.format_index;
        out[3] = self.frame_index;
        out[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        out[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
        out[30] = self.framing_info.bits();
        out[31] = self.preferred_version;
        out[32] = self.min_version;
        out[33] = self.max_version;
        out
    }

    /// Applies a (possibly short) SET_CUR data stage on top of `self`.
    /// UVC 1.0 hosts send 26 bytes; the trailing fields keep their
    /// current values.
    pub fn overlay(&self, data: &[u8]) -> Self {
        let mut raw = self.to_bytes();
        let n = data.len().min(Self::SIZE);
        raw[..n].copy_from_slice(&data[..n]);
        Self::from_bytes(&raw).unwrap_or(*self)
    }
}

impl Default for ProbeCommitState {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// Negotiator
// =============================================================================

/// What a successful commit asks of the streaming controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Bulk transport: (re)start streaming now
    StartStreaming,
    /// Isochronous transport: wait for the host to select alternate
    /// setting 1
    AwaitAlternateSetting,
}

/// Holds the probe and commit slots and validates host proposals against
/// the capability table.
pub struct ProbeCommitNegotiator {
    formats: FormatTable,
    transport: Transport,
    payload_limit: u32,
    clock_frequency: u32,
    probe: ProbeCommitState,
    commit: ProbeCommitState,
}

impl ProbeCommitNegotiator {
    pub fn new(config: &EngineConfig) -> Self {
        let mut negotiator = Self {
            formats: config.formats,
            transport: config.transport,
            payload_limit: config.payload_limit(),
            clock_frequency: config.clock_frequency,
            probe: ProbeCommitState::empty(),
            commit: ProbeCommitState::empty(),
        };
        negotiator.reset();
        negotiator
    }

    /// Current probe record.
    pub fn probe(&self) -> &ProbeCommitState {
        &self.probe
    }

    /// Current commit record, `None` until a commit succeeded.
    pub fn commit_state(&self) -> Option<&ProbeCommitState> {
        if self.commit.is_empty() {
            None
        } else {
            Some(&self.commit)
        }
    }

    /// Bus reset: probe back to default, commit cleared.
    pub fn reset(&mut self) {
        self.probe = self.get_default(None).unwrap_or_else(|_| ProbeCommitState::empty());
        self.commit = ProbeCommitState::empty();
    }

    /// Default record for `format_hint` (or the first format): its
    /// lowest-indexed frame at the frame's default interval.
    pub fn get_default(&self, format_hint: Option<u8>) -> Result<ProbeCommitState, UvcError> {
        let rejected = UvcError::ConfigurationRejected(ErrorCode::InvalidControl);
        let format = match format_hint {
            Some(index) => self.formats.format(index),
            None => self.formats.first_format(),
        }
        .ok_or(rejected)?;
        let frame = format.first_frame().ok_or(rejected)?;

        Ok(ProbeCommitState {
            hint: ProbeHint::FRAME_INTERVAL,
            format_index: format.index,
            frame_index: frame.index,
            frame_interval: frame.default_interval,
            max_video_frame_size: frame.max_video_frame_size,
            max_payload_transfer_size: frame.line_length + PayloadHeader::LEN as u32,
            clock_frequency: self.clock_frequency,
            framing_info: FramingInfo::FID | FramingInfo::EOF,
            preferred_version: UVC_VERSION_MINOR,
            min_version: UVC_VERSION_MINOR,
            max_version: UVC_VERSION_MINOR,
            ..ProbeCommitState::empty()
        })
    }

    /// Checks `candidate` against the capability table and returns it with
    /// every device-owned field overwritten.
    pub fn validate_and_fixup(
        &self,
        candidate: &ProbeCommitState,
        speed: UsbSpeed,
    ) -> Result<ProbeCommitState, UvcError> {
        if speed != UsbSpeed::High {
            return Err(UvcError::ConfigurationRejected(ErrorCode::InvalidRequest));
        }

        let (_, frame) = self
            .formats
            .lookup(candidate.format_index, candidate.frame_index)
            .ok_or(UvcError::ConfigurationRejected(ErrorCode::InvalidControl))?;

        if candidate.hint.contains(ProbeHint::FRAME_INTERVAL)
            && !frame.supports_interval(candidate.frame_interval)
        {
            return Err(UvcError::ConfigurationRejected(ErrorCode::InvalidRequest));
        }

        let payload = frame.line_length + PayloadHeader::LEN as u32;
        if payload > self.payload_limit {
            return Err(UvcError::ConfigurationRejected(ErrorCode::OutOfRange));
        }

        let mut fixed = *candidate;
        fixed.framing_info = FramingInfo::FID | FramingInfo::EOF;
        fixed.preferred_version = UVC_VERSION_MINOR;
        fixed.min_version = UVC_VERSION_MINOR;
        fixed.max_version = UVC_VERSION_MINOR;
        // The host only chooses the interval when it asks to keep it
        if !candidate.hint.contains(ProbeHint::FRAME_INTERVAL) {
            fixed.frame_interval = frame.default_interval;
        }
        fixed.max_video_frame_size = frame.max_video_frame_size;
        fixed.max_payload_transfer_size = payload;
        if fixed.clock_frequency == 0 {
            fixed.clock_frequency = self.clock_frequency;
        }
        Ok(fixed)
    }

    /// SET_CUR(PROBE). On failure probe is unchanged.
    pub fn set_probe(&mut self, candidate: &ProbeCommitState, speed: UsbSpeed) -> Result<(), UvcError> {
        let fixed = self.validate_and_fixup(candidate, speed)?;
        self.probe = fixed;
        Ok(())
    }

    /// SET_CUR(COMMIT). Re-validates and, only on success, replaces the
    /// commit slot.
    pub fn commit(&mut self, candidate: &ProbeCommitState, speed: UsbSpeed) -> Result<CommitOutcome, UvcError> {
        if speed != UsbSpeed::High {
            log::warn!("stream: commit rejected at {}", speed.as_str());
            return Err(UvcError::ConfigurationRejected(ErrorCode::InvalidRequest));
        }

        let fixed = self.validate_and_fixup(candidate, speed)?;
        self.commit = fixed;
        log::info!(
            "stream: committed format {} frame {} interval {} payload {}",
            fixed.format_index,
            fixed.frame_index,
            fixed.frame_interval,
            fixed.max_payload_transfer_size
        );

        Ok(match self.transport {
            Transport::Bulk => CommitOutcome::StartStreaming,
            Transport::Isochronous { .. } => CommitOutcome::AwaitAlternateSetting,
        })
    }

    /// GET_MIN / GET_MAX(PROBE). Every frame has exactly one interval, so
    /// the envelope collapses to the defaults of the probed frame.
    pub fn min_max(&self, speed: UsbSpeed) -> Result<ProbeCommitState, UvcError> {
        if speed != UsbSpeed::High {
            return Err(UvcError::ConfigurationRejected(ErrorCode::InvalidRequest));
        }
        let (_, frame) = self
            .formats
            .lookup(self.probe.format_index, self.probe.frame_index)
            .ok_or(UvcError::ConfigurationRejected(ErrorCode::InvalidControl))?;

        Ok(ProbeCommitState {
            format_index: self.probe.format_index,
            frame_index: self.probe.frame_index,
            frame_interval: frame.default_interval,
            max_video_frame_size: frame.max_video_frame_size,
            max_payload_transfer_size: frame.line_length + PayloadHeader::LEN as u32,
            ..self.probe
        })
    }
}
