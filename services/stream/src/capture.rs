//! # Capture Pipeline
//!
//! Runs in the camera capture interrupt. It waits for a vertical-sync
//! edge, then forwards threshold-sized chunks of sensor data to the
//! packetizer until the committed frame size has been reached.
//!
//! ```text
//!            vsync                 avail >= threshold
//!   ┌─────────────────┐  ─────► ┌─────────────────┐ ─────► ┌───────────┐
//!   │WaitForFrameStart│         │ WaitForLineData │        │ Streaming │
//!   └─────────────────┘ ◄─────────────────────────────────── └───────────┘
//!        (flush)                  end of frame
//! ```
//!
//! [`CaptureSession`] has exactly one writer: the capture interrupt while
//! a stream is active, the streaming controller while the capture
//! interrupt is disabled.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use uvcam_usbd::{Pipe, UsbController};

use crate::format::{VideoFormat, VideoFrame};
use crate::payload::{PayloadPacketizer, Timestamp};
use crate::probe::ProbeCommitState;
use crate::UvcError;

// =============================================================================
// Sensor Seam
// =============================================================================

/// Camera sensor and its capture FIFO.
pub trait CameraSensor {
    /// Bytes waiting in the capture FIFO.
    fn available_bytes(&self) -> u32;

    /// Moves up to `dst.len()` bytes out of the FIFO; returns the count.
    fn read_bytes(&mut self, dst: &mut [u8]) -> usize;

    /// Starts the sensor clock and capture.
    fn start(&mut self);

    /// Stops capture.
    fn stop(&mut self);

    /// Discards everything in the FIFO.
    fn flush(&mut self);

    /// FIFO fill level that raises the capture interrupt.
    fn set_threshold(&mut self, bytes: u32);

    fn enable_interrupt(&mut self);

    fn disable_interrupt(&mut self);

    /// Arms the vertical-sync edge interrupt.
    fn arm_vsync(&mut self);

    /// Programs resolution and output format.
    fn configure(&mut self, _format: &VideoFormat, _frame: &VideoFrame) -> Result<(), UvcError> {
        Ok(())
    }

    /// Capture time of the data currently at the head of the FIFO.
    fn timestamp(&self) -> Option<Timestamp> {
        None
    }
}

// =============================================================================
// Frame Sync Signal
// =============================================================================

/// Vertical-sync signal shared between the vsync interrupt, the capture
/// interrupt and the main loop.
///
/// `signal` publishes with `Release`; `take` and `count` read with
/// `Acquire`, so anything the vsync handler wrote before signalling is
/// visible to whoever observes the edge.
#[derive(Debug, Default)]
pub struct FrameSync {
    pending: AtomicBool,
    edges: AtomicU32,
}

impl FrameSync {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            edges: AtomicU32::new(0),
        }
    }

    /// Vsync interrupt: a new frame is starting.
    pub fn signal(&self) {
        self.edges.fetch_add(1, Ordering::Release);
        self.pending.store(true, Ordering::Release);
    }

    /// Consumes a pending frame start.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Vsync edges seen since power-up (wrapping).
    pub fn count(&self) -> u32 {
        self.edges.load(Ordering::Acquire)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    WaitForFrameStart,
    WaitForLineData,
    Streaming,
}

/// Runtime state of one active stream.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub width: u16,
    pub height: u16,
    /// Bytes per line (or compressed chunk)
    pub sample_length: u32,
    /// Bytes forwarded per capture wakeup
    pub threshold: u32,
    /// Committed dwMaxVideoFrameSize
    pub max_frame_size: u32,
    /// Chunks forwarded in the current frame
    pub lines: u32,
    /// FID of the frame being captured
    pub frame_toggle: bool,
    state: CaptureState,
    /// FID of a finished frame whose EOF payload has not gone out yet
    pending_eof: Option<bool>,
    line_buffer: Vec<u8>,
}

impl CaptureSession {
    pub fn new(frame: &VideoFrame, commit: &ProbeCommitState) -> Self {
        let sample_length = frame.line_length;
        Self {
            width: frame.width,
            height: frame.height,
            sample_length,
            threshold: sample_length,
            max_frame_size: commit.max_video_frame_size,
            lines: 0,
            frame_toggle: false,
            state: CaptureState::WaitForFrameStart,
            pending_eof: None,
            line_buffer: vec![0; sample_length as usize],
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// A finished frame still waits for its EOF payload.
    pub fn eof_pending(&self) -> bool {
        self.pending_eof.is_some()
    }

    fn is_end_of_frame(&self) -> bool {
        (self.lines as u64 + 1) * self.threshold as u64 >= self.max_frame_size as u64
    }
}

/// Capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStatistics {
    /// Frames closed with an EOF payload
    pub frames: u32,
    /// Frames closed early by a vsync edge
    pub short_frames: u32,
    /// Chunks handed to the packetizer
    pub chunks: u32,
    /// Chunks (or parts of chunks) lost to buffer starvation or transfer errors
    pub dropped_chunks: u32,
    /// Payloads written
    pub payloads: u32,
    /// FIFO flushes while waiting for a frame start
    pub flushes: u32,
    /// EOF payloads that went out on their own after a failed send
    pub late_eofs: u32,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Capture-interrupt state machine.
pub struct CapturePipeline {
    session: Option<CaptureSession>,
    stats: CaptureStatistics,
}

impl CapturePipeline {
    pub const fn new() -> Self {
        Self {
            session: None,
            stats: CaptureStatistics {
                frames: 0,
                short_frames: 0,
                chunks: 0,
                dropped_chunks: 0,
                payloads: 0,
                flushes: 0,
                late_eofs: 0,
            },
        }
    }

    pub fn state(&self) -> CaptureState {
        self.session.as_ref().map_or(CaptureState::Idle, CaptureSession::state)
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn stats(&self) -> CaptureStatistics {
        self.stats
    }

    /// Installs a fresh session. Only called with the capture interrupt
    /// disabled.
    pub fn start(&mut self, session: CaptureSession) {
        self.session = Some(session);
    }

    /// Drops the session and returns to `Idle`. Only called with the
    /// capture interrupt disabled.
    pub fn stop(&mut self) -> Option<CaptureSession> {
        self.session.take()
    }

    /// Capture interrupt body.
    pub fn on_capture_interrupt<S, C>(
        &mut self,
        sync: &FrameSync,
        sensor: &mut S,
        packetizer: &PayloadPacketizer,
        pipe: &Pipe,
        controller: &mut C,
    ) where
        S: CameraSensor + ?Sized,
        C: UsbController + ?Sized,
    {
        let stats = &mut self.stats;
        let Some(session) = self.session.as_mut() else {
            sensor.flush();
            return;
        };

        // The previous frame must end before the next one starts
        if let Some(toggle) = session.pending_eof {
            if !Self::send_eof(toggle, stats, sensor, packetizer, pipe, controller) {
                return;
            }
            stats.late_eofs += 1;
            session.pending_eof = None;
        }

        loop {
            match session.state {
                CaptureState::Idle => {
                    sensor.flush();
                    return;
                }
                CaptureState::WaitForFrameStart => {
                    if !sync.take() {
                        // Never let stale partial lines into a frame
                        sensor.flush();
                        stats.flushes += 1;
                        return;
                    }
                    session.lines = 0;
                    session.state = CaptureState::WaitForLineData;
                }
                CaptureState::WaitForLineData => {
                    if sensor.available_bytes() < session.threshold {
                        return;
                    }
                    session.state = CaptureState::Streaming;
                }
                CaptureState::Streaming => {
                    if sync.take() {
                        if !Self::close_short_frame(session, stats, sensor, packetizer, pipe, controller) {
                            return;
                        }
                        continue;
                    }
                    if sensor.available_bytes() < session.threshold {
                        return;
                    }
                    if Self::forward_chunk(session, stats, sensor, packetizer, pipe, controller) {
                        session.frame_toggle = !session.frame_toggle;
                        session.lines = 0;
                        session.state = CaptureState::WaitForFrameStart;
                        stats.frames += 1;
                        log::trace!("stream: end of frame");
                        return;
                    }
                }
            }
        }
    }

    /// Reads one threshold-sized chunk and emits it. Returns `true` when it
    /// completed the frame.
    fn forward_chunk<S, C>(
        session: &mut CaptureSession,
        stats: &mut CaptureStatistics,
        sensor: &mut S,
        packetizer: &PayloadPacketizer,
        pipe: &Pipe,
        controller: &mut C,
    ) -> bool
    where
        S: CameraSensor + ?Sized,
        C: UsbController + ?Sized,
    {
        let want = session.threshold as usize;
        if session.line_buffer.len() < want {
            session.line_buffer.resize(want, 0);
        }
        let timestamp = sensor.timestamp();
        let read = sensor.read_bytes(&mut session.line_buffer[..want]);
        let eof = session.is_end_of_frame();

        match packetizer.emit(
            &session.line_buffer[..read],
            eof,
            session.frame_toggle,
            timestamp,
            pipe,
            controller,
        ) {
            Ok(report) => stats.payloads += report.payloads as u32,
            Err(err) => {
                stats.dropped_chunks += 1;
                if err == UvcError::ResourceExhausted {
                    log::warn!("stream: chunk {} dropped, no free URB", session.lines);
                } else {
                    log::warn!("stream: chunk {} dropped: {}", session.lines, err);
                }
                if eof {
                    if Self::send_eof(session.frame_toggle, stats, sensor, packetizer, pipe, controller) {
                        stats.late_eofs += 1;
                    } else {
                        session.pending_eof = Some(session.frame_toggle);
                    }
                }
            }
        }

        stats.chunks += 1;
        session.lines += 1;
        eof
    }

    /// A vsync edge arrived before the frame reached its declared size
    /// (compressed frames are usually shorter). Close it with an empty EOF
    /// payload so the host sees a complete frame. Returns `false` when that
    /// payload has to wait for the next interrupt.
    fn close_short_frame<S, C>(
        session: &mut CaptureSession,
        stats: &mut CaptureStatistics,
        sensor: &mut S,
        packetizer: &PayloadPacketizer,
        pipe: &Pipe,
        controller: &mut C,
    ) -> bool
    where
        S: CameraSensor + ?Sized,
        C: UsbController + ?Sized,
    {
        let sent = Self::send_eof(session.frame_toggle, stats, sensor, packetizer, pipe, controller);
        if !sent {
            session.pending_eof = Some(session.frame_toggle);
        }
        session.frame_toggle = !session.frame_toggle;
        session.lines = 0;
        session.state = CaptureState::WaitForLineData;
        stats.short_frames += 1;
        log::debug!("stream: frame closed early by vsync");
        sent
    }

    /// Header-only EOF payload for the frame with FID `toggle`.
    fn send_eof<S, C>(
        toggle: bool,
        stats: &mut CaptureStatistics,
        sensor: &mut S,
        packetizer: &PayloadPacketizer,
        pipe: &Pipe,
        controller: &mut C,
    ) -> bool
    where
        S: CameraSensor + ?Sized,
        C: UsbController + ?Sized,
    {
        match packetizer.emit(&[], true, toggle, sensor.timestamp(), pipe, controller) {
            Ok(report) => {
                stats.payloads += report.payloads as u32;
                true
            }
            Err(err) => {
                log::warn!("stream: end of frame deferred: {}", err);
                false
            }
        }
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}
