//! # Streaming Controller
//!
//! Main-loop state machine that turns start/stop requests into sensor and
//! capture-pipeline reconfiguration.
//!
//! ```text
//!        Start (commit ok)          first vsync
//!   Off ───────────────► Starting ─────────────► Active
//!    ▲                      │                      │
//!    └────── Stopping ◄─────┴──────── Stop ────────┘
//! ```
//!
//! Control handlers run in the USB interrupt and only *post* a request
//! through a single atomic slot; the latest request wins. `poll` applies
//! it from the main loop.

use core::sync::atomic::{AtomicU8, Ordering};

use uvcam_usbd::Pipe;

use crate::capture::{CameraSensor, CapturePipeline, CaptureSession, FrameSync};
use crate::format::FormatTable;
use crate::payload::PayloadPacketizer;
use crate::probe::ProbeCommitState;

/// Pending state-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamRequest {
    None = 0,
    Start = 1,
    Stop = 2,
}

impl StreamRequest {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => StreamRequest::Start,
            2 => StreamRequest::Stop,
            _ => StreamRequest::None,
        }
    }
}

/// Streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Off,
    Starting,
    Active,
    Stopping,
}

/// Everything `poll` touches besides the controller itself.
pub struct StreamContext<'a, S: CameraSensor + ?Sized> {
    /// Committed configuration, if any
    pub commit: Option<&'a ProbeCommitState>,
    pub formats: &'a FormatTable,
    pub capture: &'a mut CapturePipeline,
    pub packetizer: &'a mut PayloadPacketizer,
    pub sensor: &'a mut S,
    pub sync: &'a FrameSync,
    pub pipe: &'a Pipe,
}

pub struct StreamingController {
    request: AtomicU8,
    state: StreamState,
    /// Vsync count when the stream was started
    start_mark: u32,
    starts: u32,
}

impl StreamingController {
    pub const fn new() -> Self {
        Self {
            request: AtomicU8::new(StreamRequest::None as u8),
            state: StreamState::Off,
            start_mark: 0,
            starts: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Streams started since power-up.
    pub fn starts(&self) -> u32 {
        self.starts
    }

    /// Posts a request for the next `poll`. Safe from interrupt context.
    pub fn request(&self, request: StreamRequest) {
        self.request.store(request as u8, Ordering::Release);
    }

    pub fn pending(&self) -> StreamRequest {
        StreamRequest::from_raw(self.request.load(Ordering::Acquire))
    }

    fn take_request(&self) -> StreamRequest {
        StreamRequest::from_raw(self.request.swap(StreamRequest::None as u8, Ordering::Acquire))
    }

    /// One main-loop iteration.
    pub fn poll<S: CameraSensor + ?Sized>(&mut self, mut ctx: StreamContext<'_, S>) -> StreamState {
        match self.take_request() {
            StreamRequest::Start => {
                if self.state != StreamState::Off {
                    self.stop(&mut ctx);
                }
                self.start(&mut ctx);
            }
            StreamRequest::Stop => {
                if self.state != StreamState::Off {
                    self.stop(&mut ctx);
                }
            }
            StreamRequest::None => {}
        }

        if self.state == StreamState::Starting {
            if ctx.sync.count() != self.start_mark {
                self.state = StreamState::Active;
                log::info!("stream: active");
            } else {
                ctx.sensor.flush();
            }
        }

        self.state
    }

    fn start<S: CameraSensor + ?Sized>(&mut self, ctx: &mut StreamContext<'_, S>) {
        let Some(commit) = ctx.commit else {
            log::debug!("stream: start ignored, nothing committed");
            return;
        };
        let Some((format, frame)) = ctx.formats.lookup(commit.format_index, commit.frame_index) else {
            log::warn!(
                "stream: committed format {} frame {} not in table",
                commit.format_index,
                commit.frame_index
            );
            return;
        };
        if let Err(err) = ctx.sensor.configure(format, frame) {
            log::warn!("stream: sensor configuration failed: {}", err);
            return;
        }

        let session = CaptureSession::new(frame, commit);
        ctx.packetizer.configure(commit.max_payload_transfer_size);
        ctx.sensor.set_threshold(session.threshold);
        ctx.sync.clear();
        self.start_mark = ctx.sync.count();
        ctx.capture.start(session);

        ctx.sensor.arm_vsync();
        ctx.sensor.enable_interrupt();
        ctx.sensor.start();

        self.state = StreamState::Starting;
        self.starts += 1;
        log::info!(
            "stream: starting {}x{} ({} byte chunks)",
            frame.width,
            frame.height,
            frame.line_length
        );
    }

    fn stop<S: CameraSensor + ?Sized>(&mut self, ctx: &mut StreamContext<'_, S>) {
        self.state = StreamState::Stopping;

        ctx.sensor.disable_interrupt();
        ctx.sensor.stop();
        ctx.sensor.flush();
        ctx.capture.stop();
        ctx.pipe.purge();
        ctx.sync.clear();

        self.state = StreamState::Off;
        log::info!("stream: stopped");
    }
}

impl Default for StreamingController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureState;
    use crate::config::EngineConfig;
    use crate::probe::ProbeCommitNegotiator;
    use crate::testing::MockSensor;

    struct Rig {
        controller: StreamingController,
        commit: Option<ProbeCommitState>,
        formats: FormatTable,
        capture: CapturePipeline,
        packetizer: PayloadPacketizer,
        sensor: MockSensor,
        sync: FrameSync,
        pipe: Pipe,
    }

    impl Rig {
        fn new() -> Self {
            let config = EngineConfig::default();
            Self {
                controller: StreamingController::new(),
                commit: None,
                formats: config.formats,
                capture: CapturePipeline::new(),
                packetizer: PayloadPacketizer::new(&config),
                sensor: MockSensor::new(),
                sync: FrameSync::new(),
                pipe: Pipe::new(config.streaming_endpoint, 4, 1024),
            }
        }

        fn committed() -> Self {
            let mut rig = Self::new();
            let neg = ProbeCommitNegotiator::new(&EngineConfig::default());
            rig.commit = Some(*neg.probe());
            rig
        }

        fn poll(&mut self) -> StreamState {
            self.controller.poll(StreamContext {
                commit: self.commit.as_ref(),
                formats: &self.formats,
                capture: &mut self.capture,
                packetizer: &mut self.packetizer,
                sensor: &mut self.sensor,
                sync: &self.sync,
                pipe: &self.pipe,
            })
        }
    }

    #[test]
    fn test_start_without_commit_is_noop() {
        let mut rig = Rig::new();
        rig.controller.request(StreamRequest::Start);
        assert_eq!(rig.poll(), StreamState::Off);
        assert!(!rig.sensor.running);
        assert_eq!(rig.capture.state(), CaptureState::Idle);
        assert_eq!(rig.controller.pending(), StreamRequest::None);
    }

    #[test]
    fn test_start_waits_for_vsync() {
        let mut rig = Rig::committed();
        rig.controller.request(StreamRequest::Start);
        assert_eq!(rig.poll(), StreamState::Starting);
        assert!(rig.sensor.running);
        assert!(rig.sensor.interrupt_enabled);
        assert!(rig.sensor.vsync_armed);
        assert_eq!(rig.sensor.threshold, 640);
        assert_eq!(rig.sensor.configured, Some((1, 1)));
        assert_eq!(rig.packetizer.max_payload(), 652);
        assert_eq!(rig.capture.state(), CaptureState::WaitForFrameStart);

        // Still no vsync: flush and keep waiting
        rig.sensor.push_bytes(&[0; 100]);
        assert_eq!(rig.poll(), StreamState::Starting);
        assert!(rig.sensor.fifo.is_empty());

        rig.sync.signal();
        assert_eq!(rig.poll(), StreamState::Active);
        assert_eq!(rig.controller.starts(), 1);
    }

    #[test]
    fn test_stop_within_one_poll() {
        let mut rig = Rig::committed();
        rig.controller.request(StreamRequest::Start);
        rig.poll();
        rig.sync.signal();
        rig.poll();

        rig.sensor.push_bytes(&[1; 64]);
        rig.controller.request(StreamRequest::Stop);
        assert_eq!(rig.poll(), StreamState::Off);
        assert!(!rig.sensor.running);
        assert!(!rig.sensor.interrupt_enabled);
        assert!(rig.sensor.fifo.is_empty());
        assert_eq!(rig.capture.state(), CaptureState::Idle);
        assert_eq!(rig.pipe.occupancy().free, 4);
    }

    #[test]
    fn test_restart_applies_new_commit() {
        let mut rig = Rig::committed();
        rig.controller.request(StreamRequest::Start);
        rig.poll();
        rig.sync.signal();
        rig.poll();

        let mut next = rig.commit.unwrap();
        next.format_index = 2;
        next.frame_index = 3;
        next.max_video_frame_size = 24_960;
        next.max_payload_transfer_size = 972;
        rig.commit = Some(next);

        rig.controller.request(StreamRequest::Start);
        assert_eq!(rig.poll(), StreamState::Starting);
        assert_eq!(rig.sensor.configured, Some((2, 3)));
        assert_eq!(rig.sensor.threshold, 960);
        assert_eq!(rig.controller.starts(), 2);
    }

    #[test]
    fn test_latest_request_wins() {
        let mut rig = Rig::committed();
        rig.controller.request(StreamRequest::Start);
        rig.controller.request(StreamRequest::Stop);
        assert_eq!(rig.poll(), StreamState::Off);
        assert!(!rig.sensor.running);
    }
}
