//! # Streaming Engine
//!
//! Single owner of the negotiation state, the capture pipeline, the
//! transfer-buffer pipe and the two hardware collaborators. The integrator
//! creates one engine and routes each hardware event to its entry point:
//!
//! | Context              | Entry point          |
//! |----------------------|----------------------|
//! | USB control (EP0)    | `handle_setup`       |
//! | USB bus events       | `suspend`, `bus_reset` |
//! | USB completion       | `transfer_complete`  |
//! | Camera vsync         | `vsync_interrupt`    |
//! | Camera capture       | `capture_interrupt`  |
//! | Main loop            | `poll`               |
//!
//! The vsync and completion paths only touch atomics, so the matching
//! [`FrameSync`] and [`Pipe`] handles can also be cloned out and called
//! directly from interrupt handlers.

use alloc::sync::Arc;

use uvcam_usbd::{Occupancy, Pipe, PipeStatistics, SetupPacket, UsbController};

use crate::capture::{CameraSensor, CapturePipeline, CaptureState, CaptureStatistics, FrameSync};
use crate::config::EngineConfig;
use crate::payload::PayloadPacketizer;
use crate::probe::ProbeCommitNegotiator;
use crate::request::{ControlDispatcher, ControlResponse};
use crate::streaming::{StreamContext, StreamRequest, StreamState, StreamingController};
use crate::{ErrorCode, UvcError};

/// Engine-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatistics {
    pub capture: CaptureStatistics,
    pub pipe: PipeStatistics,
    pub occupancy: Occupancy,
    /// Streams started since power-up
    pub stream_starts: u32,
    pub bus_resets: u32,
}

pub struct StreamingEngine<S: CameraSensor, C: UsbController> {
    config: EngineConfig,
    sensor: S,
    controller: C,
    negotiator: ProbeCommitNegotiator,
    dispatcher: ControlDispatcher,
    streaming: StreamingController,
    capture: CapturePipeline,
    packetizer: PayloadPacketizer,
    pipe: Arc<Pipe>,
    sync: Arc<FrameSync>,
    bus_resets: u32,
}

impl<S: CameraSensor, C: UsbController> StreamingEngine<S, C> {
    /// Validates `config`, creates the streaming endpoint and allocates its
    /// URBs.
    pub fn new(config: EngineConfig, sensor: S, mut controller: C) -> Result<Self, UvcError> {
        config.validate()?;

        let endpoint = config.endpoint(controller.speed());
        controller.create_endpoint(&endpoint)?;
        let pipe = Arc::new(Pipe::new(endpoint.address, config.urb_count, config.urb_capacity()));

        log::info!(
            "stream: engine ready, {:?} on ep {:#04x}, {} formats",
            config.transport,
            config.streaming_endpoint.0,
            config.formats.formats().len()
        );

        Ok(Self {
            negotiator: ProbeCommitNegotiator::new(&config),
            dispatcher: ControlDispatcher::new(&config),
            streaming: StreamingController::new(),
            capture: CapturePipeline::new(),
            packetizer: PayloadPacketizer::new(&config),
            pipe,
            sync: Arc::new(FrameSync::new()),
            bus_resets: 0,
            config,
            sensor,
            controller,
        })
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Control request on EP0. `data` is the OUT data stage, if any. An
    /// `Err` means the request must be stalled.
    pub fn handle_setup(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<ControlResponse, UvcError> {
        let speed = self.controller.speed();
        self.dispatcher
            .dispatch(setup, data, speed, &mut self.negotiator, &self.streaming)
    }

    /// Raw SETUP bytes as delivered by the controller.
    pub fn handle_setup_bytes(&mut self, raw: &[u8], data: &[u8]) -> Result<ControlResponse, UvcError> {
        let setup = SetupPacket::from_bytes(raw).ok_or(UvcError::Protocol(ErrorCode::InvalidRequest))?;
        self.handle_setup(&setup, data)
    }

    /// Vertical-sync edge.
    pub fn vsync_interrupt(&self) {
        self.sync.signal();
    }

    /// Camera FIFO reached its threshold.
    pub fn capture_interrupt(&mut self) {
        self.capture.on_capture_interrupt(
            &self.sync,
            &mut self.sensor,
            &self.packetizer,
            &self.pipe,
            &mut self.controller,
        );
    }

    /// The controller drained URB `urb`. Returns `false` for completions
    /// that arrive after the stream was stopped.
    pub fn transfer_complete(&self, urb: usize) -> Result<bool, UvcError> {
        Ok(self.pipe.release_from_consumer(urb)?)
    }

    /// USB suspend: stop streaming on the next poll.
    pub fn suspend(&mut self) {
        log::info!("stream: suspend");
        self.streaming.request(StreamRequest::Stop);
    }

    /// USB bus reset: stop streaming now and forget all negotiation state.
    /// The endpoint is re-created for the new speed; the URB pool is kept,
    /// its sizing does not depend on speed.
    pub fn bus_reset(&mut self) {
        self.bus_resets += 1;
        self.negotiator.reset();
        self.dispatcher.reset();
        self.streaming.request(StreamRequest::Stop);
        self.poll();

        let endpoint = self.config.endpoint(self.controller.speed());
        if let Err(err) = self.controller.create_endpoint(&endpoint) {
            log::warn!("stream: endpoint re-creation failed after reset: {}", err);
        }
        log::info!("stream: bus reset");
    }

    /// Main-loop iteration: applies pending start/stop requests.
    pub fn poll(&mut self) -> StreamState {
        self.streaming.poll(StreamContext {
            commit: self.negotiator.commit_state(),
            formats: &self.config.formats,
            capture: &mut self.capture,
            packetizer: &mut self.packetizer,
            sensor: &mut self.sensor,
            sync: &self.sync,
            pipe: &self.pipe,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Handle for the completion interrupt.
    pub fn pipe(&self) -> Arc<Pipe> {
        Arc::clone(&self.pipe)
    }

    /// Handle for the vsync interrupt.
    pub fn frame_sync(&self) -> Arc<FrameSync> {
        Arc::clone(&self.sync)
    }

    pub fn state(&self) -> StreamState {
        self.streaming.state()
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn negotiator(&self) -> &ProbeCommitNegotiator {
        &self.negotiator
    }

    pub fn error_code(&self) -> ErrorCode {
        self.dispatcher.error_code()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn stats(&self) -> EngineStatistics {
        EngineStatistics {
            capture: self.capture.stats(),
            pipe: self.pipe.stats(),
            occupancy: self.pipe.occupancy(),
            stream_starts: self.streaming.starts(),
            bus_resets: self.bus_resets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::INTERVAL_15FPS;
    use crate::probe::ProbeCommitState;
    use crate::testing::{parse_payloads, reassemble_bulk, MockController, MockSensor};
    use crate::{request_code, vc_control, vs_control};
    use alloc::vec::Vec;
    use uvcam_usbd::setup::standard;
    use uvcam_usbd::{Recipient, RequestDirection, RequestKind, UsbSpeed};

    type Engine = StreamingEngine<MockSensor, MockController>;

    fn engine(config: EngineConfig) -> Engine {
        let engine = StreamingEngine::new(config, MockSensor::new(), MockController::new()).unwrap();
        engine.controller().complete_into(engine.pipe());
        engine
    }

    fn set_cur(selector: u8) -> SetupPacket {
        SetupPacket::new(
            RequestDirection::HostToDevice,
            RequestKind::Class,
            Recipient::Interface,
            request_code::SET_CUR,
            (selector as u16) << 8,
            1,
            ProbeCommitState::SIZE as u16,
        )
    }

    fn negotiate(engine: &mut Engine, format: u8, frame: u8) {
        let mut wanted = *engine.negotiator().probe();
        wanted.format_index = format;
        wanted.frame_index = frame;
        let raw = wanted.to_bytes();
        engine.handle_setup(&set_cur(vs_control::PROBE), &raw).unwrap();
        let probe = engine.negotiator().probe().to_bytes();
        engine.handle_setup(&set_cur(vs_control::COMMIT), &probe).unwrap();
    }

    fn set_alt(engine: &mut Engine, alt: u16) {
        let setup = SetupPacket::new(
            RequestDirection::HostToDevice,
            RequestKind::Standard,
            Recipient::Interface,
            standard::SET_INTERFACE,
            alt,
            1,
            0,
        );
        engine.handle_setup(&setup, &[]).unwrap();
    }

    /// Brings an isochronous engine to `Active` on uncompressed QVGA.
    fn streaming_qvga() -> Engine {
        let mut engine = engine(EngineConfig::default());
        negotiate(&mut engine, 1, 1);
        set_alt(&mut engine, 1);
        assert_eq!(engine.poll(), StreamState::Starting);
        engine.vsync_interrupt();
        assert_eq!(engine.poll(), StreamState::Active);
        engine
    }

    fn deliver_frame(engine: &mut Engine, line_len: usize, lines: usize) {
        engine.vsync_interrupt();
        for line in 0..lines {
            engine.sensor_mut().push_bytes(&alloc::vec![line as u8; line_len]);
            engine.capture_interrupt();
        }
    }

    #[test]
    fn test_engine_creates_endpoint() {
        let engine = engine(EngineConfig::default());
        assert_eq!(engine.controller().endpoints.len(), 1);
        assert_eq!(engine.controller().endpoints[0].max_packet_size, 1024);
        assert_eq!(engine.pipe().capacity(), 4);
        assert_eq!(engine.state(), StreamState::Off);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig { urb_count: 0, ..EngineConfig::default() };
        assert!(StreamingEngine::new(config, MockSensor::new(), MockController::new()).is_err());
    }

    #[test]
    fn test_qvga_frame_scenario() {
        let mut engine = streaming_qvga();
        assert_eq!(engine.sensor().threshold, 640);

        deliver_frame(&mut engine, 640, 240);
        deliver_frame(&mut engine, 640, 240);

        let payloads = parse_payloads(&engine.controller().transfers());
        assert_eq!(payloads.len(), 480);
        let eof_at: Vec<usize> = payloads
            .iter()
            .enumerate()
            .filter(|(_, (h, _))| h.end_of_frame())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(eof_at, [239, 479]);
        assert!(payloads[..240].iter().all(|(h, _)| !h.frame_toggle()));
        assert!(payloads[240..].iter().all(|(h, _)| h.frame_toggle()));

        let body: usize = payloads.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(body, 2 * 153_600);
        assert_eq!(engine.stats().capture.frames, 2);
        assert_eq!(engine.stats().occupancy.total(), 4);
    }

    #[test]
    fn test_clear_feature_stops_within_one_poll() {
        let mut engine = streaming_qvga();
        deliver_frame(&mut engine, 640, 10);
        let sent = engine.controller().transfers().len();

        let clear = SetupPacket::new(
            RequestDirection::HostToDevice,
            RequestKind::Standard,
            Recipient::Endpoint,
            standard::CLEAR_FEATURE,
            standard::ENDPOINT_HALT,
            0x81,
            0,
        );
        engine.handle_setup(&clear, &[]).unwrap();
        assert_eq!(engine.poll(), StreamState::Off);
        assert!(!engine.sensor().interrupt_enabled);
        assert!(!engine.sensor().running);

        // A late capture interrupt delivers nothing
        engine.sensor_mut().push_bytes(&[0; 640]);
        engine.capture_interrupt();
        assert_eq!(engine.controller().transfers().len(), sent);
        assert_eq!(engine.capture_state(), CaptureState::Idle);
    }

    #[test]
    fn test_alt_zero_and_suspend_stop() {
        let mut engine = streaming_qvga();
        set_alt(&mut engine, 0);
        assert_eq!(engine.poll(), StreamState::Off);

        set_alt(&mut engine, 1);
        assert_eq!(engine.poll(), StreamState::Starting);
        engine.suspend();
        assert_eq!(engine.poll(), StreamState::Off);
    }

    #[test]
    fn test_alt_setting_without_commit_stays_off() {
        let mut engine = engine(EngineConfig::default());
        set_alt(&mut engine, 1);
        assert_eq!(engine.poll(), StreamState::Off);
        assert!(!engine.sensor().running);
    }

    #[test]
    fn test_bulk_commit_starts_stream() {
        let mut engine = engine(EngineConfig::bulk());
        negotiate(&mut engine, 1, 2);
        assert_eq!(engine.poll(), StreamState::Starting);
        engine.vsync_interrupt();
        assert_eq!(engine.poll(), StreamState::Active);

        deliver_frame(&mut engine, 1280, 480);
        let payloads = reassemble_bulk(&engine.controller().transfers(), 512);
        assert_eq!(payloads.len(), 480);
        assert!(payloads.iter().all(|(_, b)| b.len() == 1280));
        assert!(payloads[479].0.end_of_frame());
        assert_eq!(payloads.iter().filter(|(h, _)| h.end_of_frame()).count(), 1);
    }

    #[test]
    fn test_full_speed_commit_fails_and_device_stays_usable() {
        let mut engine = engine(EngineConfig::bulk());
        engine.controller_mut().speed = UsbSpeed::Full;
        let probe = *engine.negotiator().probe();
        let result = engine.handle_setup(&set_cur(vs_control::COMMIT), &probe.to_bytes());
        assert_eq!(result, Err(UvcError::ConfigurationRejected(ErrorCode::InvalidRequest)));
        assert!(engine.negotiator().commit_state().is_none());
        assert_eq!(engine.error_code(), ErrorCode::InvalidRequest);

        engine.controller_mut().speed = UsbSpeed::High;
        negotiate(&mut engine, 1, 1);
        assert!(engine.negotiator().commit_state().is_some());
    }

    #[test]
    fn test_iso_vga_uncompressed_out_of_range() {
        let mut engine = engine(EngineConfig::default());
        let mut wanted = *engine.negotiator().probe();
        wanted.frame_index = 2;
        wanted.frame_interval = INTERVAL_15FPS;
        let result = engine.handle_setup(&set_cur(vs_control::PROBE), &wanted.to_bytes());
        assert_eq!(result, Err(UvcError::ConfigurationRejected(ErrorCode::OutOfRange)));

        let read_error = SetupPacket::new(
            RequestDirection::DeviceToHost,
            RequestKind::Class,
            Recipient::Interface,
            request_code::GET_CUR,
            (vc_control::REQUEST_ERROR_CODE as u16) << 8,
            0,
            1,
        );
        assert_eq!(
            engine.handle_setup(&read_error, &[]),
            Ok(ControlResponse::Data(alloc::vec![ErrorCode::OutOfRange as u8]))
        );
    }

    #[test]
    fn test_bus_reset_clears_negotiation() {
        let mut engine = streaming_qvga();
        engine.bus_reset();
        assert_eq!(engine.state(), StreamState::Off);
        assert!(engine.negotiator().commit_state().is_none());
        assert_eq!(engine.stats().bus_resets, 1);

        // alternate setting was reset too, so alt 1 is a change again but
        // there is nothing committed to start
        set_alt(&mut engine, 1);
        assert_eq!(engine.poll(), StreamState::Off);
    }

    #[test]
    fn test_bus_reset_recreates_endpoint_for_new_speed() {
        let mut engine = engine(EngineConfig::default());
        let pipe = engine.pipe();
        engine.controller_mut().speed = UsbSpeed::Full;
        engine.bus_reset();

        let endpoints = &engine.controller().endpoints;
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].max_packet_size, 512);
        assert_eq!(endpoints[1].address, engine.pipe().address());
        assert!(Arc::ptr_eq(&pipe, &engine.pipe()));
        assert_eq!(engine.pipe().urb_capacity(), engine.config().urb_capacity());
    }

    #[test]
    fn test_stale_completion_after_stop() {
        let mut engine = StreamingEngine::new(EngineConfig::default(), MockSensor::new(), MockController::new())
            .unwrap();
        negotiate(&mut engine, 1, 1);
        set_alt(&mut engine, 1);
        engine.poll();
        engine.vsync_interrupt();
        engine.poll();

        deliver_frame(&mut engine, 640, 2);
        let in_flight = engine.controller().take_outstanding();
        assert_eq!(in_flight.len(), 2);
        assert_eq!(engine.stats().occupancy.consumer, 2);

        set_alt(&mut engine, 0);
        engine.poll();
        assert_eq!(engine.stats().occupancy.free, 4);
        for urb in in_flight {
            assert_eq!(engine.transfer_complete(urb), Ok(false));
        }
        assert_eq!(engine.stats().pipe.stale_completions, 2);
    }

    #[test]
    fn test_raw_setup_bytes() {
        let mut engine = engine(EngineConfig::default());
        let raw = [0xA1, request_code::GET_LEN, 0x00, vs_control::PROBE, 0x01, 0x00, 0x02, 0x00];
        assert_eq!(engine.handle_setup_bytes(&raw, &[]), Ok(ControlResponse::Data(alloc::vec![34, 0])));
        assert!(engine.handle_setup_bytes(&raw[..4], &[]).is_err());
    }
}
