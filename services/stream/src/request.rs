//! # Control Request Dispatcher
//!
//! Answers the SETUP requests addressed to the video function:
//!
//! - VideoStreaming interface: PROBE / COMMIT controls
//! - VideoControl interface: power mode and request-error-code controls
//! - SET_INTERFACE / GET_INTERFACE on both interfaces
//! - CLEAR_FEATURE(ENDPOINT_HALT) on the streaming endpoint
//!
//! Every failed request stalls and leaves its code in the
//! request-error-code control, where the host can read it once.

use alloc::vec;
use alloc::vec::Vec;

use uvcam_usbd::setup::standard;
use uvcam_usbd::{EndpointAddress, Recipient, RequestDirection, RequestKind, SetupPacket, UsbSpeed};

use crate::config::{EngineConfig, Transport};
use crate::probe::{CommitOutcome, ProbeCommitNegotiator, ProbeCommitState};
use crate::streaming::{StreamRequest, StreamingController};
use crate::{entity, request_code, vc_control, vs_control, ErrorCode, UvcError, INFO_GET_SET};

/// Shortest SET_CUR(PROBE/COMMIT) data stage accepted: up to and including
/// dwFrameInterval.
const MIN_PROBE_DATA: usize = 8;

/// Successful control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// Status-stage ACK, no data
    Ack,
    /// Data stage, already truncated to wLength
    Data(Vec<u8>),
}

impl ControlResponse {
    fn data(mut bytes: Vec<u8>, w_length: u16) -> Self {
        bytes.truncate(w_length as usize);
        ControlResponse::Data(bytes)
    }
}

pub struct ControlDispatcher {
    control_interface: u8,
    streaming_interface: u8,
    streaming_endpoint: EndpointAddress,
    transport: Transport,
    streaming_alt: u8,
    error_code: ErrorCode,
}

impl ControlDispatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            control_interface: config.control_interface,
            streaming_interface: config.streaming_interface,
            streaming_endpoint: config.streaming_endpoint,
            transport: config.transport,
            streaming_alt: 0,
            error_code: ErrorCode::NoError,
        }
    }

    /// Value of the request-error-code control.
    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    /// Selected alternate setting of the streaming interface.
    pub fn streaming_alt(&self) -> u8 {
        self.streaming_alt
    }

    /// Bus reset: zero-bandwidth setting, no error.
    pub fn reset(&mut self) {
        self.streaming_alt = 0;
        self.error_code = ErrorCode::NoError;
    }

    /// Handles one SETUP request. `data` is the OUT data stage (empty for
    /// IN requests).
    pub fn dispatch(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        speed: UsbSpeed,
        negotiator: &mut ProbeCommitNegotiator,
        streaming: &StreamingController,
    ) -> Result<ControlResponse, UvcError> {
        let result = match (setup.kind(), setup.recipient()) {
            (RequestKind::Standard, Recipient::Interface) => self.standard_interface(setup, streaming),
            (RequestKind::Standard, Recipient::Endpoint) => self.standard_endpoint(setup, streaming),
            (RequestKind::Class, Recipient::Interface) => {
                let interface = setup.index_low();
                if interface == self.streaming_interface {
                    self.video_streaming(setup, data, speed, negotiator, streaming)
                } else if interface == self.control_interface {
                    self.video_control(setup)
                } else {
                    Err(UvcError::Protocol(ErrorCode::InvalidRequest))
                }
            }
            _ => Err(UvcError::Protocol(ErrorCode::InvalidRequest)),
        };

        match &result {
            Ok(_) => self.error_code = ErrorCode::NoError,
            Err(err) => {
                self.error_code = err.code();
                log::debug!(
                    "stream: request {:#04x}/{:#04x} stalled: {}",
                    setup.bm_request_type,
                    setup.b_request,
                    err
                );
            }
        }
        result
    }

    // =========================================================================
    // Standard requests
    // =========================================================================

    fn standard_interface(
        &mut self,
        setup: &SetupPacket,
        streaming: &StreamingController,
    ) -> Result<ControlResponse, UvcError> {
        let interface = setup.index_low();
        match setup.b_request {
            standard::SET_INTERFACE => {
                let alt = setup.w_value;
                if interface == self.control_interface {
                    return if alt == 0 {
                        Ok(ControlResponse::Ack)
                    } else {
                        Err(UvcError::Protocol(ErrorCode::InvalidRequest))
                    };
                }
                if interface != self.streaming_interface {
                    return Err(UvcError::Protocol(ErrorCode::InvalidRequest));
                }

                let max_alt = if self.transport.is_isochronous() { 1 } else { 0 };
                if alt > max_alt {
                    return Err(UvcError::Protocol(ErrorCode::InvalidRequest));
                }
                let alt = alt as u8;
                if alt != self.streaming_alt {
                    self.streaming_alt = alt;
                    let request = if alt == 0 { StreamRequest::Stop } else { StreamRequest::Start };
                    log::info!("stream: alternate setting {}", alt);
                    streaming.request(request);
                }
                Ok(ControlResponse::Ack)
            }
            standard::GET_INTERFACE => {
                if interface == self.control_interface {
                    Ok(ControlResponse::data(vec![0], setup.w_length))
                } else if interface == self.streaming_interface {
                    Ok(ControlResponse::data(vec![self.streaming_alt], setup.w_length))
                } else {
                    Err(UvcError::Protocol(ErrorCode::InvalidRequest))
                }
            }
            _ => Err(UvcError::Protocol(ErrorCode::InvalidRequest)),
        }
    }

    fn standard_endpoint(
        &mut self,
        setup: &SetupPacket,
        streaming: &StreamingController,
    ) -> Result<ControlResponse, UvcError> {
        if setup.b_request == standard::CLEAR_FEATURE
            && setup.direction() == RequestDirection::HostToDevice
            && setup.w_value == standard::ENDPOINT_HALT
            && setup.index_low() == self.streaming_endpoint.0
        {
            log::info!("stream: halt cleared on ep {:#04x}", self.streaming_endpoint.0);
            streaming.request(StreamRequest::Stop);
            return Ok(ControlResponse::Ack);
        }
        Err(UvcError::Protocol(ErrorCode::InvalidRequest))
    }

    // =========================================================================
    // VideoStreaming interface
    // =========================================================================

    fn video_streaming(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        speed: UsbSpeed,
        negotiator: &mut ProbeCommitNegotiator,
        streaming: &StreamingController,
    ) -> Result<ControlResponse, UvcError> {
        let selector = setup.value_high();
        if selector != vs_control::PROBE && selector != vs_control::COMMIT {
            return Err(UvcError::Protocol(ErrorCode::InvalidControl));
        }
        let is_probe = selector == vs_control::PROBE;

        if setup.direction() == RequestDirection::HostToDevice {
            if setup.b_request != request_code::SET_CUR {
                return Err(UvcError::Protocol(ErrorCode::InvalidRequest));
            }
            let data = &data[..data.len().min(setup.w_length as usize)];
            if data.len() < MIN_PROBE_DATA {
                return Err(UvcError::Protocol(ErrorCode::InvalidRequest));
            }
            let candidate = negotiator.probe().overlay(data);

            if is_probe {
                negotiator.set_probe(&candidate, speed)?;
                return Ok(ControlResponse::Ack);
            }
            let restart = match negotiator.commit(&candidate, speed)? {
                CommitOutcome::StartStreaming => true,
                // Bandwidth already granted: apply the new commit now
                CommitOutcome::AwaitAlternateSetting => self.streaming_alt != 0,
            };
            if restart {
                streaming.request(StreamRequest::Start);
            }
            return Ok(ControlResponse::Ack);
        }

        let record = match setup.b_request {
            request_code::GET_INFO => return Ok(ControlResponse::data(vec![INFO_GET_SET], setup.w_length)),
            request_code::GET_LEN => {
                let len = (ProbeCommitState::SIZE as u16).to_le_bytes();
                return Ok(ControlResponse::data(len.to_vec(), setup.w_length));
            }
            request_code::GET_RES => return Err(UvcError::Protocol(ErrorCode::InvalidControl)),
            request_code::GET_CUR if is_probe => *negotiator.probe(),
            request_code::GET_CUR => negotiator.commit_state().copied().unwrap_or_default(),
            request_code::GET_MIN | request_code::GET_MAX if is_probe => negotiator
                .min_max(speed)
                .map_err(|err| UvcError::Protocol(err.code()))?,
            request_code::GET_DEF if is_probe => {
                if speed != UsbSpeed::High {
                    return Err(UvcError::Protocol(ErrorCode::InvalidRequest));
                }
                negotiator.get_default(None)?
            }
            _ => return Err(UvcError::Protocol(ErrorCode::InvalidRequest)),
        };
        Ok(ControlResponse::data(record.to_bytes().to_vec(), setup.w_length))
    }

    // =========================================================================
    // VideoControl interface
    // =========================================================================

    fn video_control(&mut self, setup: &SetupPacket) -> Result<ControlResponse, UvcError> {
        if setup.direction() == RequestDirection::HostToDevice {
            // No VideoControl control is settable
            return Err(UvcError::Protocol(ErrorCode::InvalidRequest));
        }

        match setup.b_request {
            request_code::GET_INFO => Ok(ControlResponse::data(vec![INFO_GET_SET], setup.w_length)),
            request_code::GET_CUR | request_code::GET_MIN | request_code::GET_MAX | request_code::GET_DEF => {
                match setup.index_high() {
                    entity::INTERFACE => match setup.value_high() {
                        vc_control::VIDEO_POWER_MODE => Ok(ControlResponse::data(vec![0], setup.w_length)),
                        vc_control::REQUEST_ERROR_CODE => {
                            // Cleared by the success path in `dispatch`
                            Ok(ControlResponse::data(vec![self.error_code as u8], setup.w_length))
                        }
                        _ => Err(UvcError::Protocol(ErrorCode::InvalidControl)),
                    },
                    entity::CAMERA_TERMINAL | entity::PROCESSING_UNIT | entity::OUTPUT_TERMINAL => {
                        Err(UvcError::Protocol(ErrorCode::InvalidControl))
                    }
                    _ => Err(UvcError::Protocol(ErrorCode::InvalidUnit)),
                }
            }
            request_code::GET_RES | request_code::GET_LEN => Ok(ControlResponse::data(vec![0], setup.w_length)),
            _ => Err(UvcError::Protocol(ErrorCode::InvalidRequest)),
        }
    }
}
