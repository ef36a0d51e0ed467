//! Test doubles for the sensor and controller seams.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use uvcam_usbd::{Endpoint, EndpointAddress, Pipe, UsbController, UsbError, UsbSpeed};

use crate::capture::CameraSensor;
use crate::format::{VideoFormat, VideoFrame};
use crate::payload::{PayloadHeader, Timestamp};
use crate::UvcError;

/// Scripted sensor: tests push bytes into the FIFO and inspect the
/// control calls made on it.
#[derive(Debug, Default)]
pub struct MockSensor {
    pub fifo: VecDeque<u8>,
    pub running: bool,
    pub interrupt_enabled: bool,
    pub vsync_armed: bool,
    pub threshold: u32,
    /// (format index, frame index) last programmed
    pub configured: Option<(u8, u8)>,
    pub flushes: u32,
    pub timestamp: Option<Timestamp>,
}

impl MockSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.fifo.extend(bytes.iter().copied());
    }
}

impl CameraSensor for MockSensor {
    fn available_bytes(&self) -> u32 {
        self.fifo.len() as u32
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.fifo.len());
        for (slot, byte) in dst.iter_mut().zip(self.fifo.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn flush(&mut self) {
        self.fifo.clear();
        self.flushes += 1;
    }

    fn set_threshold(&mut self, bytes: u32) {
        self.threshold = bytes;
    }

    fn enable_interrupt(&mut self) {
        self.interrupt_enabled = true;
    }

    fn disable_interrupt(&mut self) {
        self.interrupt_enabled = false;
    }

    fn arm_vsync(&mut self) {
        self.vsync_armed = true;
    }

    fn configure(&mut self, format: &VideoFormat, frame: &VideoFrame) -> Result<(), UvcError> {
        self.configured = Some((format.index, frame.index));
        Ok(())
    }

    fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

#[derive(Default)]
struct ControllerLog {
    transfers: Vec<(usize, Vec<u8>)>,
    outstanding: Vec<usize>,
    completer: Option<Arc<Pipe>>,
}

/// Recording controller. With [`complete_into`](Self::complete_into) it
/// completes every URB as soon as it is submitted.
pub struct MockController {
    pub speed: UsbSpeed,
    pub endpoints: Vec<Endpoint>,
    log: Mutex<ControllerLog>,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            speed: UsbSpeed::High,
            endpoints: Vec::new(),
            log: Mutex::new(ControllerLog::default()),
        }
    }

    pub fn complete_into(&self, pipe: Arc<Pipe>) {
        self.log.lock().completer = Some(pipe);
    }

    /// Bytes of every submitted URB, in submission order.
    pub fn transfers(&self) -> Vec<Vec<u8>> {
        self.log.lock().transfers.iter().map(|(_, data)| data.clone()).collect()
    }

    /// URBs submitted but not yet completed, oldest first. Clears the list.
    pub fn take_outstanding(&self) -> Vec<usize> {
        core::mem::take(&mut self.log.lock().outstanding)
    }
}

impl UsbController for MockController {
    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn create_endpoint(&mut self, endpoint: &Endpoint) -> Result<(), UsbError> {
        self.endpoints.push(*endpoint);
        Ok(())
    }

    fn submit(&mut self, _endpoint: EndpointAddress, urb: usize, data: &[u8]) -> Result<(), UsbError> {
        let mut log = self.log.lock();
        log.transfers.push((urb, data.to_vec()));
        match log.completer.clone() {
            Some(pipe) => {
                pipe.release_from_consumer(urb)?;
            }
            None => log.outstanding.push(urb),
        }
        Ok(())
    }
}

/// Splits transfers into (header, body) pairs, one payload per non-empty
/// transfer (isochronous framing).
pub fn parse_payloads(transfers: &[Vec<u8>]) -> Vec<(PayloadHeader, Vec<u8>)> {
    transfers
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| {
            let header = PayloadHeader::from_bytes(t).expect("payload header");
            (header, t[PayloadHeader::LEN..].to_vec())
        })
        .collect()
}

/// Reassembles bulk payloads: a payload ends with the first transfer
/// shorter than `packet` bytes.
pub fn reassemble_bulk(transfers: &[Vec<u8>], packet: usize) -> Vec<(PayloadHeader, Vec<u8>)> {
    let mut payloads = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for transfer in transfers {
        current.extend_from_slice(transfer);
        if transfer.len() < packet {
            if !current.is_empty() {
                let header = PayloadHeader::from_bytes(&current).expect("payload header");
                payloads.push((header, current[PayloadHeader::LEN..].to_vec()));
            }
            current.clear();
        }
    }
    payloads
}
