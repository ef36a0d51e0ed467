//! Device-controller seam.
//!
//! The class engines never touch controller registers. Everything they
//! need from the hardware driver goes through [`UsbController`]; the
//! driver in turn reports drained transfers back through
//! [`Pipe::release_from_consumer`](crate::pipe::Pipe::release_from_consumer)
//! from its completion interrupt.

use crate::{Endpoint, EndpointAddress, UsbError, UsbSpeed};

/// Device-side USB controller driver.
pub trait UsbController {
    /// Negotiated bus speed of the current connection.
    fn speed(&self) -> UsbSpeed;

    /// Configures an endpoint in hardware.
    fn create_endpoint(&mut self, endpoint: &Endpoint) -> Result<(), UsbError>;

    /// Queues `data` from URB `urb` for transmission on `endpoint`.
    ///
    /// A zero-length `data` requests a zero-length packet. Completion is
    /// reported asynchronously with the same `urb` identifier.
    fn submit(&mut self, endpoint: EndpointAddress, urb: usize, data: &[u8]) -> Result<(), UsbError>;
}
