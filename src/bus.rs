//! Physical bus driver interface.
//!
//! The core is transport-agnostic: a driver hands it fully-received frames
//! and accepts fully-formed frames for transmission. The dispatcher
//! rewrites the identifier of every outbound frame before calling
//! [`BusDriver::send`], so drivers transmit frames verbatim.

use crate::error::BusError;
use crate::protocol::Frame;

/// A hardware (or simulated) frame transceiver.
pub trait BusDriver {
    /// Queue one frame for transmission.
    fn send(&mut self, frame: &Frame) -> Result<(), BusError>;

    /// Is at least one received frame waiting?
    fn has_frame(&self) -> bool;

    /// Take the next received frame, or `None` when the receive queue is
    /// empty.
    fn recv(&mut self) -> Option<Frame>;
}
