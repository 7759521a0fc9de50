//! Fragmented long-message service interface.
//!
//! Payloads larger than one frame travel as DTXC fragments. Reassembly is a
//! sibling subsystem; the dispatcher only forwards each DTXC frame to the
//! attached handler, if any.

use crate::protocol::Frame;

/// Receiver for long-message fragments.
pub trait FragmentHandler {
    /// Called once per received DTXC frame, in arrival order.
    fn on_fragment(&mut self, frame: &Frame);
}
