//! Host callback registry.
//!
//! Hosts observe the core through four optional hooks:
//! - an accessory event handler, plain or extended form
//! - a frame observer with an optional opcode allow-list
//! - a transmit observer, called for every outbound frame
//!
//! All callbacks run synchronously on the dispatcher's thread and must not
//! re-enter `process()`. A callback that needs a frame beyond its own
//! invocation must copy it (frames are `Copy`).

use crate::protocol::Frame;

/// Plain accessory event callback: stored-entry index and the frame.
pub type EventHandler = Box<dyn FnMut(u8, &Frame)>;

/// Extended accessory event callback: additionally receives the polarity
/// and the entry's first event-variable value (0 when none are configured).
pub type EventHandlerEx = Box<dyn FnMut(u8, &Frame, bool, u8)>;

/// Frame observer callback.
pub type FrameObserver = Box<dyn FnMut(&Frame)>;

/// A frame observer with its allow-list. An empty list accepts every
/// opcode.
pub struct FrameFilter {
    pub(crate) callback: FrameObserver,
    pub(crate) opcodes: Vec<u8>,
}

impl FrameFilter {
    pub fn new(callback: FrameObserver, opcodes: Vec<u8>) -> Self {
        Self { callback, opcodes }
    }

    /// Does the allow-list admit this opcode (`None` for zero-length
    /// frames)?
    pub fn accepts(&self, opcode: Option<u8>) -> bool {
        if self.opcodes.is_empty() {
            return true;
        }
        matches!(opcode, Some(opc) if self.opcodes.contains(&opc))
    }
}

/// The set of registered host callbacks.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) event: Option<EventHandler>,
    pub(crate) event_ex: Option<EventHandlerEx>,
    pub(crate) filter: Option<FrameFilter>,
    pub(crate) transmit: Option<FrameObserver>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is either accessory event handler registered?
    pub fn has_event_handler(&self) -> bool {
        self.event.is_some() || self.event_ex.is_some()
    }
}
