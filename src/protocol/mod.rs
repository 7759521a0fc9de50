//! Protocol module — identifier encoding, operation codes, and frame types.
//!
//! This module implements the fixed-format wire layer:
//! - 11-bit identifier encoding (4-bit priority + 7-bit local id)
//! - operation-code constants and accessory classifiers
//! - the [`Frame`] value type with typed accessors
//! - the overwrite-on-full [`CircularFrameBuffer`] behind the loopback path

mod frame;
mod frame_buffer;
pub mod opcodes;
pub mod wire_format;

pub use frame::{Frame, MAX_PAYLOAD};
pub use frame_buffer::CircularFrameBuffer;
pub use wire_format::{DEFAULT_PRIORITY, ID_MASK, LOCAL_ID_MASK, MAX_ASSIGNED_LOCAL_ID};
