//! # railbus
//!
//! Node-side core for a shared-bus model railway control protocol.
//!
//! Physical nodes exchange short fixed-format frames over a broadcast bus
//! with 11-bit identifiers. This crate implements the protocol engine one
//! node runs: the operation-code dispatch state machine, bus-identifier
//! self-enumeration, the lean/flexible mode dialogue with a configuration
//! tool, the learned-event table contract, and the consume-own-events
//! loopback buffer.
//!
//! ## Architecture
//!
//! The core is **single-threaded and cooperative**: a host loop calls
//! [`Dispatcher::process`](dispatch::Dispatcher::process) whenever it
//! pleases, and every timer (the 100 ms enumeration window, the 30 s mode
//! watchdog) is polled inside that tick. Hardware stays behind three
//! injected seams:
//!
//! - [`bus::BusDriver`] — the physical frame transceiver
//! - [`store::ModuleStore`] — non-volatile node configuration
//! - [`time::Clock`] — the monotonic millisecond clock
//!
//! with optional blocks for indicators/push-button ([`ui`]) and the
//! long-message fragment service ([`longmsg`]).
//!
//! ## Example
//!
//! See [`dispatch::Dispatcher`] for a complete host loop.

pub mod bus;
pub mod callbacks;
pub mod dispatch;
pub mod enumeration;
pub mod error;
pub mod events;
pub mod longmsg;
pub mod mode;
pub mod params;
pub mod protocol;
pub mod store;
pub mod time;
pub mod ui;

pub use bus::BusDriver;
pub use dispatch::{Dispatcher, DEFAULT_FRAMES_PER_TICK};
pub use error::{BusError, LearnError, StoreError};
pub use mode::ModuleMode;
pub use params::{ModuleName, ModuleParams};
pub use protocol::{CircularFrameBuffer, Frame};
pub use store::{MemStore, ModuleStore};
pub use time::{Clock, ManualClock, MonotonicClock};
