//! Error types for railbus.

use thiserror::Error;

/// Errors surfaced by a [`ModuleStore`](crate::store::ModuleStore)
/// implementation.
///
/// The dispatcher never returns these to the host; protocol-visible failures
/// become CMDERR responses on the bus and everything else is logged and
/// dropped.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An event-table, event-variable, or node-variable index was outside the
    /// range the store was built with.
    #[error("store index {0} out of range")]
    IndexOutOfRange(u8),

    /// The backing medium rejected a write.
    #[error("persistence failed: {0}")]
    Persist(String),

    /// Snapshot serialization/deserialization error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Errors surfaced by a [`BusDriver`](crate::bus::BusDriver) implementation.
#[derive(Debug, Error)]
pub enum BusError {
    /// The driver could not queue the frame for transmission.
    #[error("transmit failed: {0}")]
    Transmit(String),

    /// The driver failed while receiving.
    #[error("receive failed: {0}")]
    Receive(String),

    /// I/O error from a host-side driver.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the event-table operations in [`crate::events`].
#[derive(Debug, Error)]
pub enum LearnError {
    /// No matching entry and no free slot left.
    #[error("event table full")]
    TableFull,

    /// Unlearn did not find a matching entry.
    #[error("event not found")]
    NotFound,

    /// The store failed while persisting the entry.
    #[error(transparent)]
    Store(#[from] StoreError),
}
