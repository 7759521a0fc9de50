//! Event-table operations.
//!
//! Accessory events arrive either in long form, keyed on
//! `(node number, event number)`, or in short form, keyed on
//! `(0, event number)`. This module implements the lookup and the
//! learn-mode mutations the dispatcher exposes on the bus; the store's hash
//! accelerator is kept current after every mutation that changes a key.

use crate::error::{LearnError, StoreError};
use crate::store::ModuleStore;

/// Find the stored entry matching an accessory event.
#[inline]
pub fn resolve<S: ModuleStore>(store: &S, nn: u16, en: u16) -> Option<u8> {
    store.find_existing(nn, en)
}

/// Learn or update an event, returning the entry index used.
///
/// Rules, in order:
/// 1. Reuse the entry already matching `(nn, en)` when present, else take
///    the first empty slot.
/// 2. With neither, the table is full.
/// 3. The event header is persisted (and the hash refreshed) only while the
///    incoming variable index is below 2 — one header write per learn
///    transaction, on its first or second variable.
/// 4. The event variable itself is always persisted.
pub fn learn<S: ModuleStore>(
    store: &mut S,
    nn: u16,
    en: u16,
    ev_index: u8,
    ev_value: u8,
) -> Result<u8, LearnError> {
    let index = match store.find_existing(nn, en) {
        Some(index) => index,
        None => store.find_empty_slot().ok_or(LearnError::TableFull)?,
    };

    if ev_index < 2 {
        let header = [(nn >> 8) as u8, nn as u8, (en >> 8) as u8, en as u8];
        store.write_event(index, header)?;
        store.update_event_hash(index);
    }

    store.write_event_variable(index, ev_index, ev_value)?;
    tracing::debug!(nn, en, index, ev_index, ev_value, "event learned");
    Ok(index)
}

/// Remove the entry matching `(nn, en)`, returning its former index.
pub fn unlearn<S: ModuleStore>(store: &mut S, nn: u16, en: u16) -> Result<u8, LearnError> {
    let index = store.find_existing(nn, en).ok_or(LearnError::NotFound)?;
    store.clear_event(index)?;
    store.update_event_hash(index);
    tracing::debug!(nn, en, index, "event unlearned");
    Ok(index)
}

/// Empty every entry and rebuild the hash accelerator.
pub fn clear_all<S: ModuleStore>(store: &mut S) -> Result<(), StoreError> {
    for index in 0..store.event_capacity() {
        store.clear_event(index)?;
    }
    store.clear_event_hash_table();
    tracing::debug!("event table cleared");
    Ok(())
}

/// Number of unoccupied event-table slots.
pub fn free_slots<S: ModuleStore>(store: &S) -> u8 {
    (0..store.event_capacity())
        .filter(|&i| !store.entry_in_use(i))
        .count() as u8
}
