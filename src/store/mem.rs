//! In-memory reference store.
//!
//! Backs tests and hosts that keep node identity elsewhere. State can be
//! exported to and restored from a JSON [`NodeSnapshot`], so a host can park
//! a node's identity on disk between runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ModuleStore;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct EventEntry {
    nn: u16,
    en: u16,
    ev_vars: Vec<u8>,
}

/// A [`ModuleStore`] held entirely in memory.
///
/// The `(nn, en) → index` hash accelerator is maintained through
/// [`update_event_hash`](ModuleStore::update_event_hash) and
/// [`clear_event_hash_table`](ModuleStore::clear_event_hash_table), exactly
/// as a flash-backed store would maintain its RAM-side table.
#[derive(Debug)]
pub struct MemStore {
    node_number: u16,
    local_id: u8,
    flexible: bool,
    entries: Vec<Option<EventEntry>>,
    node_vars: Vec<u8>,
    ev_vars_per_event: u8,
    hash: HashMap<(u16, u16), u8>,
}

impl MemStore {
    /// Create an empty store with the given table geometry.
    pub fn new(event_capacity: u8, ev_vars_per_event: u8, node_var_count: u8) -> Self {
        Self {
            node_number: 0,
            local_id: 0,
            flexible: false,
            entries: vec![None; event_capacity as usize],
            node_vars: vec![0; node_var_count as usize],
            ev_vars_per_event,
            hash: HashMap::new(),
        }
    }

    /// Export the persisted state.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_number: self.node_number,
            local_id: self.local_id,
            flexible_mode: self.flexible,
            node_vars: self.node_vars.clone(),
            events: self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| {
                    slot.as_ref().map(|e| EventSnapshot {
                        index: i as u8,
                        node_number: e.nn,
                        event_number: e.en,
                        ev_vars: e.ev_vars.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Replace the persisted state from a snapshot and rebuild the hash
    /// accelerator. Entries outside the store's geometry are ignored.
    pub fn restore(&mut self, snapshot: &NodeSnapshot) {
        self.node_number = snapshot.node_number;
        self.local_id = snapshot.local_id;
        self.flexible = snapshot.flexible_mode;
        for (dst, src) in self.node_vars.iter_mut().zip(snapshot.node_vars.iter()) {
            *dst = *src;
        }
        self.entries.fill(None);
        for event in &snapshot.events {
            let Some(slot) = self.entries.get_mut(event.index as usize) else {
                continue;
            };
            let mut ev_vars = vec![0u8; self.ev_vars_per_event as usize];
            for (dst, src) in ev_vars.iter_mut().zip(event.ev_vars.iter()) {
                *dst = *src;
            }
            *slot = Some(EventEntry {
                nn: event.node_number,
                en: event.event_number,
                ev_vars,
            });
        }
        self.clear_event_hash_table();
    }

    /// Serialize the persisted state to JSON.
    pub fn snapshot_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Restore the persisted state from JSON produced by
    /// [`snapshot_json`](Self::snapshot_json).
    pub fn restore_json(&mut self, json: &str) -> Result<(), StoreError> {
        let snapshot: NodeSnapshot = serde_json::from_str(json)?;
        self.restore(&snapshot);
        Ok(())
    }

    fn entry(&self, index: u8) -> Option<&EventEntry> {
        self.entries.get(index as usize).and_then(|e| e.as_ref())
    }
}

impl ModuleStore for MemStore {
    fn node_number(&self) -> u16 {
        self.node_number
    }

    fn set_node_number(&mut self, nn: u16) -> Result<(), StoreError> {
        self.node_number = nn;
        Ok(())
    }

    fn local_id(&self) -> u8 {
        self.local_id
    }

    fn set_local_id(&mut self, id: u8) -> Result<(), StoreError> {
        self.local_id = id;
        Ok(())
    }

    fn flexible_mode(&self) -> bool {
        self.flexible
    }

    fn set_flexible_mode(&mut self, flexible: bool) -> Result<(), StoreError> {
        self.flexible = flexible;
        Ok(())
    }

    fn event_capacity(&self) -> u8 {
        self.entries.len() as u8
    }

    fn ev_vars_per_event(&self) -> u8 {
        self.ev_vars_per_event
    }

    fn node_var_count(&self) -> u8 {
        self.node_vars.len() as u8
    }

    fn num_events(&self) -> u8 {
        self.entries.iter().filter(|e| e.is_some()).count() as u8
    }

    fn find_existing(&self, nn: u16, en: u16) -> Option<u8> {
        let index = *self.hash.get(&(nn, en))?;
        // A hash entry pointing at a slot that no longer matches means the
        // accelerator is stale; report not-found rather than a wrong index.
        match self.entry(index) {
            Some(e) if e.nn == nn && e.en == en => Some(index),
            _ => {
                tracing::warn!(nn, en, index, "stale event hash entry");
                None
            }
        }
    }

    fn find_empty_slot(&self) -> Option<u8> {
        self.entries
            .iter()
            .position(|e| e.is_none())
            .map(|i| i as u8)
    }

    fn entry_in_use(&self, index: u8) -> bool {
        self.entry(index).is_some()
    }

    fn read_event(&self, index: u8) -> Option<[u8; 4]> {
        let e = self.entry(index)?;
        Some([
            (e.nn >> 8) as u8,
            e.nn as u8,
            (e.en >> 8) as u8,
            e.en as u8,
        ])
    }

    fn write_event(&mut self, index: u8, header: [u8; 4]) -> Result<(), StoreError> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .ok_or(StoreError::IndexOutOfRange(index))?;
        let nn = ((header[0] as u16) << 8) | header[1] as u16;
        let en = ((header[2] as u16) << 8) | header[3] as u16;
        match slot {
            Some(e) => {
                e.nn = nn;
                e.en = en;
            }
            None => {
                *slot = Some(EventEntry {
                    nn,
                    en,
                    ev_vars: vec![0; self.ev_vars_per_event as usize],
                });
            }
        }
        Ok(())
    }

    fn clear_event(&mut self, index: u8) -> Result<(), StoreError> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .ok_or(StoreError::IndexOutOfRange(index))?;
        *slot = None;
        Ok(())
    }

    fn read_nv(&self, index: u8) -> u8 {
        if index == 0 {
            return 0;
        }
        self.node_vars
            .get(index as usize - 1)
            .copied()
            .unwrap_or(0)
    }

    fn write_nv(&mut self, index: u8, value: u8) -> Result<(), StoreError> {
        if index == 0 {
            return Err(StoreError::IndexOutOfRange(index));
        }
        let slot = self
            .node_vars
            .get_mut(index as usize - 1)
            .ok_or(StoreError::IndexOutOfRange(index))?;
        *slot = value;
        Ok(())
    }

    fn event_variable(&self, index: u8, ev_index: u8) -> u8 {
        if ev_index == 0 {
            return 0;
        }
        self.entry(index)
            .and_then(|e| e.ev_vars.get(ev_index as usize - 1))
            .copied()
            .unwrap_or(0)
    }

    fn write_event_variable(
        &mut self,
        index: u8,
        ev_index: u8,
        value: u8,
    ) -> Result<(), StoreError> {
        if ev_index == 0 {
            return Err(StoreError::IndexOutOfRange(ev_index));
        }
        let entry = self
            .entries
            .get_mut(index as usize)
            .and_then(|e| e.as_mut())
            .ok_or(StoreError::IndexOutOfRange(index))?;
        let slot = entry
            .ev_vars
            .get_mut(ev_index as usize - 1)
            .ok_or(StoreError::IndexOutOfRange(ev_index))?;
        *slot = value;
        Ok(())
    }

    fn update_event_hash(&mut self, index: u8) {
        self.hash.retain(|_, i| *i != index);
        if let Some(e) = self.entry(index) {
            self.hash.insert((e.nn, e.en), index);
        }
    }

    fn clear_event_hash_table(&mut self) {
        self.hash.clear();
        for (i, slot) in self.entries.iter().enumerate() {
            if let Some(e) = slot {
                self.hash.insert((e.nn, e.en), i as u8);
            }
        }
    }
}

/// Serializable image of a store's persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_number: u16,
    pub local_id: u8,
    pub flexible_mode: bool,
    pub node_vars: Vec<u8>,
    pub events: Vec<EventSnapshot>,
}

/// One occupied event-table entry within a [`NodeSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub index: u8,
    pub node_number: u16,
    pub event_number: u16,
    pub ev_vars: Vec<u8>,
}
