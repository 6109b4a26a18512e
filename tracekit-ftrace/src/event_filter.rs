// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Dense "is event id enabled?" bitmap, the shape the per-cpu record reader
//! wants to consult on its hot path. Mirrors the enabled set of one data
//! source instance.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventFilter {
    enabled_ids: Vec<bool>,
}

impl EventFilter {
    pub fn new() -> EventFilter {
        Default::default()
    }

    pub fn add_enabled_event(&mut self, ftrace_event_id: usize) {
        if ftrace_event_id >= self.enabled_ids.len() {
            self.enabled_ids.resize(ftrace_event_id + 1, false);
        }
        self.enabled_ids[ftrace_event_id] = true;
    }

    pub fn disable_event(&mut self, ftrace_event_id: usize) {
        if let Some(slot) = self.enabled_ids.get_mut(ftrace_event_id) {
            *slot = false;
        }
    }

    /// Id 0 is never a valid event.
    pub fn is_event_enabled(&self, ftrace_event_id: usize) -> bool {
        ftrace_event_id != 0 && self.enabled_ids.get(ftrace_event_id).copied().unwrap_or(false)
    }

    pub fn enabled_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.enabled_ids
            .iter()
            .enumerate()
            .filter_map(|(id, &enabled)| enabled.then_some(id))
    }

    pub fn bitwise_or(&mut self, other: &EventFilter) {
        if other.enabled_ids.len() > self.enabled_ids.len() {
            self.enabled_ids.resize(other.enabled_ids.len(), false);
        }
        for (slot, &enabled) in self.enabled_ids.iter_mut().zip(&other.enabled_ids) {
            *slot |= enabled;
        }
    }
}
