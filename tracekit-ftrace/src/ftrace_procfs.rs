// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Access to the kernel's tracefs directory.
//!
//! The daemon is assumed to be the only writer on the host. The root is
//! injectable so tests can point it at a scratch directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::translation_table::GroupAndName;

pub const DEFAULT_TRACEFS_ROOT: &str = "/sys/kernel/debug/tracing";

pub struct FtraceProcfs {
    root: PathBuf,
}

impl FtraceProcfs {
    pub fn new(root: impl Into<PathBuf>) -> FtraceProcfs {
        FtraceProcfs { root: root.into() }
    }

    pub fn default_root() -> FtraceProcfs {
        FtraceProcfs::new(DEFAULT_TRACEFS_ROOT)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn event_dir(&self, event: &GroupAndName) -> PathBuf {
        self.root
            .join("events")
            .join(event.group())
            .join(event.name())
    }

    /// Reads `events/<group>/<name>/format`.
    pub fn read_event_format(&self, event: &GroupAndName) -> io::Result<String> {
        fs::read_to_string(self.event_dir(event).join("format"))
    }

    /// Enumerates every `events/<group>/<name>` directory carrying a
    /// format file.
    pub fn enumerate_events(&self) -> io::Result<Vec<GroupAndName>> {
        let mut events = Vec::new();
        for group_entry in fs::read_dir(self.root.join("events"))? {
            let group_entry = group_entry?;
            if !group_entry.file_type()?.is_dir() {
                continue;
            }
            let group = group_entry.file_name().to_string_lossy().into_owned();
            for event_entry in fs::read_dir(group_entry.path())? {
                let event_entry = event_entry?;
                if !event_entry.file_type()?.is_dir() {
                    continue;
                }
                if !event_entry.path().join("format").is_file() {
                    continue;
                }
                let name = event_entry.file_name().to_string_lossy().into_owned();
                events.push(GroupAndName::new(group.clone(), name));
            }
        }
        events.sort();
        Ok(events)
    }

    pub fn set_event_enabled(&self, event: &GroupAndName, enabled: bool) -> io::Result<()> {
        let path = self.event_dir(event).join("enable");
        fs::write(path, if enabled { "1" } else { "0" })
    }

    pub fn disable_all_events(&self) -> io::Result<()> {
        fs::write(self.root.join("events").join("enable"), "0")
    }

    pub fn set_tracing_on(&self, enabled: bool) -> io::Result<()> {
        fs::write(self.root.join("tracing_on"), if enabled { "1" } else { "0" })
    }

    pub fn clear_trace(&self) -> io::Result<()> {
        // Truncating the trace file clears every per-cpu buffer.
        fs::write(self.root.join("trace"), "")
    }

    pub fn set_buffer_size_kb(&self, kb: usize) -> io::Result<()> {
        fs::write(self.root.join("buffer_size_kb"), kb.to_string())
    }

    /// Best-effort reset after a crash left tracing configured: stop
    /// tracing, disable every event, shrink the buffers, drop the data.
    pub fn hard_reset(&self) {
        for result in [
            self.set_tracing_on(false),
            self.disable_all_events(),
            self.set_buffer_size_kb(1),
            self.clear_trace(),
        ] {
            if let Err(e) = result {
                warn!("ftrace reset step failed: {e}");
            }
        }
    }
}
