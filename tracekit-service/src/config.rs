// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Session and data-source configuration, sent by consumers when enabling
//! tracing and fanned out to the matching producers.

use serde::{Deserialize, Serialize};

/// Name under which a producer advertises one data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockdownMode {
    /// Keep whatever mode the service is already in.
    #[default]
    Unchanged,
    /// Only producers whose peer uid matches the service's effective uid
    /// may connect while a session with this mode is active.
    Set,
    Clear,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub size_kb: u32,
}

/// Per-producer knobs within one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub producer_name: String,
    pub shm_size_kb: u32,
    pub page_size_kb: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtraceConfig {
    /// Events to enable, either `group/name` or a bare event name.
    pub event_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapprofdConfig {
    /// Processes to profile. Empty means the source stays idle.
    pub pids: Vec<u64>,
    pub sampling_interval_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub target_buffer: u32,
    pub trace_duration_ms: u32,
    pub ftrace_config: Option<FtraceConfig>,
    pub heapprofd_config: Option<HeapprofdConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfigEntry {
    pub config: DataSourceConfig,
}

/// The consumer-supplied description of one tracing session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub buffers: Vec<BufferConfig>,
    pub producers: Vec<ProducerConfig>,
    pub data_sources: Vec<DataSourceConfigEntry>,
    pub lockdown_mode: LockdownMode,
}

impl TraceConfig {
    /// Shared-memory size for a producer in this session, from the first
    /// producer entry, with a 4 MiB fallback.
    pub fn shm_size_bytes(&self) -> usize {
        const DEFAULT_SHM_SIZE: usize = 4 * 1024 * 1024;
        self.producers
            .first()
            .map(|p| p.shm_size_kb as usize * 1024)
            .filter(|&size| size > 0)
            .unwrap_or(DEFAULT_SHM_SIZE)
    }
}
