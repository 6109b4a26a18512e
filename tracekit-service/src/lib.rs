// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The tracing service: a broker multiplexing tracing sessions between
//! untrusted producers (which emit trace data) and consumers (which
//! configure sessions and read the result).
//!
//! [`TracingService`] is the in-process core: it owns the producer registry,
//! the sessions, and the shared-memory buffers. The `ports` module makes the
//! broker reachable over the IPC layer, with client-side wrappers producers
//! and consumers in other processes link against. The `traced` binary wires
//! both onto their sockets.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod config;
pub mod ports;
pub mod shared_memory;
pub mod tracing_service;

pub use config::{
    BufferConfig, DataSourceConfig, DataSourceConfigEntry, DataSourceDescriptor, FtraceConfig,
    HeapprofdConfig, LockdownMode, ProducerConfig, TraceConfig,
};
pub use shared_memory::{HeapSharedMemory, HeapSharedMemoryFactory, SharedMemory,
    SharedMemoryFactory};
pub use tracing_service::{
    Consumer, ConsumerConnection, Producer, ProducerConnection, TracePacket, TracingService,
};

/// Producer ids live in a 16-bit space and are recycled after disconnect.
pub type ProducerId = u16;
pub const MAX_PRODUCER_ID: ProducerId = u16::MAX;

/// Per-producer id of a registered data source, assigned from 1.
pub type DataSourceId = u64;
/// Service-wide id of one instantiated data source within a session.
pub type DataSourceInstanceId = u64;
pub type TracingSessionId = u64;
