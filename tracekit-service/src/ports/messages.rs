// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Request/reply messages and descriptors for the two port services.
//!
//! The descriptors double as the host-side dispatch tables; the `METHOD_*`
//! constants are the 1-based positions the host assigns, kept next to the
//! descriptor so the two cannot drift apart.

use serde::{Deserialize, Serialize};

use tracekit_ipc::service::{decode_as, MethodDescriptor, ServiceDescriptor};
use tracekit_ipc::MethodId;

use crate::config::{DataSourceConfig, DataSourceDescriptor, TraceConfig};
use crate::{DataSourceId, DataSourceInstanceId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeConnectionArgs {
    pub producer_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeConnectionReply {
    /// False when the connection was refused (lockdown); the producer will
    /// never receive commands on it.
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDataSourceArgs {
    pub descriptor: DataSourceDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDataSourceReply {
    pub data_source_id: DataSourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterDataSourceArgs {
    pub data_source_id: DataSourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterDataSourceReply {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAsyncCommandArgs {}

/// Broker-to-producer commands, streamed as `GetAsyncCommand` replies for
/// the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AsyncCommand {
    CreateDataSourceInstance {
        instance_id: DataSourceInstanceId,
        config: DataSourceConfig,
    },
    TearDownDataSource {
        instance_id: DataSourceInstanceId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableTracingArgs {
    pub config: TraceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableTracingReply {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisableTracingArgs {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisableTracingReply {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadBuffersArgs {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadBuffersReply {
    pub packets: Vec<Vec<u8>>,
}

pub const METHOD_INITIALIZE_CONNECTION: MethodId = 1;
pub const METHOD_REGISTER_DATA_SOURCE: MethodId = 2;
pub const METHOD_UNREGISTER_DATA_SOURCE: MethodId = 3;
pub const METHOD_GET_ASYNC_COMMAND: MethodId = 4;

pub static PRODUCER_PORT: ServiceDescriptor = ServiceDescriptor {
    service_name: "ProducerPort",
    methods: &[
        MethodDescriptor {
            name: "InitializeConnection",
            decode_reply: decode_as::<InitializeConnectionReply>,
        },
        MethodDescriptor {
            name: "RegisterDataSource",
            decode_reply: decode_as::<RegisterDataSourceReply>,
        },
        MethodDescriptor {
            name: "UnregisterDataSource",
            decode_reply: decode_as::<UnregisterDataSourceReply>,
        },
        MethodDescriptor {
            name: "GetAsyncCommand",
            decode_reply: decode_as::<AsyncCommand>,
        },
    ],
};

pub const METHOD_ENABLE_TRACING: MethodId = 1;
pub const METHOD_DISABLE_TRACING: MethodId = 2;
pub const METHOD_READ_BUFFERS: MethodId = 3;

pub static CONSUMER_PORT: ServiceDescriptor = ServiceDescriptor {
    service_name: "ConsumerPort",
    methods: &[
        MethodDescriptor {
            name: "EnableTracing",
            decode_reply: decode_as::<EnableTracingReply>,
        },
        MethodDescriptor {
            name: "DisableTracing",
            decode_reply: decode_as::<DisableTracingReply>,
        },
        MethodDescriptor {
            name: "ReadBuffers",
            decode_reply: decode_as::<ReadBuffersReply>,
        },
    ],
};
