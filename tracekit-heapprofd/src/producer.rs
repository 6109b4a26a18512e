// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The profiler's attachment to the tracing service.
//!
//! Sessions configure which processes to profile; instantiation marks
//! those pids as expected on the socket listener and pokes each process
//! with the profiling signal so its allocator hooks dial in.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use tracekit_service::ports::ProducerIpcClient;
use tracekit_service::{DataSourceConfig, DataSourceDescriptor, DataSourceInstanceId, Producer};

use crate::socket_listener::{ClientConfiguration, ExpectedPids};

pub const HEAPPROFD_DATA_SOURCE: &str = "linux.heapprofd";

/// Real-time signal the allocator hooks listen for.
const HEAPPROFD_SIGNAL: libc::c_int = 36;

struct Instance {
    pids: Vec<u64>,
}

pub struct HeapprofdProducer {
    endpoint: ProducerIpcClient,
    expected: Arc<ExpectedPids>,
    instances: HashMap<DataSourceInstanceId, Instance>,
}

impl HeapprofdProducer {
    pub fn new(endpoint: ProducerIpcClient, expected: Arc<ExpectedPids>) -> HeapprofdProducer {
        HeapprofdProducer {
            endpoint,
            expected,
            instances: HashMap::new(),
        }
    }
}

impl Producer for HeapprofdProducer {
    fn on_connect(&mut self) {
        info!("connected to the tracing service");
        self.endpoint.register_data_source(
            DataSourceDescriptor {
                name: HEAPPROFD_DATA_SOURCE.to_string(),
            },
            |id| {
                if id == 0 {
                    error!("data source registration refused");
                } else {
                    info!(data_source_id = id, "registered {HEAPPROFD_DATA_SOURCE}");
                }
            },
        );
    }

    fn on_disconnect(&mut self) {
        warn!("disconnected from the tracing service");
    }

    fn create_data_source_instance(
        &mut self,
        instance_id: DataSourceInstanceId,
        config: &DataSourceConfig,
    ) {
        let Some(heapprofd_config) = config.heapprofd_config.as_ref() else {
            warn!(instance_id, "config carries no heapprofd section");
            return;
        };
        if heapprofd_config.pids.is_empty() {
            // TODO: whole-system profiling when no pids are given.
            warn!(instance_id, "no pids given");
            return;
        }
        if self.instances.contains_key(&instance_id) {
            error!(instance_id, "duplicate data source instance id");
            return;
        }

        let client_config = ClientConfiguration {
            sampling_interval_bytes: heapprofd_config.sampling_interval_bytes,
        };
        for &pid in &heapprofd_config.pids {
            self.expected.expect(pid as i32, client_config);
            // SAFETY: kill with a valid signal number only touches the
            // target process.
            if unsafe { libc::kill(pid as libc::pid_t, HEAPPROFD_SIGNAL) } != 0 {
                warn!(pid, "failed to signal process for profiling");
            }
        }
        info!(
            instance_id,
            pids = heapprofd_config.pids.len(),
            "heapprofd data source started"
        );
        self.instances.insert(
            instance_id,
            Instance {
                pids: heapprofd_config.pids.clone(),
            },
        );
    }

    fn tear_down_data_source_instance(&mut self, instance_id: DataSourceInstanceId) {
        let Some(instance) = self.instances.remove(&instance_id) else {
            error!(instance_id, "teardown of unknown data source instance");
            return;
        };
        for &pid in &instance.pids {
            self.expected.remove(pid as i32);
        }
        info!(instance_id, "heapprofd data source stopped");
    }
}
