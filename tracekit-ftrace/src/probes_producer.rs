// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The kernel-event producer.
//!
//! Advertises the `linux.ftrace` data source; on instantiation it resolves
//! the configured event names through the translation table (materializing
//! unknown events on demand), enables them in tracefs, and keeps the dense
//! event filter the record reader consults. Teardown disables whatever no
//! surviving instance still wants. The per-cpu ring-buffer reader and page
//! decoder sit behind their own interface and are not part of this
//! producer.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use tracekit_service::ports::ProducerIpcClient;
use tracekit_service::{DataSourceConfig, DataSourceDescriptor, DataSourceInstanceId, Producer};

use crate::event_filter::EventFilter;
use crate::ftrace_procfs::FtraceProcfs;
use crate::translation_table::{GroupAndName, TranslationTable};

pub const FTRACE_DATA_SOURCE: &str = "linux.ftrace";

struct Instance {
    events: Vec<GroupAndName>,
    filter: EventFilter,
}

pub struct ProbesProducer {
    endpoint: ProducerIpcClient,
    procfs: Arc<FtraceProcfs>,
    table: Option<TranslationTable>,
    table_creation_failed: bool,
    instances: HashMap<DataSourceInstanceId, Instance>,
}

impl ProbesProducer {
    pub fn new(endpoint: ProducerIpcClient, procfs: Arc<FtraceProcfs>) -> ProbesProducer {
        ProbesProducer {
            endpoint,
            procfs,
            table: None,
            table_creation_failed: false,
            instances: HashMap::new(),
        }
    }

    /// The table scans all of tracefs, so it is built on first use and a
    /// failed build is not retried on every session.
    fn ensure_table(&mut self) -> Option<&mut TranslationTable> {
        if self.table.is_none() && !self.table_creation_failed {
            match TranslationTable::create(self.procfs.clone()) {
                Ok(table) => {
                    info!(events = table.largest_id(), "built ftrace translation table");
                    self.table = Some(table);
                }
                Err(e) => {
                    error!("failed to build the ftrace translation table: {e}");
                    self.table_creation_failed = true;
                }
            }
        }
        self.table.as_mut()
    }

    /// `group/name`, or a bare name resolved through the first-registered
    /// index.
    fn resolve_event(&mut self, event_name: &str) -> Option<GroupAndName> {
        let table = self.ensure_table()?;
        if let Some((group, name)) = event_name.split_once('/') {
            let group_and_name = GroupAndName::new(group, name);
            table.get_or_create_event(&group_and_name)?;
            Some(group_and_name)
        } else {
            let event = table.event_by_name(event_name)?;
            Some(GroupAndName::new(event.group.clone(), event.name.clone()))
        }
    }

    /// True iff some other live instance still has `event` enabled.
    fn event_still_wanted(&self, event: &GroupAndName) -> bool {
        self.instances
            .values()
            .any(|instance| instance.events.contains(event))
    }
}

impl Producer for ProbesProducer {
    fn on_connect(&mut self) {
        info!("connected to the tracing service");
        self.endpoint.register_data_source(
            DataSourceDescriptor {
                name: FTRACE_DATA_SOURCE.to_string(),
            },
            |id| {
                if id == 0 {
                    error!("data source registration refused");
                } else {
                    info!(data_source_id = id, "registered {FTRACE_DATA_SOURCE}");
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
        let Some(ftrace_config) = config.ftrace_config.clone() else {
            warn!(instance_id, "config carries no ftrace section");
            return;
        };
        let mut instance = Instance {
            events: Vec::new(),
            filter: EventFilter::new(),
        };
        for event_name in &ftrace_config.event_names {
            let Some(group_and_name) = self.resolve_event(event_name) else {
                warn!(event = %event_name, "unknown ftrace event, skipping");
                continue;
            };
            if let Err(e) = self.procfs.set_event_enabled(&group_and_name, true) {
                warn!(event = %group_and_name, "failed to enable: {e}");
                continue;
            }
            let ftrace_id = self
                .table
                .as_ref()
                .map(|t| t.event_to_ftrace_id(&group_and_name))
                .unwrap_or(0);
            instance.filter.add_enabled_event(ftrace_id as usize);
            instance.events.push(group_and_name);
        }
        if let Err(e) = self.procfs.set_tracing_on(true) {
            warn!("failed to turn tracing on: {e}");
        }
        info!(
            instance_id,
            events = instance.events.len(),
            "ftrace data source started"
        );
        self.instances.insert(instance_id, instance);
    }

    fn tear_down_data_source_instance(&mut self, instance_id: DataSourceInstanceId) {
        let Some(instance) = self.instances.remove(&instance_id) else {
            warn!(instance_id, "teardown of unknown instance");
            return;
        };
        for event in &instance.events {
            if self.event_still_wanted(event) {
                continue;
            }
            if let Err(e) = self.procfs.set_event_enabled(event, false) {
                warn!(event = %event, "failed to disable: {e}");
            }
        }
        if self.instances.is_empty() {
            if let Err(e) = self.procfs.set_tracing_on(false) {
                warn!("failed to turn tracing off: {e}");
            }
        }
        info!(instance_id, "ftrace data source stopped");
    }
}
