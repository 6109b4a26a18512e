// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The in-process broker core.
//!
//! [`TracingService`] owns every session, the producer registry, and the
//! shared-memory buffers; connections hand out RAII handles whose drop is
//! the disconnect. Producer and consumer callbacks are invoked synchronously
//! with no service lock held; callback implementations must not call back
//! into their own connection from inside a callback (remote attachments
//! never do: their callbacks are channel sends on the IPC ports).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use tracekit_common::MutexExt;

use crate::config::{DataSourceConfig, DataSourceDescriptor, LockdownMode, TraceConfig};
use crate::shared_memory::{SharedMemory, SharedMemoryFactory};
use crate::{DataSourceId, DataSourceInstanceId, ProducerId, TracingSessionId};

/// A producer-side attachment to the service. Implementations emit trace
/// data for the data sources they advertise.
pub trait Producer: Send {
    fn on_connect(&mut self);
    fn on_disconnect(&mut self);
    fn create_data_source_instance(
        &mut self,
        instance_id: DataSourceInstanceId,
        config: &DataSourceConfig,
    );
    fn tear_down_data_source_instance(&mut self, instance_id: DataSourceInstanceId);
}

/// A consumer-side attachment: configures sessions and reads trace data.
pub trait Consumer: Send {
    fn on_connect(&mut self);
    fn on_disconnect(&mut self);
    fn on_trace_data(&mut self, packets: Vec<TracePacket>, has_more: bool);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracePacket {
    pub data: Vec<u8>,
}

type ConsumerId = u64;

struct ProducerEntry {
    producer: Arc<Mutex<dyn Producer>>,
    uid: u32,
    last_data_source_id: DataSourceId,
    data_sources: HashMap<DataSourceId, DataSourceDescriptor>,
    shm: Option<Box<dyn SharedMemory>>,
}

struct ConsumerEntry {
    consumer: Arc<Mutex<dyn Consumer>>,
}

struct SessionInstance {
    producer_id: ProducerId,
    instance_id: DataSourceInstanceId,
    data_source_id: DataSourceId,
}

struct TracingSession {
    consumer_id: ConsumerId,
    config: TraceConfig,
    instances: Vec<SessionInstance>,
}

struct ServiceState {
    euid: u32,
    lockdown: bool,
    last_producer_id: ProducerId,
    producers: HashMap<ProducerId, ProducerEntry>,
    last_consumer_id: ConsumerId,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    last_session_id: TracingSessionId,
    sessions: HashMap<TracingSessionId, TracingSession>,
    last_instance_id: DataSourceInstanceId,
    shm_factory: Box<dyn SharedMemoryFactory>,
}

impl ServiceState {
    /// Allocates the next producer id: increments, skips zero, and probes
    /// past ids still in use. The id space is 16 bit, so after a long
    /// uptime allocation wraps and recycles the ids of long-gone producers.
    fn alloc_producer_id(&mut self) -> ProducerId {
        loop {
            self.last_producer_id = self.last_producer_id.wrapping_add(1);
            if self.last_producer_id == 0 {
                continue;
            }
            if !self.producers.contains_key(&self.last_producer_id) {
                return self.last_producer_id;
            }
        }
    }

    /// Records one data-source instance on `session_id` and ensures the
    /// producer has its shared-memory buffer. Returns what is needed to
    /// fire the producer callback after the state lock is released.
    fn plan_instance(
        &mut self,
        session_id: TracingSessionId,
        producer_id: ProducerId,
        data_source_id: DataSourceId,
        config: &DataSourceConfig,
    ) -> Option<InstanceCallback> {
        let ServiceState {
            producers,
            sessions,
            shm_factory,
            last_instance_id,
            ..
        } = self;
        let session = sessions.get_mut(&session_id)?;
        let entry = producers.get_mut(&producer_id)?;

        *last_instance_id += 1;
        let instance_id = *last_instance_id;
        session.instances.push(SessionInstance {
            producer_id,
            instance_id,
            data_source_id,
        });
        if entry.shm.is_none() {
            let size = session.config.shm_size_bytes();
            debug!(producer_id, size, "allocating shared memory buffer");
            entry.shm = Some(shm_factory.create(size));
        }
        Some((entry.producer.clone(), instance_id, config.clone()))
    }
}

type InstanceCallback = (Arc<Mutex<dyn Producer>>, DataSourceInstanceId, DataSourceConfig);

/// Cloneable handle to the broker state shared by the connection handles
/// and the IPC ports.
#[derive(Clone)]
pub struct TracingService {
    state: Arc<Mutex<ServiceState>>,
}

impl TracingService {
    pub fn new(shm_factory: Box<dyn SharedMemoryFactory>) -> TracingService {
        // SAFETY: geteuid cannot fail and touches no memory.
        let euid = unsafe { libc::geteuid() };
        TracingService {
            state: Arc::new(Mutex::new(ServiceState {
                euid,
                lockdown: false,
                last_producer_id: 0,
                producers: HashMap::new(),
                last_consumer_id: 0,
                consumers: HashMap::new(),
                last_session_id: 0,
                sessions: HashMap::new(),
                last_instance_id: 0,
                shm_factory,
            })),
        }
    }

    /// Attaches a producer with the peer uid of its connection.
    ///
    /// While lockdown is in effect, producers whose uid differs from the
    /// service's effective uid get an inert connection back: no
    /// `on_connect`, no registration, and every endpoint operation on it is
    /// a no-op.
    pub fn connect_producer(
        &self,
        producer: Arc<Mutex<dyn Producer>>,
        uid: u32,
    ) -> ProducerConnection {
        let producer_id = {
            let mut state = self.state.lock_or_panic();
            if state.lockdown && uid != state.euid {
                warn!(uid, "rejecting producer connection in lockdown mode");
                None
            } else {
                let id = state.alloc_producer_id();
                state.producers.insert(
                    id,
                    ProducerEntry {
                        producer: producer.clone(),
                        uid,
                        last_data_source_id: 0,
                        data_sources: HashMap::new(),
                        shm: None,
                    },
                );
                info!(producer_id = id, uid, "producer connected");
                Some(id)
            }
        };
        if producer_id.is_some() {
            producer.lock_or_panic().on_connect();
        }
        ProducerConnection {
            service: self.clone(),
            producer_id,
        }
    }

    pub fn connect_consumer(&self, consumer: Arc<Mutex<dyn Consumer>>) -> ConsumerConnection {
        let consumer_id = {
            let mut state = self.state.lock_or_panic();
            state.last_consumer_id += 1;
            let id = state.last_consumer_id;
            state.consumers.insert(
                id,
                ConsumerEntry {
                    consumer: consumer.clone(),
                },
            );
            info!(consumer_id = id, "consumer connected");
            id
        };
        consumer.lock_or_panic().on_connect();
        ConsumerConnection {
            service: self.clone(),
            consumer_id,
        }
    }

    pub fn num_producers(&self) -> usize {
        self.state.lock_or_panic().producers.len()
    }

    /// Reverse lookup used by diagnostics and tests.
    pub fn get_producer_uid(&self, producer_id: ProducerId) -> Option<u32> {
        self.state
            .lock_or_panic()
            .producers
            .get(&producer_id)
            .map(|p| p.uid)
    }

    pub fn producer_shm_size(&self, producer_id: ProducerId) -> Option<usize> {
        self.state
            .lock_or_panic()
            .producers
            .get(&producer_id)
            .and_then(|p| p.shm.as_ref().map(|shm| shm.size()))
    }

    #[doc(hidden)]
    pub fn set_last_producer_id_for_testing(&self, id: ProducerId) {
        self.state.lock_or_panic().last_producer_id = id;
    }

    fn register_data_source(
        &self,
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
    ) -> DataSourceId {
        let (data_source_id, callbacks) = {
            let mut state = self.state.lock_or_panic();
            let Some(entry) = state.producers.get_mut(&producer_id) else {
                return 0;
            };
            entry.last_data_source_id += 1;
            let data_source_id = entry.last_data_source_id;
            info!(producer_id, name = %descriptor.name, "registered data source");
            entry.data_sources.insert(data_source_id, descriptor.clone());

            // A late-joining producer catches up with sessions that already
            // want this source.
            let mut wanted: Vec<(TracingSessionId, DataSourceConfig)> = Vec::new();
            for (&session_id, session) in state.sessions.iter() {
                for entry in &session.config.data_sources {
                    if entry.config.name == descriptor.name {
                        wanted.push((session_id, entry.config.clone()));
                    }
                }
            }
            let mut callbacks = Vec::new();
            for (session_id, config) in wanted {
                callbacks.extend(state.plan_instance(
                    session_id,
                    producer_id,
                    data_source_id,
                    &config,
                ));
            }
            (data_source_id, callbacks)
        };
        fire_instance_callbacks(callbacks);
        data_source_id
    }

    fn unregister_data_source(&self, producer_id: ProducerId, data_source_id: DataSourceId) {
        let callbacks = {
            let mut state = self.state.lock_or_panic();
            let Some(entry) = state.producers.get_mut(&producer_id) else {
                return;
            };
            if entry.data_sources.remove(&data_source_id).is_none() {
                debug!(producer_id, data_source_id, "unregister of unknown source");
                return;
            }
            let producer = entry.producer.clone();
            let mut callbacks = Vec::new();
            for session in state.sessions.values_mut() {
                session.instances.retain(|instance| {
                    let stale = instance.producer_id == producer_id
                        && instance.data_source_id == data_source_id;
                    if stale {
                        callbacks.push((producer.clone(), instance.instance_id));
                    }
                    !stale
                });
            }
            callbacks
        };
        for (producer, instance_id) in callbacks {
            producer
                .lock_or_panic()
                .tear_down_data_source_instance(instance_id);
        }
    }

    fn disconnect_producer(&self, producer_id: ProducerId) {
        let (producer, teardowns) = {
            let mut state = self.state.lock_or_panic();
            let Some(entry) = state.producers.remove(&producer_id) else {
                return;
            };
            let mut teardowns = Vec::new();
            for session in state.sessions.values_mut() {
                session.instances.retain(|instance| {
                    let own = instance.producer_id == producer_id;
                    if own {
                        teardowns.push(instance.instance_id);
                    }
                    !own
                });
            }
            info!(producer_id, "producer disconnected");
            (entry.producer, teardowns)
        };
        {
            let mut producer = producer.lock_or_panic();
            for instance_id in teardowns {
                producer.tear_down_data_source_instance(instance_id);
            }
            producer.on_disconnect();
        }
    }

    fn enable_tracing(&self, consumer_id: ConsumerId, config: TraceConfig) -> bool {
        let callbacks = {
            let mut state = self.state.lock_or_panic();
            if state
                .sessions
                .values()
                .any(|s| s.consumer_id == consumer_id)
            {
                error!(consumer_id, "consumer already has an active session");
                return false;
            }
            match config.lockdown_mode {
                LockdownMode::Set => state.lockdown = true,
                LockdownMode::Clear => state.lockdown = false,
                LockdownMode::Unchanged => {}
            }
            state.last_session_id += 1;
            let session_id = state.last_session_id;
            info!(session_id, consumer_id, "enabling tracing");
            state.sessions.insert(
                session_id,
                TracingSession {
                    consumer_id,
                    config: config.clone(),
                    instances: Vec::new(),
                },
            );

            // Instantiate every matching data source on every connected
            // producer that advertises it.
            let mut matches: Vec<(ProducerId, DataSourceId, DataSourceConfig)> = Vec::new();
            for entry in &config.data_sources {
                for (&producer_id, producer) in state.producers.iter() {
                    for (&data_source_id, desc) in producer.data_sources.iter() {
                        if desc.name == entry.config.name {
                            matches.push((producer_id, data_source_id, entry.config.clone()));
                        }
                    }
                }
            }
            let mut callbacks = Vec::new();
            for (producer_id, data_source_id, ds_config) in matches {
                callbacks.extend(state.plan_instance(
                    session_id,
                    producer_id,
                    data_source_id,
                    &ds_config,
                ));
            }
            callbacks
        };
        fire_instance_callbacks(callbacks);
        true
    }

    fn disable_tracing(&self, consumer_id: ConsumerId) {
        let callbacks = {
            let mut state = self.state.lock_or_panic();
            let Some(session_id) = state
                .sessions
                .iter()
                .find(|(_, s)| s.consumer_id == consumer_id)
                .map(|(&id, _)| id)
            else {
                debug!(consumer_id, "disable with no active session");
                return;
            };
            info!(session_id, consumer_id, "disabling tracing");
            #[allow(clippy::unwrap_used)] // id looked up above
            let session = state.sessions.remove(&session_id).unwrap();
            let mut callbacks = Vec::new();
            for instance in session.instances {
                if let Some(entry) = state.producers.get(&instance.producer_id) {
                    callbacks.push((entry.producer.clone(), instance.instance_id));
                }
            }
            callbacks
        };
        for (producer, instance_id) in callbacks {
            producer
                .lock_or_panic()
                .tear_down_data_source_instance(instance_id);
        }
    }

    /// There is no trace-buffer store in this core (trace data travels via
    /// shared memory and the output writer, both external); a read request
    /// drains nothing and terminates immediately.
    fn read_buffers(&self, consumer_id: ConsumerId) {
        let consumer = self
            .state
            .lock_or_panic()
            .consumers
            .get(&consumer_id)
            .map(|c| c.consumer.clone());
        if let Some(consumer) = consumer {
            consumer.lock_or_panic().on_trace_data(Vec::new(), false);
        }
    }

    fn disconnect_consumer(&self, consumer_id: ConsumerId) {
        self.disable_tracing(consumer_id);
        let consumer = {
            let mut state = self.state.lock_or_panic();
            state.consumers.remove(&consumer_id).map(|c| c.consumer)
        };
        if let Some(consumer) = consumer {
            info!(consumer_id, "consumer disconnected");
            consumer.lock_or_panic().on_disconnect();
        }
    }
}

fn fire_instance_callbacks(callbacks: Vec<InstanceCallback>) {
    for (producer, instance_id, config) in callbacks {
        producer
            .lock_or_panic()
            .create_data_source_instance(instance_id, &config);
    }
}

/// Producer endpoint handle; dropping it disconnects the producer and tears
/// down its data-source instances (and nothing else).
pub struct ProducerConnection {
    service: TracingService,
    producer_id: Option<ProducerId>,
}

impl ProducerConnection {
    /// `None` for connections refused by lockdown.
    pub fn producer_id(&self) -> Option<ProducerId> {
        self.producer_id
    }

    pub fn is_registered(&self) -> bool {
        self.producer_id.is_some()
    }

    /// Advertises a data source; returns its per-producer id, or 0 on an
    /// unregistered connection.
    pub fn register_data_source(&self, descriptor: DataSourceDescriptor) -> DataSourceId {
        match self.producer_id {
            Some(id) => self.service.register_data_source(id, descriptor),
            None => 0,
        }
    }

    pub fn unregister_data_source(&self, data_source_id: DataSourceId) {
        if let Some(id) = self.producer_id {
            self.service.unregister_data_source(id, data_source_id);
        }
    }
}

impl Drop for ProducerConnection {
    fn drop(&mut self) {
        if let Some(id) = self.producer_id.take() {
            self.service.disconnect_producer(id);
        }
    }
}

/// Consumer endpoint handle; dropping it tears down the whole session.
pub struct ConsumerConnection {
    service: TracingService,
    consumer_id: ConsumerId,
}

impl ConsumerConnection {
    /// Starts a session from `config`. Fails (returning false) if this
    /// consumer already has one.
    pub fn enable_tracing(&self, config: TraceConfig) -> bool {
        self.service.enable_tracing(self.consumer_id, config)
    }

    pub fn disable_tracing(&self) {
        self.service.disable_tracing(self.consumer_id);
    }

    pub fn read_buffers(&self) {
        self.service.read_buffers(self.consumer_id);
    }
}

impl Drop for ConsumerConnection {
    fn drop(&mut self) {
        self.service.disconnect_consumer(self.consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, DataSourceConfigEntry, ProducerConfig};
    use crate::shared_memory::HeapSharedMemoryFactory;
    use crate::MAX_PRODUCER_ID;

    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<String>>,
    }

    impl EventLog {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn drain(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    struct MockProducer {
        log: Arc<EventLog>,
        tag: &'static str,
    }

    impl MockProducer {
        fn new(log: &Arc<EventLog>, tag: &'static str) -> Arc<Mutex<dyn Producer>> {
            Arc::new(Mutex::new(MockProducer {
                log: log.clone(),
                tag,
            }))
        }
    }

    impl Producer for MockProducer {
        fn on_connect(&mut self) {
            self.log.push(format!("{}:connect", self.tag));
        }

        fn on_disconnect(&mut self) {
            self.log.push(format!("{}:disconnect", self.tag));
        }

        fn create_data_source_instance(
            &mut self,
            instance_id: DataSourceInstanceId,
            config: &DataSourceConfig,
        ) {
            self.log
                .push(format!("{}:create:{}:{}", self.tag, instance_id, config.name));
        }

        fn tear_down_data_source_instance(&mut self, instance_id: DataSourceInstanceId) {
            self.log.push(format!("{}:teardown:{}", self.tag, instance_id));
        }
    }

    struct MockConsumer {
        log: Arc<EventLog>,
    }

    impl MockConsumer {
        fn new(log: &Arc<EventLog>) -> Arc<Mutex<dyn Consumer>> {
            Arc::new(Mutex::new(MockConsumer { log: log.clone() }))
        }
    }

    impl Consumer for MockConsumer {
        fn on_connect(&mut self) {
            self.log.push("consumer:connect");
        }

        fn on_disconnect(&mut self) {
            self.log.push("consumer:disconnect");
        }

        fn on_trace_data(&mut self, packets: Vec<TracePacket>, has_more: bool) {
            self.log
                .push(format!("consumer:data:{}:{}", packets.len(), has_more));
        }
    }

    fn new_service() -> TracingService {
        TracingService::new(Box::new(HeapSharedMemoryFactory))
    }

    fn config_for(source_name: &str) -> TraceConfig {
        TraceConfig {
            buffers: vec![BufferConfig { size_kb: 4096 * 10 }],
            producers: vec![ProducerConfig {
                producer_name: "test_producer".to_string(),
                shm_size_kb: 128,
                page_size_kb: 4,
            }],
            data_sources: vec![DataSourceConfigEntry {
                config: DataSourceConfig {
                    name: source_name.to_string(),
                    target_buffer: 0,
                    ..Default::default()
                },
            }],
            ..Default::default()
        }
    }

    #[test]
    fn register_and_unregister() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());

        let conn1 = svc.connect_producer(MockProducer::new(&log, "p1"), 123);
        let conn2 = svc.connect_producer(MockProducer::new(&log, "p2"), 456);
        assert_eq!(vec!["p1:connect", "p2:connect"], log.drain());
        assert_eq!(2, svc.num_producers());
        assert_eq!(Some(1), conn1.producer_id());
        assert_eq!(Some(2), conn2.producer_id());
        assert_eq!(Some(123), svc.get_producer_uid(1));
        assert_eq!(Some(456), svc.get_producer_uid(2));

        let ds1 = conn1.register_data_source(DataSourceDescriptor {
            name: "foo".to_string(),
        });
        let ds2 = conn2.register_data_source(DataSourceDescriptor {
            name: "bar".to_string(),
        });
        assert_eq!(1, ds1);
        assert_eq!(1, ds2);
        conn1.unregister_data_source(ds1);
        conn2.unregister_data_source(ds2);

        drop(conn1);
        assert_eq!(vec!["p1:disconnect"], log.drain());
        assert_eq!(1, svc.num_producers());
        assert_eq!(None, svc.get_producer_uid(1));

        drop(conn2);
        assert_eq!(vec!["p2:disconnect"], log.drain());
        assert_eq!(0, svc.num_producers());
    }

    #[test]
    fn enable_and_disable_tracing() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());

        let producer = svc.connect_producer(MockProducer::new(&log, "p"), 123);
        let consumer = svc.connect_consumer(MockConsumer::new(&log));
        producer.register_data_source(DataSourceDescriptor {
            name: "foo".to_string(),
        });
        log.drain();

        assert!(consumer.enable_tracing(config_for("foo")));
        assert_eq!(vec!["p:create:1:foo"], log.drain());
        // Shared memory was sized from the producer config entry.
        assert_eq!(Some(128 * 1024), svc.producer_shm_size(1));

        // A second session on the same consumer is refused.
        assert!(!consumer.enable_tracing(config_for("foo")));

        consumer.disable_tracing();
        assert_eq!(vec!["p:teardown:1"], log.drain());
    }

    #[test]
    fn late_joining_producer_catches_up_with_the_session() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());

        let consumer = svc.connect_consumer(MockConsumer::new(&log));
        assert!(consumer.enable_tracing(config_for("foo")));

        let producer = svc.connect_producer(MockProducer::new(&log, "p"), 123);
        log.drain();
        producer.register_data_source(DataSourceDescriptor {
            name: "foo".to_string(),
        });
        assert_eq!(vec!["p:create:1:foo"], log.drain());
    }

    #[test]
    fn disconnecting_consumer_tears_down_the_session() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());

        let producer = svc.connect_producer(MockProducer::new(&log, "p"), 123);
        let consumer = svc.connect_consumer(MockConsumer::new(&log));
        producer.register_data_source(DataSourceDescriptor {
            name: "foo".to_string(),
        });
        assert!(consumer.enable_tracing(config_for("foo")));
        log.drain();

        drop(consumer);
        assert_eq!(
            vec!["p:teardown:1", "consumer:disconnect"],
            log.drain()
        );
    }

    #[test]
    fn reconnecting_producer_is_instantiated_again() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());

        let producer = svc.connect_producer(MockProducer::new(&log, "p"), 123);
        let consumer = svc.connect_consumer(MockConsumer::new(&log));
        producer.register_data_source(DataSourceDescriptor {
            name: "foo".to_string(),
        });
        assert!(consumer.enable_tracing(config_for("foo")));
        log.drain();

        // Producer disconnect tears down only its own instances; the
        // session stays alive.
        drop(producer);
        assert_eq!(vec!["p:teardown:1", "p:disconnect"], log.drain());

        let producer = svc.connect_producer(MockProducer::new(&log, "p"), 123);
        producer.register_data_source(DataSourceDescriptor {
            name: "foo".to_string(),
        });
        assert_eq!(vec!["p:connect", "p:create:2:foo"], log.drain());

        consumer.disable_tracing();
        assert_eq!(vec!["p:teardown:2"], log.drain());
    }

    #[test]
    fn producer_id_wrapping() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());
        let mut connections = HashMap::new();

        let mut connect = |svc: &TracingService, connections: &mut HashMap<ProducerId, _>| {
            let conn = svc.connect_producer(MockProducer::new(&log, "p"), 123);
            let id = conn.producer_id().unwrap();
            connections.insert(id, conn);
            id
        };

        for expected in 1..=4u16 {
            assert_eq!(expected, connect(&svc, &mut connections));
        }
        connections.remove(&1);
        connections.remove(&3);

        svc.set_last_producer_id_for_testing(MAX_PRODUCER_ID - 1);
        assert_eq!(MAX_PRODUCER_ID, connect(&svc, &mut connections));
        assert_eq!(1, connect(&svc, &mut connections));
        assert_eq!(3, connect(&svc, &mut connections));
        assert_eq!(5, connect(&svc, &mut connections));
        assert_eq!(6, connect(&svc, &mut connections));
    }

    #[test]
    fn lockdown_mode_rejects_other_uids() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());
        // SAFETY: geteuid cannot fail and touches no memory.
        let euid = unsafe { libc::geteuid() };

        let consumer = svc.connect_consumer(MockConsumer::new(&log));
        let mut config = config_for("foo");
        config.lockdown_mode = LockdownMode::Set;
        assert!(consumer.enable_tracing(config));
        log.drain();

        let rejected = svc.connect_producer(MockProducer::new(&log, "other"), euid + 1);
        let accepted = svc.connect_producer(MockProducer::new(&log, "same"), euid);
        assert_eq!(vec!["same:connect"], log.drain());
        assert!(!rejected.is_registered());
        assert!(accepted.is_registered());
        // Endpoint operations on the rejected connection are inert.
        assert_eq!(
            0,
            rejected.register_data_source(DataSourceDescriptor {
                name: "foo".to_string()
            })
        );
        assert_eq!(1, svc.num_producers());

        consumer.disable_tracing();
        let mut config = config_for("foo");
        config.lockdown_mode = LockdownMode::Clear;
        assert!(consumer.enable_tracing(config));
        log.drain();

        let now_accepted = svc.connect_producer(MockProducer::new(&log, "other"), euid + 1);
        assert_eq!(vec!["other:connect"], log.drain());
        assert!(now_accepted.is_registered());
    }

    #[test]
    fn read_buffers_terminates_immediately() {
        let svc = new_service();
        let log = Arc::new(EventLog::default());
        let consumer = svc.connect_consumer(MockConsumer::new(&log));
        log.drain();
        consumer.read_buffers();
        assert_eq!(vec!["consumer:data:0:false"], log.drain());
    }
}
