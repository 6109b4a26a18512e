// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end broker coverage over real sockets: a producer and a consumer
//! attach through the port services, a session is enabled, the producer
//! receives its instance commands, and trace data streams back.

use std::sync::{Arc, Mutex};

use tokio::net::UnixStream;
use tokio::runtime;
use tokio::sync::mpsc;

use tracekit_ipc::Host;
use tracekit_service::ports::{
    ConsumerIpcClient, ConsumerPortService, ProducerIpcClient, ProducerPortService,
};
use tracekit_service::{
    Consumer, DataSourceConfig, DataSourceDescriptor, HeapSharedMemoryFactory, Producer,
    TraceConfig, TracePacket, TracingService,
};

struct TestProducer {
    events: mpsc::UnboundedSender<String>,
    endpoint: ProducerIpcClient,
}

impl Producer for TestProducer {
    fn on_connect(&mut self) {
        self.events.send("connect".to_string()).unwrap();
        let events = self.events.clone();
        self.endpoint.register_data_source(
            DataSourceDescriptor {
                name: "test.source".to_string(),
            },
            move |id| events.send(format!("registered:{id}")).unwrap(),
        );
    }

    fn on_disconnect(&mut self) {
        self.events.send("disconnect".to_string()).unwrap();
    }

    fn create_data_source_instance(&mut self, instance_id: u64, config: &DataSourceConfig) {
        self.events
            .send(format!("create:{instance_id}:{}", config.name))
            .unwrap();
    }

    fn tear_down_data_source_instance(&mut self, instance_id: u64) {
        self.events.send(format!("teardown:{instance_id}")).unwrap();
    }
}

struct TestConsumer {
    events: mpsc::UnboundedSender<String>,
}

impl Consumer for TestConsumer {
    fn on_connect(&mut self) {
        self.events.send("consumer-connect".to_string()).unwrap();
    }

    fn on_disconnect(&mut self) {
        self.events.send("consumer-disconnect".to_string()).unwrap();
    }

    fn on_trace_data(&mut self, packets: Vec<TracePacket>, has_more: bool) {
        self.events
            .send(format!("data:{}:{has_more}", packets.len()))
            .unwrap();
    }
}

fn session_config() -> TraceConfig {
    let mut config = TraceConfig::default();
    config.data_sources.push(Default::default());
    config.data_sources[0].config = DataSourceConfig {
        name: "test.source".to_string(),
        ..Default::default()
    };
    config
}

#[test]
fn producer_and_consumer_round_trip_through_the_ports() {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let service = TracingService::new(Box::new(HeapSharedMemoryFactory));

        let producer_host = Host::new();
        producer_host.expose_service(Box::new(ProducerPortService::new(service.clone())));
        let consumer_host = Host::new();
        consumer_host.expose_service(Box::new(ConsumerPortService::new(service.clone())));

        let (producer_stream, producer_host_stream) = UnixStream::pair().unwrap();
        let host = producer_host.clone();
        tokio::spawn(async move { host.serve_connection(producer_host_stream).await });
        let (consumer_stream, consumer_host_stream) = UnixStream::pair().unwrap();
        let host = consumer_host.clone();
        tokio::spawn(async move { host.serve_connection(consumer_host_stream).await });

        // Producer side: attach, expect connect then registration.
        let endpoint = ProducerIpcClient::from_stream(producer_stream);
        let (producer_tx, mut producer_events) = mpsc::unbounded_channel();
        let producer = Arc::new(Mutex::new(TestProducer {
            events: producer_tx,
            endpoint: endpoint.clone(),
        }));
        endpoint.attach(producer, "test-producer");
        assert_eq!("connect", producer_events.recv().await.unwrap());
        assert_eq!("registered:1", producer_events.recv().await.unwrap());
        assert_eq!(1, service.num_producers());

        // Consumer side: attach and start a session naming the source.
        let consumer_endpoint = ConsumerIpcClient::from_stream(consumer_stream);
        let (consumer_tx, mut consumer_events) = mpsc::unbounded_channel();
        consumer_endpoint.attach(Arc::new(Mutex::new(TestConsumer { events: consumer_tx })));
        assert_eq!("consumer-connect", consumer_events.recv().await.unwrap());

        let (enabled_tx, mut enabled) = mpsc::unbounded_channel();
        consumer_endpoint.enable_tracing(&session_config(), move |ok| {
            enabled_tx.send(ok).unwrap();
        });
        assert!(enabled.recv().await.unwrap());
        assert_eq!("create:1:test.source", producer_events.recv().await.unwrap());

        // No trace buffers in the core: a read terminates immediately.
        consumer_endpoint.read_buffers();
        assert_eq!("data:0:false", consumer_events.recv().await.unwrap());

        consumer_endpoint.disable_tracing();
        assert_eq!("teardown:1", producer_events.recv().await.unwrap());
    });
}
