// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Host-side `ConsumerPort` service.
//!
//! A consumer connection maps 1:1 onto a broker [`ConsumerConnection`];
//! trace data flows back through the streaming `ReadBuffers` reply sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use tracekit_common::MutexExt;
use tracekit_ipc::service::{encode_msg, ServiceDescriptor};
use tracekit_ipc::{AsyncResult, ClientId, ClientInfo, Deferred, IpcService, MethodId};

use crate::ports::messages::{
    DisableTracingReply, EnableTracingArgs, EnableTracingReply, ReadBuffersReply,
    CONSUMER_PORT, METHOD_DISABLE_TRACING, METHOD_ENABLE_TRACING, METHOD_READ_BUFFERS,
};
use crate::ports::{decode_args, resolve_with};
use crate::tracing_service::{Consumer, TracePacket};
use crate::{ConsumerConnection, TracingService};

/// Broker-facing stand-in for a consumer living in another process.
struct RemoteConsumer {
    read_sink: Option<Deferred<Vec<u8>>>,
}

impl Consumer for RemoteConsumer {
    fn on_connect(&mut self) {}

    fn on_disconnect(&mut self) {
        self.read_sink = None;
    }

    fn on_trace_data(&mut self, packets: Vec<TracePacket>, has_more: bool) {
        let Some(sink) = self.read_sink.as_mut() else {
            debug!("trace data with no pending read");
            return;
        };
        let reply = ReadBuffersReply {
            packets: packets.into_iter().map(|p| p.data).collect(),
        };
        match encode_msg(&reply) {
            Ok(bytes) => sink.resolve(AsyncResult::new(bytes).with_has_more(has_more)),
            Err(e) => debug!("failed to encode trace data reply: {e}"),
        }
        if !has_more {
            self.read_sink = None;
        }
    }
}

struct PortConsumer {
    connection: ConsumerConnection,
    consumer: Arc<Mutex<RemoteConsumer>>,
}

pub struct ConsumerPortService {
    service: TracingService,
    clients: HashMap<ClientId, PortConsumer>,
}

impl ConsumerPortService {
    pub fn new(service: TracingService) -> Self {
        ConsumerPortService {
            service,
            clients: HashMap::new(),
        }
    }

    /// Consumers have no explicit initialize step; the broker attachment is
    /// created on the first method call.
    fn client_entry(&mut self, client: &ClientInfo) -> &mut PortConsumer {
        self.clients.entry(client.client_id).or_insert_with(|| {
            let consumer = Arc::new(Mutex::new(RemoteConsumer { read_sink: None }));
            let connection = self.service.connect_consumer(consumer.clone());
            PortConsumer {
                connection,
                consumer,
            }
        })
    }
}

impl IpcService for ConsumerPortService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &CONSUMER_PORT
    }

    fn on_invoke(
        &mut self,
        method_id: MethodId,
        args: &[u8],
        client: &ClientInfo,
        mut reply: Deferred<Vec<u8>>,
    ) {
        match method_id {
            METHOD_ENABLE_TRACING => {
                let Some(args) = decode_args::<EnableTracingArgs>(args) else {
                    return;
                };
                let enabled = self.client_entry(client).connection.enable_tracing(args.config);
                resolve_with(&mut reply, &EnableTracingReply { enabled });
            }
            METHOD_DISABLE_TRACING => {
                self.client_entry(client).connection.disable_tracing();
                resolve_with(&mut reply, &DisableTracingReply {});
            }
            METHOD_READ_BUFFERS => {
                let entry = self.client_entry(client);
                entry.consumer.lock_or_panic().read_sink = Some(reply);
                entry.connection.read_buffers();
            }
            other => debug!(method_id = other, "unknown consumer port method"),
        }
    }

    fn on_client_disconnected(&mut self, client: &ClientInfo) {
        // Dropping the connection tears the whole session down.
        self.clients.remove(&client.client_id);
    }
}
