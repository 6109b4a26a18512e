// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Host-side `ProducerPort` service.
//!
//! Each connected producer process gets a [`RemoteProducer`]: the broker's
//! view of that peer. Broker-to-producer callbacks turn into
//! [`AsyncCommand`]s streamed through the peer's `GetAsyncCommand` reply
//! sink; commands issued before the sink arrives are queued and flushed
//! when it does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use tracekit_common::MutexExt;
use tracekit_ipc::service::{encode_msg, ServiceDescriptor};
use tracekit_ipc::{AsyncResult, ClientId, ClientInfo, Deferred, IpcService, MethodId};

use crate::config::DataSourceConfig;
use crate::ports::{decode_args, resolve_with};
use crate::ports::messages::{
    AsyncCommand, InitializeConnectionArgs, InitializeConnectionReply, RegisterDataSourceArgs,
    RegisterDataSourceReply, UnregisterDataSourceArgs, UnregisterDataSourceReply,
    METHOD_GET_ASYNC_COMMAND, METHOD_INITIALIZE_CONNECTION, METHOD_REGISTER_DATA_SOURCE,
    METHOD_UNREGISTER_DATA_SOURCE, PRODUCER_PORT,
};
use crate::tracing_service::Producer;
use crate::{DataSourceInstanceId, ProducerConnection, TracingService};

/// Broker-facing stand-in for a producer living in another process.
struct RemoteProducer {
    name: String,
    command_sink: Option<Deferred<Vec<u8>>>,
    queued_commands: Vec<AsyncCommand>,
}

impl RemoteProducer {
    fn send_command(&mut self, command: AsyncCommand) {
        match &mut self.command_sink {
            Some(sink) => match encode_msg(&command) {
                Ok(bytes) => sink.resolve(AsyncResult::new(bytes).with_has_more(true)),
                Err(e) => warn!(producer = %self.name, "failed to encode command: {e}"),
            },
            None => self.queued_commands.push(command),
        }
    }

    fn install_sink(&mut self, sink: Deferred<Vec<u8>>) {
        // Replacing an existing sink terminates the old streaming request
        // through its drop-reject.
        self.command_sink = Some(sink);
        for command in std::mem::take(&mut self.queued_commands) {
            self.send_command(command);
        }
    }
}

impl Producer for RemoteProducer {
    fn on_connect(&mut self) {
        // The remote peer learns about this from the InitializeConnection
        // reply instead.
    }

    fn on_disconnect(&mut self) {
        self.command_sink = None;
    }

    fn create_data_source_instance(
        &mut self,
        instance_id: DataSourceInstanceId,
        config: &DataSourceConfig,
    ) {
        self.send_command(AsyncCommand::CreateDataSourceInstance {
            instance_id,
            config: config.clone(),
        });
    }

    fn tear_down_data_source_instance(&mut self, instance_id: DataSourceInstanceId) {
        self.send_command(AsyncCommand::TearDownDataSource { instance_id });
    }
}

struct PortProducer {
    connection: ProducerConnection,
    producer: Arc<Mutex<RemoteProducer>>,
}

pub struct ProducerPortService {
    service: TracingService,
    clients: HashMap<ClientId, PortProducer>,
}

impl ProducerPortService {
    pub fn new(service: TracingService) -> Self {
        ProducerPortService {
            service,
            clients: HashMap::new(),
        }
    }

    fn initialize_connection(
        &mut self,
        args: InitializeConnectionArgs,
        client: &ClientInfo,
        mut reply: Deferred<Vec<u8>>,
    ) {
        let producer = Arc::new(Mutex::new(RemoteProducer {
            name: args.producer_name,
            command_sink: None,
            queued_commands: Vec::new(),
        }));
        let connection = self
            .service
            .connect_producer(producer.clone(), client.uid);
        let registered = connection.is_registered();
        self.clients.insert(
            client.client_id,
            PortProducer {
                connection,
                producer,
            },
        );
        resolve_with(&mut reply, &InitializeConnectionReply { registered });
    }
}

impl IpcService for ProducerPortService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &PRODUCER_PORT
    }

    fn on_invoke(
        &mut self,
        method_id: MethodId,
        args: &[u8],
        client: &ClientInfo,
        mut reply: Deferred<Vec<u8>>,
    ) {
        match method_id {
            METHOD_INITIALIZE_CONNECTION => {
                let Some(args) = decode_args::<InitializeConnectionArgs>(args) else {
                    return;
                };
                self.initialize_connection(args, client, reply);
            }
            METHOD_REGISTER_DATA_SOURCE => {
                let Some(args) = decode_args::<RegisterDataSourceArgs>(args) else {
                    return;
                };
                let Some(port_producer) = self.clients.get(&client.client_id) else {
                    debug!("register before InitializeConnection");
                    return;
                };
                let data_source_id = port_producer
                    .connection
                    .register_data_source(args.descriptor);
                resolve_with(&mut reply, &RegisterDataSourceReply { data_source_id });
            }
            METHOD_UNREGISTER_DATA_SOURCE => {
                let Some(args) = decode_args::<UnregisterDataSourceArgs>(args) else {
                    return;
                };
                let Some(port_producer) = self.clients.get(&client.client_id) else {
                    return;
                };
                port_producer
                    .connection
                    .unregister_data_source(args.data_source_id);
                resolve_with(&mut reply, &UnregisterDataSourceReply {});
            }
            METHOD_GET_ASYNC_COMMAND => {
                let Some(port_producer) = self.clients.get(&client.client_id) else {
                    debug!("GetAsyncCommand before InitializeConnection");
                    return;
                };
                port_producer.producer.lock_or_panic().install_sink(reply);
            }
            other => debug!(method_id = other, "unknown producer port method"),
        }
    }

    fn on_client_disconnected(&mut self, client: &ClientInfo) {
        // Dropping the connection tears down this producer's instances and
        // unregisters it from the broker.
        self.clients.remove(&client.client_id);
    }
}
