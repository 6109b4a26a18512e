// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Client-side wrapper producers use to attach to the service socket.
//!
//! `attach` binds the `ProducerPort` proxy and drives the handshake:
//! `InitializeConnection`, then the long-lived `GetAsyncCommand` stream,
//! then the producer's `on_connect`. From there broker commands arrive as
//! streamed replies and are turned back into [`Producer`] trait calls, so a
//! producer implementation cannot tell whether its broker is remote.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{debug, error, warn};

use tracekit_common::MutexExt;
use tracekit_ipc::service::reply_deferred;
use tracekit_ipc::{Client, ProxyEventListener, ServiceProxy};

use crate::config::DataSourceDescriptor;
use crate::ports::messages::{
    AsyncCommand, GetAsyncCommandArgs, InitializeConnectionArgs, InitializeConnectionReply,
    RegisterDataSourceArgs, RegisterDataSourceReply, UnregisterDataSourceArgs,
    UnregisterDataSourceReply, PRODUCER_PORT,
};
use crate::tracing_service::Producer;
use crate::DataSourceId;

const INITIAL_CONNECTION_BACKOFF: Duration = Duration::from_millis(250);
const MAX_CONNECTION_BACKOFF: Duration = Duration::from_secs(30);

struct Attachment {
    producer: Arc<Mutex<dyn Producer>>,
    producer_name: String,
}

struct State {
    client: Client,
    proxy: OnceLock<Arc<Mutex<ServiceProxy>>>,
    attachment: OnceLock<Attachment>,
}

impl State {
    fn start_async_command_stream(self: &Arc<Self>) {
        let Some(proxy) = self.proxy.get() else {
            return;
        };
        let state = self.clone();
        let commands = reply_deferred::<AsyncCommand, _>(move |result| {
            let Some(attachment) = state.attachment.get() else {
                return;
            };
            // Stream termination (reject on disconnect) carries no command;
            // the proxy listener delivers on_disconnect separately.
            let Some(command) = result.into_msg() else {
                return;
            };
            match command {
                AsyncCommand::CreateDataSourceInstance {
                    instance_id,
                    config,
                } => attachment
                    .producer
                    .lock_or_panic()
                    .create_data_source_instance(instance_id, &config),
                AsyncCommand::TearDownDataSource { instance_id } => attachment
                    .producer
                    .lock_or_panic()
                    .tear_down_data_source_instance(instance_id),
            }
        });
        let request_id =
            self.client
                .invoke_method(proxy, "GetAsyncCommand", &GetAsyncCommandArgs {}, commands);
        if request_id == 0 {
            warn!("failed to start the async command stream");
        }
    }
}

struct PortListener {
    state: Arc<State>,
}

impl ProxyEventListener for PortListener {
    fn on_connect(&mut self, success: bool) {
        let Some(attachment) = self.state.attachment.get() else {
            return;
        };
        if !success {
            error!("failed to bind ProducerPort");
            attachment.producer.lock_or_panic().on_disconnect();
            return;
        }
        let Some(proxy) = self.state.proxy.get() else {
            return;
        };
        let args = InitializeConnectionArgs {
            producer_name: attachment.producer_name.clone(),
        };
        let state = self.state.clone();
        let reply = reply_deferred::<InitializeConnectionReply, _>(move |result| {
            let Some(attachment) = state.attachment.get() else {
                return;
            };
            match result.into_msg() {
                Some(reply) if reply.registered => {
                    // Open the command stream before announcing the
                    // connection, so data sources registered from
                    // on_connect cannot outrun it.
                    state.start_async_command_stream();
                    attachment.producer.lock_or_panic().on_connect();
                }
                Some(_) => warn!("producer connection refused by the service (lockdown)"),
                None => warn!("InitializeConnection failed"),
            }
        });
        self.state
            .client
            .invoke_method(proxy, "InitializeConnection", &args, reply);
    }

    fn on_disconnect(&mut self) {
        if let Some(attachment) = self.state.attachment.get() {
            attachment.producer.lock_or_panic().on_disconnect();
        }
    }
}

/// Producer endpoint over IPC. Cheap to clone; producers keep a clone to
/// register data sources from their callbacks.
#[derive(Clone)]
pub struct ProducerIpcClient {
    state: Arc<State>,
}

impl ProducerIpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<ProducerIpcClient> {
        Ok(Self::from_client(Client::connect(path).await?))
    }

    /// Retries with exponential backoff until the service socket accepts;
    /// probes and profilers start before the service under most inits.
    pub async fn connect_with_retries(path: impl AsRef<Path>) -> ProducerIpcClient {
        let mut backoff = INITIAL_CONNECTION_BACKOFF;
        loop {
            match Client::connect(&path).await {
                Ok(client) => return Self::from_client(client),
                Err(e) => {
                    debug!("service socket not ready ({e}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_CONNECTION_BACKOFF);
                }
            }
        }
    }

    pub fn from_stream(stream: UnixStream) -> ProducerIpcClient {
        Self::from_client(Client::from_stream(stream))
    }

    fn from_client(client: Client) -> ProducerIpcClient {
        ProducerIpcClient {
            state: Arc::new(State {
                client,
                proxy: OnceLock::new(),
                attachment: OnceLock::new(),
            }),
        }
    }

    /// Starts the handshake; `producer` receives `on_connect` once the
    /// service has accepted the connection and the command stream is up.
    pub fn attach(&self, producer: Arc<Mutex<dyn Producer>>, producer_name: &str) {
        if self
            .state
            .attachment
            .set(Attachment {
                producer,
                producer_name: producer_name.to_string(),
            })
            .is_err()
        {
            warn!("attach called twice on one producer connection");
            return;
        }
        let proxy = Arc::new(Mutex::new(ServiceProxy::new(
            &PRODUCER_PORT,
            Box::new(PortListener {
                state: self.state.clone(),
            }),
        )));
        let _ = self.state.proxy.set(proxy.clone());
        self.state.client.bind_service(&proxy);
    }

    /// Advertises a data source; `on_registered` receives the assigned id,
    /// or 0 if the service refused or the connection is gone.
    pub fn register_data_source(
        &self,
        descriptor: DataSourceDescriptor,
        on_registered: impl FnOnce(DataSourceId) + Send + 'static,
    ) {
        let Some(proxy) = self.state.proxy.get() else {
            on_registered(0);
            return;
        };
        let mut on_registered = Some(on_registered);
        let reply = reply_deferred::<RegisterDataSourceReply, _>(move |result| {
            if let Some(callback) = on_registered.take() {
                callback(
                    result
                        .into_msg()
                        .map(|reply| reply.data_source_id)
                        .unwrap_or(0),
                );
            }
        });
        self.state.client.invoke_method(
            proxy,
            "RegisterDataSource",
            &RegisterDataSourceArgs { descriptor },
            reply,
        );
    }

    pub fn unregister_data_source(&self, data_source_id: DataSourceId) {
        let Some(proxy) = self.state.proxy.get() else {
            return;
        };
        let reply = reply_deferred::<UnregisterDataSourceReply, _>(|_| {});
        self.state.client.invoke_method(
            proxy,
            "UnregisterDataSource",
            &UnregisterDataSourceArgs { data_source_id },
            reply,
        );
    }
}
