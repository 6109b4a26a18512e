// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Client-side wrapper for consumers attaching over the consumer socket.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::net::UnixStream;
use tracing::{error, warn};

use tracekit_common::MutexExt;
use tracekit_ipc::service::reply_deferred;
use tracekit_ipc::{Client, ProxyEventListener, ServiceProxy};

use crate::config::TraceConfig;
use crate::ports::messages::{
    DisableTracingArgs, DisableTracingReply, EnableTracingArgs, EnableTracingReply,
    ReadBuffersArgs, ReadBuffersReply, CONSUMER_PORT,
};
use crate::tracing_service::{Consumer, TracePacket};

struct State {
    client: Client,
    proxy: OnceLock<Arc<Mutex<ServiceProxy>>>,
    consumer: OnceLock<Arc<Mutex<dyn Consumer>>>,
}

struct PortListener {
    state: Arc<State>,
}

impl ProxyEventListener for PortListener {
    fn on_connect(&mut self, success: bool) {
        let Some(consumer) = self.state.consumer.get() else {
            return;
        };
        if success {
            consumer.lock_or_panic().on_connect();
        } else {
            error!("failed to bind ConsumerPort");
            consumer.lock_or_panic().on_disconnect();
        }
    }

    fn on_disconnect(&mut self) {
        if let Some(consumer) = self.state.consumer.get() {
            consumer.lock_or_panic().on_disconnect();
        }
    }
}

/// Consumer endpoint over IPC.
#[derive(Clone)]
pub struct ConsumerIpcClient {
    state: Arc<State>,
}

impl ConsumerIpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<ConsumerIpcClient> {
        Ok(Self::from_client(Client::connect(path).await?))
    }

    pub fn from_stream(stream: UnixStream) -> ConsumerIpcClient {
        Self::from_client(Client::from_stream(stream))
    }

    fn from_client(client: Client) -> ConsumerIpcClient {
        ConsumerIpcClient {
            state: Arc::new(State {
                client,
                proxy: OnceLock::new(),
                consumer: OnceLock::new(),
            }),
        }
    }

    pub fn attach(&self, consumer: Arc<Mutex<dyn Consumer>>) {
        if self.state.consumer.set(consumer).is_err() {
            warn!("attach called twice on one consumer connection");
            return;
        }
        let proxy = Arc::new(Mutex::new(ServiceProxy::new(
            &CONSUMER_PORT,
            Box::new(PortListener {
                state: self.state.clone(),
            }),
        )));
        let _ = self.state.proxy.set(proxy.clone());
        self.state.client.bind_service(&proxy);
    }

    pub fn enable_tracing(
        &self,
        config: &TraceConfig,
        on_result: impl FnOnce(bool) + Send + 'static,
    ) {
        let Some(proxy) = self.state.proxy.get() else {
            on_result(false);
            return;
        };
        let mut on_result = Some(on_result);
        let reply = reply_deferred::<EnableTracingReply, _>(move |result| {
            if let Some(callback) = on_result.take() {
                callback(result.into_msg().map(|r| r.enabled).unwrap_or(false));
            }
        });
        self.state.client.invoke_method(
            proxy,
            "EnableTracing",
            &EnableTracingArgs {
                config: config.clone(),
            },
            reply,
        );
    }

    pub fn disable_tracing(&self) {
        let Some(proxy) = self.state.proxy.get() else {
            return;
        };
        let reply = reply_deferred::<DisableTracingReply, _>(|_| {});
        self.state
            .client
            .invoke_method(proxy, "DisableTracing", &DisableTracingArgs {}, reply);
    }

    /// Requests the session's trace data; chunks arrive through the
    /// consumer's `on_trace_data` until one with `has_more == false`.
    pub fn read_buffers(&self) {
        let Some(proxy) = self.state.proxy.get() else {
            return;
        };
        let state = self.state.clone();
        let reply = reply_deferred::<ReadBuffersReply, _>(move |result| {
            let Some(consumer) = state.consumer.get() else {
                return;
            };
            let has_more = result.has_more();
            let Some(reply) = result.into_msg() else {
                return;
            };
            let packets = reply
                .packets
                .into_iter()
                .map(|data| TracePacket { data })
                .collect();
            consumer.lock_or_panic().on_trace_data(packets, has_more);
        });
        self.state
            .client
            .invoke_method(proxy, "ReadBuffers", &ReadBuffersArgs {}, reply);
    }
}
