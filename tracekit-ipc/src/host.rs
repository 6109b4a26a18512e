// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Host side of the method-invocation layer.
//!
//! A [`Host`] exposes [`IpcService`] implementations on a listening socket.
//! Each accepted connection gets its own reader loop and writer task; frames
//! are tokenized by the same [`BufferedFrameDeserializer`] the client uses.
//! `BindService` answers with the service id and its method table (ids are
//! 1-based positions in the descriptor); `InvokeMethod` hands the service a
//! [`Deferred`] reply sink tied to the originating request id. Every
//! resolution of that sink becomes one `InvokeMethodReply`; a sink dropped
//! without a terminal resolution produces the mandatory final
//! `{success: false}` reply through the drop-reject path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tracekit_common::MutexExt;

use crate::buffered_frame_deserializer::BufferedFrameDeserializer;
use crate::service::ServiceDescriptor;
use crate::wire::{Frame, FrameMsg, MethodInfo};
use crate::{AsyncResult, ClientId, Deferred, MethodId, RequestId, ServiceId};

/// Identity of the peer on one accepted connection, from `SO_PEERCRED`.
/// The broker's lockdown policy is the main consumer of `uid`.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub uid: u32,
    pub pid: Option<i32>,
}

/// A service reachable through a [`Host`].
///
/// `on_invoke` runs on the connection's reader task. The reply sink may be
/// resolved synchronously, stashed for later, or resolved repeatedly with
/// `has_more` for streaming replies.
pub trait IpcService: Send {
    fn descriptor(&self) -> &'static ServiceDescriptor;

    fn on_invoke(
        &mut self,
        method_id: MethodId,
        args: &[u8],
        client: &ClientInfo,
        reply: Deferred<Vec<u8>>,
    );

    /// Called once per service when a connection goes away, after its
    /// outstanding reply sinks (if the service kept any) should be
    /// considered dead.
    fn on_client_disconnected(&mut self, _client: &ClientInfo) {}
}

struct ExposedService {
    id: ServiceId,
    service: Mutex<Box<dyn IpcService>>,
}

struct HostInner {
    services: Mutex<Vec<Arc<ExposedService>>>,
    last_client_id: AtomicU64,
}

#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Default for Host {
    fn default() -> Self {
        Host::new()
    }
}

impl Host {
    pub fn new() -> Host {
        Host {
            inner: Arc::new(HostInner {
                services: Mutex::new(Vec::new()),
                last_client_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a service; its id is its registration order, starting at 1.
    pub fn expose_service(&self, service: Box<dyn IpcService>) -> ServiceId {
        let mut services = self.inner.services.lock_or_panic();
        let id = services.len() as ServiceId + 1;
        info!(
            service = service.descriptor().service_name,
            id, "exposing service"
        );
        services.push(Arc::new(ExposedService {
            id,
            service: Mutex::new(service),
        }));
        id
    }

    /// Accept loop; runs until the listener errors out.
    pub async fn serve(&self, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let host = self.clone();
                    tokio::spawn(async move { host.serve_connection(stream).await });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Runs one connection to completion. Public so tests (and loopback
    /// setups) can drive a socketpair without a listener.
    pub async fn serve_connection(&self, stream: UnixStream) {
        let client = ClientInfo {
            client_id: self.inner.last_client_id.fetch_add(1, Ordering::Relaxed) + 1,
            uid: peer_uid(&stream).unwrap_or(u32::MAX),
            pid: peer_pid(&stream),
        };
        debug!(client.client_id, client.uid, "accepted connection");

        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(write_half, rx));

        let mut deserializer = BufferedFrameDeserializer::default();
        'receive: loop {
            let n = {
                let buf = deserializer.begin_receive();
                match read_half.read(buf).await {
                    Ok(0) | Err(_) => break 'receive,
                    Ok(n) => n,
                }
            };
            if let Err(e) = deserializer.end_receive(n) {
                warn!(client.client_id, "dropping connection: {e}");
                break 'receive;
            }
            while let Some(payload) = deserializer.pop_next_frame() {
                match Frame::decode(&payload) {
                    Ok(frame) => self.on_frame_received(frame, &client, &tx),
                    Err(e) => debug!(client.client_id, "dropping malformed frame: {e}"),
                }
            }
        }

        debug!(client.client_id, "connection closed");
        let services: Vec<_> = self.inner.services.lock_or_panic().clone();
        for exposed in services {
            exposed
                .service
                .lock_or_panic()
                .on_client_disconnected(&client);
        }
    }

    fn on_frame_received(
        &self,
        frame: Frame,
        client: &ClientInfo,
        tx: &mpsc::UnboundedSender<Bytes>,
    ) {
        let Frame { request_id, msg } = frame;
        if request_id == 0 {
            debug!("dropping request with id 0");
            return;
        }
        match msg {
            FrameMsg::BindService { service_name } => {
                self.on_bind_service(request_id, &service_name, tx);
            }
            FrameMsg::InvokeMethod {
                service_id,
                method_id,
                args,
            } => {
                self.on_invoke_method(request_id, service_id, method_id, &args, client, tx);
            }
            FrameMsg::BindServiceReply { .. } | FrameMsg::InvokeMethodReply { .. } => {
                debug!(request_id, "unexpected reply frame on a host connection");
            }
        }
    }

    fn on_bind_service(
        &self,
        request_id: RequestId,
        service_name: &str,
        tx: &mpsc::UnboundedSender<Bytes>,
    ) {
        let exposed = {
            let services = self.inner.services.lock_or_panic();
            services
                .iter()
                .find(|s| s.service.lock_or_panic().descriptor().service_name == service_name)
                .cloned()
        };
        let msg = match exposed {
            Some(exposed) => {
                let descriptor = exposed.service.lock_or_panic().descriptor();
                let methods = descriptor
                    .methods
                    .iter()
                    .enumerate()
                    .map(|(idx, m)| MethodInfo {
                        name: m.name.to_string(),
                        id: idx as MethodId + 1,
                    })
                    .collect();
                FrameMsg::BindServiceReply {
                    success: true,
                    service_id: exposed.id,
                    methods,
                }
            }
            None => {
                debug!(service = service_name, "bind for unknown service");
                FrameMsg::BindServiceReply {
                    success: false,
                    service_id: 0,
                    methods: Vec::new(),
                }
            }
        };
        send_frame(tx, Frame { request_id, msg });
    }

    fn on_invoke_method(
        &self,
        request_id: RequestId,
        service_id: ServiceId,
        method_id: MethodId,
        args: &[u8],
        client: &ClientInfo,
        tx: &mpsc::UnboundedSender<Bytes>,
    ) {
        let exposed = {
            let services = self.inner.services.lock_or_panic();
            services.iter().find(|s| s.id == service_id).cloned()
        };
        let Some(exposed) = exposed else {
            debug!(service_id, "invoke on unknown service");
            send_failure_reply(tx, request_id);
            return;
        };
        let method_count = exposed.service.lock_or_panic().descriptor().methods.len();
        if method_id == 0 || method_id as usize > method_count {
            debug!(service_id, method_id, "invoke on unknown method");
            send_failure_reply(tx, request_id);
            return;
        }

        let reply_tx = tx.clone();
        let reply = Deferred::bound(move |result: AsyncResult<Vec<u8>>| {
            let frame = Frame {
                request_id,
                msg: FrameMsg::InvokeMethodReply {
                    success: result.success(),
                    has_more: result.has_more(),
                    reply: result.into_msg().unwrap_or_default(),
                },
            };
            match frame.encode() {
                // A send failure here means the connection is already gone;
                // nothing left to answer.
                Ok(buf) => {
                    let _ = reply_tx.send(buf);
                }
                Err(e) => {
                    warn!(request_id, "failed to serialize reply: {e}");
                    send_failure_reply(&reply_tx, request_id);
                }
            }
        });
        exposed
            .service
            .lock_or_panic()
            .on_invoke(method_id, args, client, reply);
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Bytes>, frame: Frame) {
    match frame.encode() {
        Ok(buf) => {
            let _ = tx.send(buf);
        }
        Err(e) => warn!("failed to serialize outgoing frame: {e}"),
    }
}

fn send_failure_reply(tx: &mpsc::UnboundedSender<Bytes>, request_id: RequestId) {
    send_frame(
        tx,
        Frame {
            request_id,
            msg: FrameMsg::InvokeMethodReply {
                success: false,
                has_more: false,
                reply: Vec::new(),
            },
        },
    );
}

fn peer_uid(stream: &UnixStream) -> Option<u32> {
    stream.peer_cred().ok().map(|cred| cred.uid())
}

fn peer_pid(stream: &UnixStream) -> Option<i32> {
    stream.peer_cred().ok().and_then(|cred| cred.pid())
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(buf) = rx.recv().await {
        if write_half.write_all(&buf).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
