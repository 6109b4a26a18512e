// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Client side of the method-invocation layer.
//!
//! A [`Client`] owns one connection to a host. Outgoing frames go through an
//! unbounded channel to a writer task, which keeps `bind_service` and
//! `invoke_method` synchronous: a request either gets queued (non-zero
//! request id) or fails on the spot. A reader task feeds the frame
//! deserializer and dispatches replies to the proxies that asked for them.
//!
//! The request table holds weak proxy references only: a proxy dropped by
//! its owner silently cancels whatever it had in flight, and a connection
//! that goes away rejects every outstanding request and tells every bound
//! proxy it is disconnected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tracekit_common::MutexExt;

use crate::buffered_frame_deserializer::BufferedFrameDeserializer;
use crate::service::{ProxyEventListener, ReplyPayload, ServiceProxy};
use crate::wire::{Frame, FrameMsg, MsgKind};
use crate::{Deferred, RequestId, ServiceId};

struct QueuedRequest {
    kind: MsgKind,
    method_name: Option<&'static str>,
    proxy: Weak<Mutex<ServiceProxy>>,
}

struct ClientInner {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    last_request_id: RequestId,
    queued_requests: HashMap<RequestId, QueuedRequest>,
    service_bindings: HashMap<ServiceId, Weak<Mutex<ServiceProxy>>>,
    connected: bool,
}

impl ClientInner {
    fn next_request_id(&mut self) -> RequestId {
        self.last_request_id += 1;
        self.last_request_id
    }

    fn send_frame(&mut self, frame: &Frame) -> bool {
        if !self.connected {
            return false;
        }
        let encoded = match frame.encode() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("failed to serialize outgoing frame: {e}");
                return false;
            }
        };
        match &self.tx {
            Some(tx) => tx.send(encoded).is_ok(),
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Mutex<ClientInner>>,
}

impl Client {
    /// Connects to a host socket. Must be called from within a runtime; the
    /// connection's reader and writer tasks are spawned on it.
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Client> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Builds a client over an already-established stream (tests use a
    /// socketpair).
    pub fn from_stream(stream: UnixStream) -> Client {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(ClientInner {
            tx: Some(tx),
            last_request_id: 0,
            queued_requests: HashMap::new(),
            service_bindings: HashMap::new(),
            connected: true,
        }));
        tokio::spawn(writer_task(write_half, rx));
        tokio::spawn(reader_task(read_half, inner.clone()));
        Client { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_or_panic().connected
    }

    /// Stops sending; the host observing EOF will close its side, which in
    /// turn fans disconnect out to the proxies.
    pub fn close(&self) {
        let mut inner = self.inner.lock_or_panic();
        inner.tx = None;
    }

    /// Starts binding `proxy` to its remote service.
    ///
    /// The proxy's listener gets `on_connect(true)` once the host replies
    /// with the method table, `on_connect(false)` on a bind refusal — or
    /// synchronously, before this returns, if the frame cannot be sent.
    pub fn bind_service(&self, proxy: &Arc<Mutex<ServiceProxy>>) {
        let service_name = proxy.lock_or_panic().descriptor().service_name;
        let sent = {
            let mut inner = self.inner.lock_or_panic();
            let request_id = inner.next_request_id();
            let frame = Frame {
                request_id,
                msg: FrameMsg::BindService {
                    service_name: service_name.to_string(),
                },
            };
            if inner.send_frame(&frame) {
                inner.queued_requests.insert(
                    request_id,
                    QueuedRequest {
                        kind: MsgKind::BindService,
                        method_name: None,
                        proxy: Arc::downgrade(proxy),
                    },
                );
                true
            } else {
                false
            }
        };
        if !sent {
            debug!(service = service_name, "bind_service failed to send");
            notify_connect(proxy, false);
        }
    }

    /// Invokes `method_name` on the service behind `proxy`.
    ///
    /// Returns the request id, or 0 if the arguments failed to serialize,
    /// the proxy is not bound, or the frame could not be queued; on every
    /// failure path `reply` is dropped, which fires its callback with the
    /// failure marker.
    pub fn invoke_method<A: serde::Serialize>(
        &self,
        proxy: &Arc<Mutex<ServiceProxy>>,
        method_name: &'static str,
        args: &A,
        reply: Deferred<ReplyPayload>,
    ) -> RequestId {
        let (service_id, method_id) = {
            let proxy = proxy.lock_or_panic();
            let Some(method_id) = proxy.remote_method_id(method_name) else {
                debug!(method = method_name, "invoke on unbound or unknown method");
                return 0;
            };
            (proxy.service_id(), method_id)
        };
        let args = match bincode::serialize(args) {
            Ok(args) => args,
            Err(e) => {
                debug!(method = method_name, "failed to serialize args: {e}");
                return 0;
            }
        };

        let request_id = self.inner.lock_or_panic().next_request_id();
        // The reply slot must be in place before the frame leaves, or a
        // fast reply could race past it.
        proxy.lock_or_panic().insert_pending(request_id, reply);

        let sent = {
            let mut inner = self.inner.lock_or_panic();
            let frame = Frame {
                request_id,
                msg: FrameMsg::InvokeMethod {
                    service_id,
                    method_id,
                    args,
                },
            };
            if inner.send_frame(&frame) {
                inner.queued_requests.insert(
                    request_id,
                    QueuedRequest {
                        kind: MsgKind::InvokeMethod,
                        method_name: Some(method_name),
                        proxy: Arc::downgrade(proxy),
                    },
                );
                true
            } else {
                false
            }
        };
        if !sent {
            debug!(method = method_name, "invoke_method failed to send");
            proxy.lock_or_panic().take_pending(request_id);
            return 0;
        }
        request_id
    }
}

/// Fires the proxy's connect callback with no locks held, so the callback
/// can issue invocations of its own.
fn notify_connect(proxy: &Arc<Mutex<ServiceProxy>>, success: bool) {
    let listener = proxy.lock_or_panic().take_listener();
    if let Some(mut listener) = listener {
        listener.on_connect(success);
        proxy.lock_or_panic().put_listener(listener);
    }
}

fn notify_disconnect(proxy: &Arc<Mutex<ServiceProxy>>) {
    let listener = {
        let mut proxy = proxy.lock_or_panic();
        proxy.set_disconnected();
        proxy.take_listener()
    };
    if let Some(mut listener) = listener {
        listener.on_disconnect();
        proxy.lock_or_panic().put_listener(listener);
    }
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(buf) = rx.recv().await {
        if write_half.write_all(&buf).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn reader_task(mut read_half: OwnedReadHalf, inner: Arc<Mutex<ClientInner>>) {
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
            warn!("dropping connection: {e}");
            break 'receive;
        }
        while let Some(payload) = deserializer.pop_next_frame() {
            match Frame::decode(&payload) {
                Ok(frame) => on_frame_received(&inner, frame),
                Err(e) => debug!("dropping malformed frame: {e}"),
            }
        }
    }
    on_connection_closed(&inner);
}

fn on_frame_received(inner: &Arc<Mutex<ClientInner>>, frame: Frame) {
    let Frame { request_id, msg } = frame;
    if matches!(
        msg,
        FrameMsg::BindService { .. } | FrameMsg::InvokeMethod { .. }
    ) {
        debug!(request_id, "unexpected request frame on a client connection");
        return;
    }

    let (method_name, proxy) = {
        let mut guard = inner.lock_or_panic();
        let Some(request) = guard.queued_requests.get(&request_id) else {
            debug!(request_id, "reply for unknown request");
            return;
        };
        if request.kind.reply_kind() != msg.kind() {
            warn!(
                request_id,
                "reply kind does not match the request, dropping the request"
            );
            guard.queued_requests.remove(&request_id);
            return;
        }
        let streaming = matches!(&msg, FrameMsg::InvokeMethodReply { has_more: true, .. });
        if streaming {
            let request = &guard.queued_requests[&request_id];
            (request.method_name, request.proxy.clone())
        } else {
            #[allow(clippy::unwrap_used)] // presence checked above
            let request = guard.queued_requests.remove(&request_id).unwrap();
            (request.method_name, request.proxy)
        }
    };

    let Some(proxy) = proxy.upgrade() else {
        debug!(request_id, "reply for a dropped proxy");
        return;
    };

    match msg {
        FrameMsg::BindServiceReply {
            success,
            service_id,
            methods,
        } => {
            if !success {
                debug!(
                    service = proxy.lock_or_panic().descriptor().service_name,
                    "bind refused by host"
                );
                notify_connect(&proxy, false);
                return;
            }
            proxy
                .lock_or_panic()
                .initialize_binding(service_id, &methods);
            inner
                .lock_or_panic()
                .service_bindings
                .insert(service_id, Arc::downgrade(&proxy));
            notify_connect(&proxy, true);
        }
        FrameMsg::InvokeMethodReply {
            success,
            has_more,
            reply,
        } => {
            let deferred = proxy.lock_or_panic().take_pending(request_id);
            let Some(mut deferred) = deferred else {
                debug!(request_id, "reply without a pending slot");
                return;
            };
            let payload = if success {
                let descriptor = proxy.lock_or_panic().descriptor();
                method_name.and_then(|name| descriptor.decode_reply(name, &reply))
            } else {
                None
            };
            // Resolve with no locks held; the callback may re-enter the
            // client.
            deferred.resolve(crate::AsyncResult::from_parts(payload, has_more));
            if has_more && deferred.is_bound() {
                proxy.lock_or_panic().insert_pending(request_id, deferred);
            }
        }
        FrameMsg::BindService { .. } | FrameMsg::InvokeMethod { .. } => {}
    }
}

fn on_connection_closed(inner: &Arc<Mutex<ClientInner>>) {
    let (requests, bindings) = {
        let mut guard = inner.lock_or_panic();
        guard.connected = false;
        guard.tx = None;
        (
            std::mem::take(&mut guard.queued_requests),
            std::mem::take(&mut guard.service_bindings),
        )
    };

    for (request_id, request) in requests {
        let Some(proxy) = request.proxy.upgrade() else {
            continue;
        };
        match request.kind {
            MsgKind::BindService => notify_connect(&proxy, false),
            MsgKind::InvokeMethod => {
                if let Some(mut deferred) = proxy.lock_or_panic().take_pending(request_id) {
                    deferred.reject();
                }
            }
            _ => {}
        }
    }

    for (_, weak) in bindings {
        let Some(proxy) = weak.upgrade() else {
            continue;
        };
        for mut deferred in proxy.lock_or_panic().take_all_pending() {
            deferred.reject();
        }
        notify_disconnect(&proxy);
    }
}
