// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Service descriptors and the client-side service stub.
//!
//! A [`ServiceDescriptor`] is the static shape of a service: its name and
//! its ordered method list. The same descriptor constant is shared by the
//! host (which enumerates it in `BindServiceReply` and dispatches on method
//! position) and by clients (which use the per-method reply decoders).
//! Method ids are 1-based positions in the descriptor on the host side; the
//! ids actually used on the wire are whatever the host handed back at bind
//! time, so the two sides never have to agree on ordering out of band.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::deferred::{AsyncResult, Deferred};
use crate::wire::MethodInfo;
use crate::{Error, MethodId, RequestId, ServiceId};

/// A decoded reply message, type-erased so the invocation layer can carry
/// replies of any service without being generic over them.
pub type ReplyPayload = Box<dyn Any + Send>;

/// Decodes a reply payload for one method; `None` on malformed bytes.
pub type ReplyDecoder = fn(&[u8]) -> Option<ReplyPayload>;

pub struct MethodDescriptor {
    pub name: &'static str,
    pub decode_reply: ReplyDecoder,
}

pub struct ServiceDescriptor {
    pub service_name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

impl ServiceDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub(crate) fn decode_reply(&self, method_name: &str, bytes: &[u8]) -> Option<ReplyPayload> {
        let method = self.method(method_name)?;
        let decoded = (method.decode_reply)(bytes);
        if decoded.is_none() {
            debug!(method = method_name, "failed to decode method reply");
        }
        decoded
    }
}

/// Generic [`ReplyDecoder`] for any bincode-encoded reply type; instantiate
/// as `decode_as::<MyReply>` in a method descriptor.
pub fn decode_as<T: DeserializeOwned + Send + 'static>(bytes: &[u8]) -> Option<ReplyPayload> {
    bincode::deserialize::<T>(bytes)
        .ok()
        .map(|msg| Box::new(msg) as ReplyPayload)
}

/// Encodes a method argument or reply message for the wire.
pub fn encode_msg<T: Serialize>(msg: &T) -> Result<Vec<u8>, Error> {
    bincode::serialize(msg).map_err(Error::Serialize)
}

/// Adapts a typed reply callback to the type-erased [`Deferred`] the
/// invocation layer hands replies through. Replies that fail to downcast
/// (which would mean a decoder mismatch in the descriptor) surface as
/// failures.
pub fn reply_deferred<T, F>(mut callback: F) -> Deferred<ReplyPayload>
where
    T: 'static,
    F: FnMut(AsyncResult<T>) + Send + 'static,
{
    Deferred::bound(move |result: AsyncResult<ReplyPayload>| {
        let has_more = result.has_more();
        let msg = result
            .into_msg()
            .and_then(|payload| payload.downcast::<T>().ok())
            .map(|boxed| *boxed);
        callback(AsyncResult::from_parts(msg, has_more));
    })
}

/// Receives connection lifecycle events for one bound [`ServiceProxy`].
///
/// Callbacks run on the connection's reader task with no proxy or client
/// locks held, so they are free to issue new invocations.
pub trait ProxyEventListener: Send {
    fn on_connect(&mut self, success: bool);
    fn on_disconnect(&mut self);
}

/// Client-side handle to a remote service.
///
/// Holds the negotiated service id and the method-name to remote-method-id
/// map built from the host's `BindServiceReply`, plus the reply slots of
/// requests still in flight. The owning [`Client`](crate::Client) keeps only
/// a weak reference back to the proxy, so dropping the proxy cancels its
/// outstanding requests instead of leaking them.
pub struct ServiceProxy {
    descriptor: &'static ServiceDescriptor,
    listener: Option<Box<dyn ProxyEventListener>>,
    service_id: ServiceId,
    remote_method_ids: HashMap<&'static str, MethodId>,
    pending_replies: HashMap<RequestId, Deferred<ReplyPayload>>,
    connected: bool,
}

impl ServiceProxy {
    pub fn new(
        descriptor: &'static ServiceDescriptor,
        listener: Box<dyn ProxyEventListener>,
    ) -> Self {
        ServiceProxy {
            descriptor,
            listener: Some(listener),
            service_id: 0,
            remote_method_ids: HashMap::new(),
            pending_replies: HashMap::new(),
            connected: false,
        }
    }

    pub fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn remote_method_id(&self, name: &str) -> Option<MethodId> {
        self.remote_method_ids.get(name).copied()
    }

    /// Builds the method binding from a `BindServiceReply`, dropping
    /// entries with an empty name or a zero id.
    pub(crate) fn initialize_binding(&mut self, service_id: ServiceId, methods: &[MethodInfo]) {
        self.service_id = service_id;
        self.remote_method_ids.clear();
        for info in methods {
            if info.name.is_empty() || info.id == 0 {
                warn!(
                    service = self.descriptor.service_name,
                    method = %info.name,
                    id = info.id,
                    "dropping invalid method in bind reply"
                );
                continue;
            }
            if let Some(method) = self.descriptor.method(&info.name) {
                self.remote_method_ids.insert(method.name, info.id);
            }
        }
        self.connected = true;
    }

    pub(crate) fn set_disconnected(&mut self) {
        self.connected = false;
    }

    pub(crate) fn insert_pending(&mut self, request_id: RequestId, reply: Deferred<ReplyPayload>) {
        self.pending_replies.insert(request_id, reply);
    }

    pub(crate) fn take_pending(
        &mut self,
        request_id: RequestId,
    ) -> Option<Deferred<ReplyPayload>> {
        self.pending_replies.remove(&request_id)
    }

    pub(crate) fn take_all_pending(&mut self) -> Vec<Deferred<ReplyPayload>> {
        self.pending_replies.drain().map(|(_, d)| d).collect()
    }

    pub(crate) fn take_listener(&mut self) -> Option<Box<dyn ProxyEventListener>> {
        self.listener.take()
    }

    pub(crate) fn put_listener(&mut self, listener: Box<dyn ProxyEventListener>) {
        self.listener = Some(listener);
    }
}
