// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The broker's IPC surface.
//!
//! Two services, one per socket: `ProducerPort` (producers initialize their
//! connection, advertise data sources, and receive broker commands through
//! a streaming `GetAsyncCommand` reply channel) and `ConsumerPort`
//! (consumers enable/disable sessions and stream trace data back through
//! `ReadBuffers`). The `*_client` modules are the matching client-side
//! wrappers, which adapt the proxies back onto the in-process
//! [`Producer`](crate::Producer) / [`Consumer`](crate::Consumer) traits so
//! local and remote attachments look the same to daemon code.

pub mod consumer_client;
pub mod consumer_port;
pub mod messages;
pub mod producer_client;
pub mod producer_port;

pub use consumer_client::ConsumerIpcClient;
pub use consumer_port::ConsumerPortService;
pub use producer_client::ProducerIpcClient;
pub use producer_port::ProducerPortService;

use tracing::{debug, warn};

use tracekit_ipc::service::encode_msg;
use tracekit_ipc::{AsyncResult, Deferred};

/// Decodes method arguments; on failure the caller returns early, dropping
/// its reply sink, which is what produces the failure reply.
pub(crate) fn decode_args<T: serde::de::DeserializeOwned>(args: &[u8]) -> Option<T> {
    match bincode::deserialize(args) {
        Ok(args) => Some(args),
        Err(e) => {
            debug!("malformed method arguments: {e}");
            None
        }
    }
}

pub(crate) fn resolve_with<T: serde::Serialize>(reply: &mut Deferred<Vec<u8>>, msg: &T) {
    match encode_msg(msg) {
        Ok(bytes) => reply.resolve(AsyncResult::new(bytes)),
        Err(e) => {
            warn!("failed to encode reply: {e}");
            reply.reject();
        }
    }
}
