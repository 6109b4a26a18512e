// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Accepts allocation records from profiled processes.
//!
//! Each client connection is one profiled process; records are framed with
//! the same 32-bit length prefix the IPC layer uses, so the buffered frame
//! deserializer does the tokenizing here too. Records are routed to the
//! unwinder shard `pid % N` with an awaiting (backpressuring) send: a
//! saturated shard stalls this connection and, through the socket buffer,
//! the profiled process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use tracekit_common::bounded_queue::Sender;
use tracekit_common::MutexExt;
use tracekit_ipc::BufferedFrameDeserializer;

use crate::records::{UnwindingRecord, WireRecord};

/// Sampling configuration pushed to a profiled process when it connects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientConfiguration {
    pub sampling_interval_bytes: u64,
}

/// The processes a tracing session asked to profile.
///
/// When no session restricts the set (standalone operation), every
/// connecting process is accepted.
#[derive(Default)]
pub struct ExpectedPids {
    inner: Mutex<HashMap<i32, ClientConfiguration>>,
}

impl ExpectedPids {
    pub fn expect(&self, pid: i32, config: ClientConfiguration) {
        self.inner.lock_or_panic().insert(pid, config);
    }

    pub fn remove(&self, pid: i32) {
        self.inner.lock_or_panic().remove(&pid);
    }

    /// `None` means the peer is not allowed to connect.
    fn config_for(&self, pid: i32) -> Option<ClientConfiguration> {
        let inner = self.inner.lock_or_panic();
        if inner.is_empty() {
            return Some(ClientConfiguration::default());
        }
        inner.get(&pid).copied()
    }
}

/// Accept loop; runs until the listener errors out.
pub async fn listen(
    listener: UnixListener,
    shards: Vec<Sender<UnwindingRecord>>,
    expected: Arc<ExpectedPids>,
) {
    info!(shards = shards.len(), "heapprofd listening");
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let shards = shards.clone();
                let expected = expected.clone();
                tokio::spawn(async move { handle_client(stream, shards, expected).await });
            }
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        }
    }
}

/// Drains one profiled process's connection.
pub async fn handle_client(
    stream: UnixStream,
    shards: Vec<Sender<UnwindingRecord>>,
    expected: Arc<ExpectedPids>,
) {
    let pid = match stream.peer_cred().ok().and_then(|cred| cred.pid()) {
        Some(pid) => pid,
        None => {
            warn!("client with no peer pid, dropping");
            return;
        }
    };
    if expected.config_for(pid).is_none() {
        warn!(pid, "unexpected process connected, dropping");
        return;
    }
    debug!(pid, "profiled process connected");

    let shard = &shards[pid as usize % shards.len()];
    let mut stream = stream;
    let mut deserializer = BufferedFrameDeserializer::default();
    loop {
        let n = {
            let buf = deserializer.begin_receive();
            match stream.read(buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            }
        };
        if let Err(e) = deserializer.end_receive(n) {
            warn!(pid, "dropping connection: {e}");
            break;
        }
        while let Some(payload) = deserializer.pop_next_frame() {
            let record: WireRecord = match bincode::deserialize(&payload) {
                Ok(record) => record,
                Err(e) => {
                    debug!(pid, "dropping malformed record: {e}");
                    continue;
                }
            };
            if shard.send(UnwindingRecord { pid, record }).await.is_err() {
                debug!(pid, "unwinder shard is gone, closing connection");
                return;
            }
        }
    }
    debug!(pid, "profiled process disconnected");
}
