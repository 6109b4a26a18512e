// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Wires the queues and worker threads of the profiler together.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use tracekit_common::bounded_queue::{self, Sender};

use crate::bookkeeping::BookkeepingActor;
use crate::records::{BookkeepingKind, BookkeepingRecord, UnwindingRecord};
use crate::unwinder::unwind_main_loop;

/// If the bookkeeping thread dies, the aggregate is no longer
/// trustworthy; take the process down rather than keep serving stale
/// numbers. Unwinder panics, in contrast, only lose that shard.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            std::process::abort();
        }
    }
}

pub struct Pipeline {
    shards: Vec<Sender<UnwindingRecord>>,
    bookkeeping_tx: Sender<BookkeepingRecord>,
    dump_pending: Arc<AtomicBool>,
    unwinder_handles: Vec<JoinHandle<()>>,
    bookkeeping_handle: JoinHandle<()>,
}

impl Pipeline {
    /// Spawns `num_unwinders` unwinder threads plus the bookkeeping
    /// thread, all connected by bounded queues.
    pub fn start(
        num_unwinders: usize,
        unwinder_queue_size: usize,
        bookkeeping_queue_size: usize,
        dump_path: &Path,
    ) -> std::io::Result<Pipeline> {
        let dump_pending = Arc::new(AtomicBool::new(false));
        let (bookkeeping_tx, mut bookkeeping_rx) = bounded_queue::channel(bookkeeping_queue_size);

        let mut shards = Vec::with_capacity(num_unwinders);
        let mut unwinder_handles = Vec::with_capacity(num_unwinders);
        for i in 0..num_unwinders {
            let (tx, mut rx) = bounded_queue::channel(unwinder_queue_size);
            shards.push(tx);
            let bookkeeping_tx = bookkeeping_tx.clone();
            unwinder_handles.push(
                std::thread::Builder::new()
                    .name(format!("unwinder-{i}"))
                    .spawn(move || unwind_main_loop(&mut rx, &bookkeeping_tx))?,
            );
        }

        let mut actor = BookkeepingActor::new(dump_path, dump_pending.clone());
        let bookkeeping_handle = std::thread::Builder::new()
            .name("bookkeeping".to_string())
            .spawn(move || {
                let _abort_guard = AbortOnPanic;
                actor.run(&mut bookkeeping_rx);
            })?;

        info!(num_unwinders, "profiler pipeline started");
        Ok(Pipeline {
            shards,
            bookkeeping_tx,
            dump_pending,
            unwinder_handles,
            bookkeeping_handle,
        })
    }

    pub fn shards(&self) -> Vec<Sender<UnwindingRecord>> {
        self.shards.clone()
    }

    /// Enqueues one dump request; concurrent requests coalesce into the
    /// pending one.
    pub async fn request_dump(&self, pid: i32) {
        if self.dump_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self
            .bookkeeping_tx
            .send(BookkeepingRecord {
                pid,
                kind: BookkeepingKind::Dump,
            })
            .await
            .is_err()
        {
            self.dump_pending.store(false, Ordering::Release);
        }
    }

    /// Orderly teardown: close the shard queues, join the unwinders so
    /// everything in flight reaches bookkeeping, then close its queue and
    /// join it. A bookkeeping panic propagates.
    pub fn shutdown(self) {
        let Pipeline {
            shards,
            bookkeeping_tx,
            unwinder_handles,
            bookkeeping_handle,
            ..
        } = self;
        drop(shards);
        for handle in unwinder_handles {
            if handle.join().is_err() {
                // The shard died with its thread; its records are lost but
                // the aggregate is still sound.
                tracing::error!("an unwinder thread panicked");
            }
        }
        drop(bookkeeping_tx);
        if let Err(panic) = bookkeeping_handle.join() {
            std::panic::resume_unwind(panic);
        }
        info!("profiler pipeline stopped");
    }
}
