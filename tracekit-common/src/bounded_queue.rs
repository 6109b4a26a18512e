// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity MPSC queues connecting the event-loop thread to worker
//! threads.
//!
//! The same queue is written from async tasks (the socket listener) and from
//! plain `std::thread` workers, so both edges are exposed: `send`/`recv` for
//! tasks, `send_blocking`/`recv_blocking` for threads. A full queue blocks
//! the sender, which is how backpressure propagates from a saturated worker
//! back to the producing process.
//!
//! Shutdown is modeled by closing the channel: `Receiver::close` (or dropping
//! the receiver) unblocks every pending sender with [`QueueClosed`], and
//! dropping all senders drains the receiver to `None`.

use tokio::sync::mpsc;

/// Error returned when sending on a queue whose receiver has shut down.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue receiver has shut down")
    }
}

impl std::error::Error for QueueClosed {}

pub struct Sender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Sender<T> {
    /// Async edge. Suspends the task while the queue is at capacity.
    pub async fn send(&self, value: T) -> Result<(), QueueClosed> {
        self.tx.send(value).await.map_err(|_| QueueClosed)
    }

    /// Blocking edge for worker threads. Parks the thread while the queue is
    /// at capacity. Must not be called from the event-loop thread.
    pub fn send_blocking(&self, value: T) -> Result<(), QueueClosed> {
        self.tx.blocking_send(value).map_err(|_| QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Receiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Async edge. Resolves to `None` once every sender is gone and the
    /// queue has drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Blocking edge for worker threads. Returns `None` on shutdown after
    /// the queue has drained.
    pub fn recv_blocking(&mut self) -> Option<T> {
        self.rx.blocking_recv()
    }

    /// Initiates shutdown: pending and future sends fail, already-queued
    /// records can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Creates a queue with the given fixed capacity.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "bounded queue capacity must be non-zero");
    let (tx, rx) = mpsc::channel(capacity);
    (Sender { tx }, Receiver { rx })
}
