// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by the IPC layer.
///
/// Only [`Error::OversizeFrame`] is fatal for a connection; everything else
/// fails the individual request and leaves the stream usable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("peer declared a {declared} byte frame, receive ceiling is {max} bytes")]
    OversizeFrame { declared: usize, max: usize },

    #[error("malformed frame payload: {0}")]
    MalformedPayload(bincode::Error),

    #[error("failed to serialize frame: {0}")]
    Serialize(bincode::Error),

    #[error("failed to queue frame for sending, connection is gone")]
    Send,

    #[error("connection closed")]
    ConnectionClosed,
}
