// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven defaults shared by the daemons.

use std::path::PathBuf;

const ENV_PRODUCER_SOCK: &str = "TRACEKIT_PRODUCER_SOCK";
const ENV_CONSUMER_SOCK: &str = "TRACEKIT_CONSUMER_SOCK";

const DEFAULT_PRODUCER_SOCK: &str = "/tmp/tracekit-producer.sock";
const DEFAULT_CONSUMER_SOCK: &str = "/tmp/tracekit-consumer.sock";

/// Socket on which the service accepts producer connections.
pub fn producer_socket_path() -> PathBuf {
    path_from_env(ENV_PRODUCER_SOCK, DEFAULT_PRODUCER_SOCK)
}

/// Socket on which the service accepts consumer connections.
pub fn consumer_socket_path() -> PathBuf {
    path_from_env(ENV_CONSUMER_SOCK, DEFAULT_CONSUMER_SOCK)
}

fn path_from_env(var: &str, default: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => PathBuf::from(default),
    }
}
