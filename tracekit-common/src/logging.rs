// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::EnvFilter;

const ENV_LOG: &str = "TRACEKIT_LOG";

/// Installs the global subscriber for a daemon process.
///
/// The filter comes from `TRACEKIT_LOG` (standard `tracing` filter syntax),
/// falling back to `info`. Safe to call once per process; later calls are
/// ignored so tests can share a process.
pub fn init() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
