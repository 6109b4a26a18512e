// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The tracing service daemon: hosts the producer and consumer ports.

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::info;

use tracekit_service::ports::{ConsumerPortService, ProducerPortService};
use tracekit_service::{HeapSharedMemoryFactory, TracingService};

fn main() -> anyhow::Result<()> {
    tracekit_common::logging::init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let producer_path = tracekit_common::config::producer_socket_path();
    let consumer_path = tracekit_common::config::consumer_socket_path();
    // Sockets may linger from a previous run.
    let _ = std::fs::remove_file(&producer_path);
    let _ = std::fs::remove_file(&consumer_path);
    let producer_listener = UnixListener::bind(&producer_path)
        .with_context(|| format!("failed to listen on {}", producer_path.display()))?;
    let consumer_listener = UnixListener::bind(&consumer_path)
        .with_context(|| format!("failed to listen on {}", consumer_path.display()))?;

    let service = TracingService::new(Box::new(HeapSharedMemoryFactory));

    let producer_host = tracekit_ipc::Host::new();
    producer_host.expose_service(Box::new(ProducerPortService::new(service.clone())));
    let consumer_host = tracekit_ipc::Host::new();
    consumer_host.expose_service(Box::new(ConsumerPortService::new(service)));

    info!(
        producers = %producer_path.display(),
        consumers = %consumer_path.display(),
        "traced started"
    );
    tokio::join!(
        producer_host.serve(producer_listener),
        consumer_host.serve(consumer_listener)
    );
    Ok(())
}
