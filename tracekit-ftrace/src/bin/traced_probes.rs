// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The kernel-event producer daemon.

use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::info;

use tracekit_ftrace::{FtraceProcfs, ProbesProducer};
use tracekit_service::ports::ProducerIpcClient;

#[derive(Parser)]
#[command(name = "traced-probes", about = "Kernel event producer for the tracing service")]
struct Args {
    /// Reset kernel ftrace state left behind by a crashed instance, then
    /// exit.
    #[arg(long)]
    cleanup_after_crash: bool,
}

fn main() -> anyhow::Result<()> {
    tracekit_common::logging::init();
    let args = Args::parse();

    let procfs = Arc::new(FtraceProcfs::default_root());
    if args.cleanup_after_crash {
        procfs.hard_reset();
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let socket = tracekit_common::config::producer_socket_path();
        info!(socket = %socket.display(), "starting traced-probes");
        let endpoint = ProducerIpcClient::connect_with_retries(&socket).await;
        let producer = Arc::new(Mutex::new(ProbesProducer::new(endpoint.clone(), procfs)));
        endpoint.attach(producer, "traced-probes");
        // Everything from here on is event driven.
        std::future::pending::<()>().await;
        Ok(())
    })
}
