// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The heap profiler daemon.
//!
//! Listens for allocation records either on an explicit socket path or,
//! when launched by init, on the pre-opened fd passed through the
//! `ANDROID_SOCKET_heapprofd` environment variable. SIGUSR1 serializes
//! the current aggregate to the dump file.

use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use tracekit_heapprofd::{
    socket_listener, ExpectedPids, HeapprofdProducer, Pipeline, BOOKKEEPING_QUEUE_SIZE,
    DEFAULT_DUMP_OUTPUT, UNWINDER_QUEUE_SIZE, UNWINDER_THREADS,
};
use tracekit_service::ports::ProducerIpcClient;

const SOCKET_ENV: &str = "ANDROID_SOCKET_heapprofd";

#[derive(Parser)]
#[command(name = "heapprofd", about = "Heap allocation profiler daemon")]
struct Args {
    /// Socket to listen on. Without it, the environment variable
    /// ANDROID_SOCKET_heapprofd must carry a pre-opened listening fd.
    socket: Option<PathBuf>,

    /// Heap dump output path.
    #[arg(long, default_value = DEFAULT_DUMP_OUTPUT)]
    dump_output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracekit_common::logging::init();
    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;
    let pipeline = runtime.block_on(run(args))?;
    // Dropping the runtime cancels the connection tasks, releasing their
    // queue handles; only then can the worker threads be joined.
    drop(runtime);
    pipeline.shutdown();
    Ok(())
}

fn make_listener(socket: Option<&Path>) -> anyhow::Result<UnixListener> {
    let std_listener = match socket {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            StdUnixListener::bind(path)
                .with_context(|| format!("failed to listen on {}", path.display()))?
        }
        None => {
            // When running as a service launched by init, the socket is
            // created for us and passed through the environment.
            let raw = std::env::var(SOCKET_ENV)
                .with_context(|| format!("no socket argument and {SOCKET_ENV} is unset"))?;
            let fd: RawFd = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {SOCKET_ENV}, expected a decimal fd"))?;
            // SAFETY: init opened this fd for us and nothing else in the
            // process owns it.
            unsafe { StdUnixListener::from_raw_fd(fd) }
        }
    };
    std_listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(std_listener)?)
}

async fn run(args: Args) -> anyhow::Result<Pipeline> {
    let listener = make_listener(args.socket.as_deref())?;
    let pipeline = Pipeline::start(
        UNWINDER_THREADS,
        UNWINDER_QUEUE_SIZE,
        BOOKKEEPING_QUEUE_SIZE,
        &args.dump_output,
    )
    .context("failed to start the profiler pipeline")?;
    let expected = Arc::new(ExpectedPids::default());

    // Attach to the tracing service in the background so sessions can
    // scope profiling to specific processes; standalone operation works
    // without it.
    {
        let expected = expected.clone();
        tokio::spawn(async move {
            let socket = tracekit_common::config::producer_socket_path();
            let endpoint = ProducerIpcClient::connect_with_retries(&socket).await;
            let producer = Arc::new(Mutex::new(HeapprofdProducer::new(
                endpoint.clone(),
                expected,
            )));
            endpoint.attach(producer, "heapprofd");
        });
    }

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let listen = socket_listener::listen(listener, pipeline.shards(), expected.clone());
    tokio::pin!(listen);
    loop {
        tokio::select! {
            _ = &mut listen => break,
            _ = sigusr1.recv() => {
                info!("triggering dump");
                pipeline.request_dump(0).await;
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("shutting down");
    Ok(pipeline)
}
