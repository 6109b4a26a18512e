// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Full pipeline coverage: a fake profiled process sends framed records
//! through the listener, they fan out to the unwinders, and the dump file
//! carries the aggregated callsite totals.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::runtime;

use tracekit_heapprofd::{socket_listener, ExpectedPids, Pipeline, WireRecord};

/// Frames one record the way an allocator hook does.
fn encode_record(record: &WireRecord) -> Vec<u8> {
    let payload = bincode::serialize(record).unwrap();
    let mut out = (payload.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(&payload);
    out
}

/// A two-frame stack snapshot whose walk yields `[0xaaaa, 0xbbbb]`.
fn fake_malloc(ptr: u64, size: u64) -> WireRecord {
    const STACK_START: u64 = 0x7fff_0000;
    let mut stack = vec![0u8; 128];
    stack[16..24].copy_from_slice(&(STACK_START + 64).to_le_bytes());
    stack[24..32].copy_from_slice(&0xaaaau64.to_le_bytes());
    stack[64..72].copy_from_slice(&0u64.to_le_bytes());
    stack[72..80].copy_from_slice(&0xbbbbu64.to_le_bytes());
    WireRecord::Malloc {
        ptr,
        size,
        stack,
        stack_base: STACK_START + 128,
        frame_pointer: STACK_START + 16,
    }
}

#[test]
fn records_flow_to_the_dump_file() {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("heap_dump");

    let pipeline = Pipeline::start(2, 16, 16, &dump_path).unwrap();

    rt.block_on(async {
        let expected = Arc::new(ExpectedPids::default());
        let (client, server) = UnixStream::pair().unwrap();
        let listener_task = tokio::spawn(socket_listener::handle_client(
            server,
            pipeline.shards(),
            expected,
        ));

        let mut client = client;
        client
            .write_all(&encode_record(&fake_malloc(0x1000, 64)))
            .await
            .unwrap();
        client
            .write_all(&encode_record(&fake_malloc(0x2000, 32)))
            .await
            .unwrap();
        client
            .write_all(&encode_record(&WireRecord::Free { ptr: 0x2000 }))
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        listener_task.await.unwrap();

        // The dump request races the records through separate queues, so
        // poll until the aggregate shows everything.
        for _ in 0..200 {
            pipeline.request_dump(0).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            let Ok(contents) = fs::read_to_string(&dump_path) else {
                continue;
            };
            let Ok(dump) = serde_json::from_str::<serde_json::Value>(&contents) else {
                continue;
            };
            let callsites = dump["callsites"].as_array().unwrap();
            if callsites.len() == 1
                && callsites[0]["allocated"].as_u64() == Some(96)
                && callsites[0]["freed"].as_u64() == Some(32)
            {
                // Walked frames come out innermost first and are stored
                // root-down.
                assert_eq!(
                    vec![0xbbbb, 0xaaaa],
                    callsites[0]["frames"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|v| v.as_u64().unwrap())
                        .collect::<Vec<_>>()
                );
                return;
            }
        }
        panic!(
            "aggregate never converged: {:?}",
            fs::read_to_string(&dump_path).ok()
        );
    });

    pipeline.shutdown();
}

#[test]
fn unexpected_pids_are_rejected_when_a_session_scopes_profiling() {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::start(1, 4, 4, &dir.path().join("d")).unwrap();

    rt.block_on(async {
        let expected = Arc::new(ExpectedPids::default());
        // Some other process is expected, not us.
        expected.expect(1, Default::default());

        let (client, server) = UnixStream::pair().unwrap();
        let listener_task = tokio::spawn(socket_listener::handle_client(
            server,
            pipeline.shards(),
            expected,
        ));
        // The daemon drops us without reading anything.
        listener_task.await.unwrap();
        let mut client = client;
        let record = encode_record(&WireRecord::Free { ptr: 1 });
        // Writing eventually fails once the peer is gone.
        let mut rejected = false;
        for _ in 0..100 {
            if client.write_all(&record).await.is_err() {
                rejected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(rejected);
    });

    pipeline.shutdown();
}
