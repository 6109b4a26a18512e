// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The bookkeeping actor: the single owner of the global callsite trie.
//!
//! Keeping aggregation on one thread removes every lock from the hot path;
//! all mutation arrives through the bounded queue. The trie interns call
//! stacks so distinct allocations from the same callsite share one node
//! chain; per-node totals accumulate allocated and freed bytes, and a
//! per-process live map ties outstanding pointers back to the node that
//! allocated them so frees are charged to the right path.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use tracekit_common::bounded_queue::Receiver;

use crate::records::{BookkeepingKind, BookkeepingRecord};

const ROOT: usize = 0;

struct Node {
    parent: usize,
    /// Return address of this frame.
    frame: u64,
    allocated: u64,
    freed: u64,
    allocation_count: u64,
    free_count: u64,
}

/// Interned tree of call stacks, rooted at a synthetic node 0.
pub struct CallsiteTrie {
    nodes: Vec<Node>,
    children: HashMap<(usize, u64), usize>,
}

impl Default for CallsiteTrie {
    fn default() -> Self {
        CallsiteTrie {
            nodes: vec![Node {
                parent: ROOT,
                frame: 0,
                allocated: 0,
                freed: 0,
                allocation_count: 0,
                free_count: 0,
            }],
            children: HashMap::new(),
        }
    }
}

impl CallsiteTrie {
    pub fn new() -> CallsiteTrie {
        Default::default()
    }

    /// Interns `frames` (innermost first) and returns the leaf node id.
    pub fn intern(&mut self, frames: &[u64]) -> usize {
        let mut node = ROOT;
        // Insert outermost-first so shared prefixes share nodes.
        for &frame in frames.iter().rev() {
            node = match self.children.get(&(node, frame)) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node {
                        parent: node,
                        frame,
                        allocated: 0,
                        freed: 0,
                        allocation_count: 0,
                        free_count: 0,
                    });
                    self.children.insert((node, frame), child);
                    child
                }
            };
        }
        node
    }

    fn record_malloc(&mut self, node: usize, size: u64) {
        let node = &mut self.nodes[node];
        node.allocated += size;
        node.allocation_count += 1;
    }

    fn record_free(&mut self, node: usize, size: u64) {
        let node = &mut self.nodes[node];
        node.freed += size;
        node.free_count += 1;
    }

    /// Frames from the outermost caller down to the leaf.
    fn path(&self, mut node: usize) -> Vec<u64> {
        let mut frames = Vec::new();
        while node != ROOT {
            frames.push(self.nodes[node].frame);
            node = self.nodes[node].parent;
        }
        frames.reverse();
        frames
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Debug, Serialize)]
struct CallsiteDump {
    /// Outermost caller first.
    frames: Vec<u64>,
    allocated: u64,
    freed: u64,
    allocation_count: u64,
    free_count: u64,
}

#[derive(Debug, Serialize)]
struct HeapDump {
    callsites: Vec<CallsiteDump>,
}

pub struct BookkeepingActor {
    trie: CallsiteTrie,
    /// `(pid, ptr)` of live allocations to the node and size charged.
    live: HashMap<(i32, u64), (usize, u64)>,
    dump_path: PathBuf,
    dump_pending: Arc<AtomicBool>,
}

impl BookkeepingActor {
    pub fn new(dump_path: impl Into<PathBuf>, dump_pending: Arc<AtomicBool>) -> BookkeepingActor {
        BookkeepingActor {
            trie: CallsiteTrie::new(),
            live: HashMap::new(),
            dump_path: dump_path.into(),
            dump_pending,
        }
    }

    /// Actor loop; returns when the queue shuts down.
    pub fn run(&mut self, queue: &mut Receiver<BookkeepingRecord>) {
        while let Some(record) = queue.recv_blocking() {
            self.handle_record(record);
        }
    }

    pub fn handle_record(&mut self, record: BookkeepingRecord) {
        match record.kind {
            BookkeepingKind::Malloc { ptr, size, frames } => {
                let node = self.trie.intern(&frames);
                self.trie.record_malloc(node, size);
                // A stale entry means we missed the free; charge it now.
                if let Some((old_node, old_size)) =
                    self.live.insert((record.pid, ptr), (node, size))
                {
                    self.trie.record_free(old_node, old_size);
                }
            }
            BookkeepingKind::Free { ptr } => match self.live.remove(&(record.pid, ptr)) {
                Some((node, size)) => self.trie.record_free(node, size),
                None => debug!(pid = record.pid, ptr, "free for unknown allocation"),
            },
            BookkeepingKind::Dump => {
                if let Err(e) = self.write_dump() {
                    error!("heap dump failed: {e}");
                }
                self.dump_pending.store(false, Ordering::Release);
            }
        }
    }

    fn write_dump(&self) -> io::Result<()> {
        let mut dump = HeapDump {
            callsites: Vec::new(),
        };
        for (id, node) in self.trie.nodes.iter().enumerate().skip(1) {
            if node.allocation_count == 0 {
                continue;
            }
            dump.callsites.push(CallsiteDump {
                frames: self.trie.path(id),
                allocated: node.allocated,
                freed: node.freed,
                allocation_count: node.allocation_count,
                free_count: node.free_count,
            });
        }
        let file = File::create(&self.dump_path)?;
        serde_json::to_writer_pretty(file, &dump)?;
        info!(
            path = %self.dump_path.display(),
            callsites = dump.callsites.len(),
            "wrote heap dump"
        );
        Ok(())
    }
}
