// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Records flowing through the profiler pipeline.

use serde::{Deserialize, Serialize};

/// One message from an allocator hook, bincode-encoded behind the same
/// 32-bit length prefix the IPC layer uses.
///
/// For mallocs the client ships a raw snapshot of its stack, from the
/// stack pointer at the hook up to the stack base, together with the frame
/// pointer; the unwinder reconstructs return addresses from that snapshot
/// without ever touching the remote process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRecord {
    Malloc {
        ptr: u64,
        size: u64,
        /// Memory `[stack_base - stack.len(), stack_base)`, lowest address
        /// first.
        stack: Vec<u8>,
        stack_base: u64,
        frame_pointer: u64,
    },
    Free {
        ptr: u64,
    },
}

/// A wire record tagged with the peer pid from `SO_PEERCRED`; what the
/// listener routes to the unwinder shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindingRecord {
    pub pid: i32,
    pub record: WireRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookkeepingKind {
    Malloc {
        ptr: u64,
        size: u64,
        /// Return addresses, innermost frame first.
        frames: Vec<u64>,
    },
    Free {
        ptr: u64,
    },
    /// Serialize the current aggregate to the dump file.
    Dump,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookkeepingRecord {
    pub pid: i32,
    pub kind: BookkeepingKind,
}
