// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Unwinder worker threads.
//!
//! Mallocs carry a stack snapshot that gets walked here, off the hot
//! allocation path of the profiled process; frees carry nothing and are
//! forwarded as-is. One worker owns one inbound shard, so records of one
//! process never reorder.

use tracing::debug;

use tracekit_common::bounded_queue::{Receiver, Sender};

use crate::records::{BookkeepingKind, BookkeepingRecord, UnwindingRecord, WireRecord};

/// Stop walking after this many frames; runaway chains mean a corrupt
/// snapshot.
const MAX_FRAMES: usize = 128;

/// Worker loop: drains the shard until shutdown, feeding the bookkeeping
/// queue. Blocks on both ends, which is what propagates backpressure.
pub fn unwind_main_loop(
    inbound: &mut Receiver<UnwindingRecord>,
    bookkeeping: &Sender<BookkeepingRecord>,
) {
    while let Some(UnwindingRecord { pid, record }) = inbound.recv_blocking() {
        let kind = match record {
            WireRecord::Malloc {
                ptr,
                size,
                stack,
                stack_base,
                frame_pointer,
            } => BookkeepingKind::Malloc {
                ptr,
                size,
                frames: walk_stack(&stack, stack_base, frame_pointer),
            },
            WireRecord::Free { ptr } => BookkeepingKind::Free { ptr },
        };
        if bookkeeping
            .send_blocking(BookkeepingRecord { pid, kind })
            .is_err()
        {
            return;
        }
    }
}

/// Frame-pointer chain walk over a stack snapshot.
///
/// Each frame stores `[saved frame pointer][return address]` at the
/// address the frame pointer names. The walk stays within the snapshot,
/// demands a strictly growing frame pointer (stacks grow down, so walking
/// towards the base means increasing addresses; this also breaks cycles),
/// and bails after [`MAX_FRAMES`].
pub fn walk_stack(stack: &[u8], stack_base: u64, frame_pointer: u64) -> Vec<u64> {
    let mut frames = Vec::new();
    let Some(stack_start) = stack_base.checked_sub(stack.len() as u64) else {
        debug!("stack snapshot larger than its base address");
        return frames;
    };
    let mut fp = frame_pointer;
    while frames.len() < MAX_FRAMES {
        let in_range = fp >= stack_start
            && fp
                .checked_add(16)
                .map_or(false, |frame_end| frame_end <= stack_base);
        if !in_range {
            break;
        }
        let offset = (fp - stack_start) as usize;
        let word = |at: usize| -> u64 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&stack[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let saved_fp = word(offset);
        let return_addr = word(offset + 8);
        if return_addr == 0 {
            break;
        }
        frames.push(return_addr);
        if saved_fp <= fp {
            // Not walking towards the stack base: corrupt or cyclic chain.
            break;
        }
        fp = saved_fp;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracekit_common::bounded_queue;

    /// Builds a snapshot with frames at the given offsets from the start
    /// of the snapshot. Returns (stack, stack_base, frame_pointer).
    fn fake_stack(frame_offsets: &[usize], return_addrs: &[u64]) -> (Vec<u8>, u64, u64) {
        const STACK_START: u64 = 0x7fff_0000;
        let size = 256;
        let mut stack = vec![0u8; size];
        for (i, (&offset, &ret)) in frame_offsets.iter().zip(return_addrs).enumerate() {
            let next = frame_offsets
                .get(i + 1)
                .map(|&o| STACK_START + o as u64)
                .unwrap_or(0);
            stack[offset..offset + 8].copy_from_slice(&next.to_le_bytes());
            stack[offset + 8..offset + 16].copy_from_slice(&ret.to_le_bytes());
        }
        (
            stack,
            STACK_START + size as u64,
            STACK_START + frame_offsets[0] as u64,
        )
    }

    #[test]
    fn walks_a_frame_chain() {
        let (stack, base, fp) = fake_stack(&[16, 64, 128], &[0x1111, 0x2222, 0x3333]);
        assert_eq!(vec![0x1111, 0x2222, 0x3333], walk_stack(&stack, base, fp));
    }

    #[test]
    fn stops_at_a_cycle() {
        // Second frame points back at the first.
        const STACK_START: u64 = 0x7fff_0000;
        let mut stack = vec![0u8; 128];
        stack[0..8].copy_from_slice(&(STACK_START + 64).to_le_bytes());
        stack[8..16].copy_from_slice(&0x1111u64.to_le_bytes());
        stack[64..72].copy_from_slice(&STACK_START.to_le_bytes());
        stack[72..80].copy_from_slice(&0x2222u64.to_le_bytes());
        let frames = walk_stack(&stack, STACK_START + 128, STACK_START);
        assert_eq!(vec![0x1111, 0x2222], frames);
    }

    #[test]
    fn rejects_frame_pointers_outside_the_snapshot() {
        let stack = vec![0u8; 64];
        assert!(walk_stack(&stack, 0x1000_0040, 0x2000_0000).is_empty());
        assert!(walk_stack(&stack, 0x1000_0040, 0x1000_0039).is_empty());
    }

    #[test]
    fn mallocs_are_unwound_and_frees_forwarded() {
        let (mut inbound_rx, bookkeeping_tx, mut bookkeeping_rx) = {
            let (tx, rx) = bounded_queue::channel::<UnwindingRecord>(16);
            let (btx, brx) = bounded_queue::channel::<BookkeepingRecord>(16);
            let (stack, base, fp) = fake_stack(&[16, 64], &[0xaaaa, 0xbbbb]);
            tx.send_blocking(UnwindingRecord {
                pid: 42,
                record: WireRecord::Malloc {
                    ptr: 0xdead,
                    size: 128,
                    stack,
                    stack_base: base,
                    frame_pointer: fp,
                },
            })
            .unwrap();
            tx.send_blocking(UnwindingRecord {
                pid: 42,
                record: WireRecord::Free { ptr: 0xdead },
            })
            .unwrap();
            drop(tx);
            (rx, btx, brx)
        };

        unwind_main_loop(&mut inbound_rx, &bookkeeping_tx);
        drop(bookkeeping_tx);

        assert_eq!(
            Some(BookkeepingRecord {
                pid: 42,
                kind: BookkeepingKind::Malloc {
                    ptr: 0xdead,
                    size: 128,
                    frames: vec![0xaaaa, 0xbbbb],
                },
            }),
            bookkeeping_rx.recv_blocking()
        );
        assert_eq!(
            Some(BookkeepingRecord {
                pid: 42,
                kind: BookkeepingKind::Free { ptr: 0xdead },
            }),
            bookkeeping_rx.recv_blocking()
        );
        assert_eq!(None, bookkeeping_rx.recv_blocking());
    }
}
