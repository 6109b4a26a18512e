// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory buffers between the service and one producer.
//!
//! The region is single-writer (producer), single-reader (service); the
//! commit protocol riding on top lives with the transport. Both sides of
//! the abstraction are traits so the transport can attach its platform
//! resources (an fd-backed mapping); the in-tree implementation is a plain
//! heap buffer used by tests and same-process setups.

use std::sync::{Arc, Mutex};

use tracekit_common::MutexExt;

pub trait SharedMemory: Send {
    fn size(&self) -> usize;
}

pub trait SharedMemoryFactory: Send {
    fn create(&mut self, size: usize) -> Box<dyn SharedMemory>;
}

pub struct HeapSharedMemory {
    buf: Arc<Mutex<Box<[u8]>>>,
}

impl HeapSharedMemory {
    pub fn new(size: usize) -> Self {
        HeapSharedMemory {
            buf: Arc::new(Mutex::new(vec![0; size].into_boxed_slice())),
        }
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut buf = self.buf.lock_or_panic();
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        let buf = self.buf.lock_or_panic();
        out.copy_from_slice(&buf[offset..offset + out.len()]);
    }
}

impl SharedMemory for HeapSharedMemory {
    fn size(&self) -> usize {
        self.buf.lock_or_panic().len()
    }
}

#[derive(Default)]
pub struct HeapSharedMemoryFactory;

impl SharedMemoryFactory for HeapSharedMemoryFactory {
    fn create(&mut self, size: usize) -> Box<dyn SharedMemory> {
        Box::new(HeapSharedMemory::new(size))
    }
}
