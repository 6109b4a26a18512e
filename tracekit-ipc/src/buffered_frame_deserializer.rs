// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Tokenizes a byte stream into whole protocol frames.
//!
//! Stream sockets make no promises about chunking: one `read` can deliver a
//! fraction of a frame or a dozen frames back to back. This buffer absorbs
//! whatever the socket produces and hands back complete payloads, each in
//! one contiguous span so decoding never has to scatter-gather.
//!
//! Usage, on both the client and host side of a connection:
//!
//! ```ignore
//! let buf = deserializer.begin_receive();
//! let n = socket.read(buf).await?;
//! deserializer.end_receive(n)?;
//! while let Some(payload) = deserializer.pop_next_frame() {
//!     // decode and dispatch
//! }
//! ```
//!
//! The backing buffer has a fixed capacity, allocated once; a peer that
//! declares a frame larger than the buffer can hold is assumed malicious or
//! broken, and the only remedy is closing the connection.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::wire::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::Error;

/// Minimum writable region handed out by `begin_receive`.
pub const MIN_RECV_BYTES: usize = 1024;

pub struct BufferedFrameDeserializer {
    buf: Box<[u8]>,
    /// Start of the unparsed region within `buf`.
    read_off: usize,
    /// End of the received region within `buf`.
    write_off: usize,
    decoded_frames: VecDeque<Bytes>,
    poisoned: bool,
}

impl Default for BufferedFrameDeserializer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl BufferedFrameDeserializer {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > HEADER_SIZE);
        BufferedFrameDeserializer {
            buf: vec![0; capacity].into_boxed_slice(),
            read_off: 0,
            write_off: 0,
            decoded_frames: VecDeque::new(),
            poisoned: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received but not yet consumed by frame decoding.
    pub fn unparsed_len(&self) -> usize {
        self.write_off - self.read_off
    }

    /// Returns the writable tail of the buffer for the next transport read.
    ///
    /// Compacts first if the tail has grown too small, so the region is
    /// always at least [`MIN_RECV_BYTES`] unless a partially-received frame
    /// already occupies most of the buffer.
    pub fn begin_receive(&mut self) -> &mut [u8] {
        if self.buf.len() - self.write_off < MIN_RECV_BYTES {
            self.compact();
        }
        &mut self.buf[self.write_off..]
    }

    /// Records that `n` bytes were written into the `begin_receive` region
    /// and decodes any frames that are now complete.
    ///
    /// Fails iff a frame header declares a payload that can never fit in
    /// the buffer; the caller must then shut the connection down. The
    /// failure is sticky.
    pub fn end_receive(&mut self, n: usize) -> Result<(), Error> {
        assert!(n <= self.buf.len() - self.write_off);
        if self.poisoned {
            return Err(Error::OversizeFrame {
                declared: 0,
                max: self.buf.len() - HEADER_SIZE,
            });
        }
        self.write_off += n;

        loop {
            let unparsed = &self.buf[self.read_off..self.write_off];
            if unparsed.len() < HEADER_SIZE {
                break;
            }
            #[allow(clippy::unwrap_used)] // slice length checked above
            let payload_size =
                u32::from_le_bytes(unparsed[..HEADER_SIZE].try_into().unwrap()) as usize;
            let max = self.buf.len() - HEADER_SIZE;
            if payload_size > max {
                self.poisoned = true;
                return Err(Error::OversizeFrame {
                    declared: payload_size,
                    max,
                });
            }
            if unparsed.len() < HEADER_SIZE + payload_size {
                break;
            }
            self.decoded_frames.push_back(Bytes::copy_from_slice(
                &unparsed[HEADER_SIZE..HEADER_SIZE + payload_size],
            ));
            self.read_off += HEADER_SIZE + payload_size;
        }

        if self.read_off == self.write_off {
            // Everything consumed, rewind for free.
            self.read_off = 0;
            self.write_off = 0;
        } else if self.read_off > self.buf.len() / 2 {
            self.compact();
        }
        Ok(())
    }

    /// Removes and returns the next fully-received frame payload, if any.
    pub fn pop_next_frame(&mut self) -> Option<Bytes> {
        self.decoded_frames.pop_front()
    }

    fn compact(&mut self) {
        if self.read_off == 0 {
            return;
        }
        self.buf.copy_within(self.read_off..self.write_off, 0);
        self.write_off -= self.read_off;
        self.read_off = 0;
    }
}
