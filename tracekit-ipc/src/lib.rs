// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The IPC layer connecting producers and consumers to the tracing service.
//!
//! The wire protocol is a stream of length-prefixed frames
//! ([`wire::Frame`]), tokenized by [`BufferedFrameDeserializer`]. On top of
//! the frames sits a bidirectional method-invocation layer: [`Client`] binds
//! [`ServiceProxy`] stubs to remote services and dispatches replies,
//! [`Host`] exposes [`IpcService`] implementations and routes invocations to
//! them. Replies travel through [`Deferred`] slots, which guarantee exactly
//! one terminal response per request across every resolve/reject/drop path.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod buffered_frame_deserializer;
pub mod client;
pub mod deferred;
pub mod host;
pub mod service;
pub mod wire;

mod error;

pub use buffered_frame_deserializer::BufferedFrameDeserializer;
pub use client::Client;
pub use deferred::{AsyncResult, Deferred};
pub use error::Error;
pub use host::{ClientInfo, Host, IpcService};
pub use service::{MethodDescriptor, ProxyEventListener, ServiceDescriptor, ServiceProxy};

/// Identifies a service exposed by a host, assigned at expose time.
pub type ServiceId = u32;
/// Identifies a method within a service; ids are 1-based positions in the
/// service descriptor and never 0.
pub type MethodId = u32;
/// Identifies an outstanding request on one connection; never 0 for
/// requests, echoed verbatim by replies.
pub type RequestId = u64;
/// Identifies one accepted connection on a host.
pub type ClientId = u64;
