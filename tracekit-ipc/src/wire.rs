// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! On-wire frame encoding.
//!
//! Every protocol message is one frame: a `u32` little-endian payload size
//! followed by that many bytes of bincode-encoded [`Frame`]. The size prefix
//! excludes itself. Method arguments and replies are carried opaquely as
//! already-encoded byte vectors, so this layer never needs to know the
//! per-service message types.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, MethodId, RequestId, ServiceId};

/// Receive ceiling applied to incoming frames unless a deserializer is
/// constructed with an explicit capacity.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 128 * 1024;

/// Size of the wire-format length prefix.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub id: MethodId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameMsg {
    BindService {
        service_name: String,
    },
    BindServiceReply {
        success: bool,
        service_id: ServiceId,
        methods: Vec<MethodInfo>,
    },
    InvokeMethod {
        service_id: ServiceId,
        method_id: MethodId,
        args: Vec<u8>,
    },
    InvokeMethodReply {
        success: bool,
        has_more: bool,
        reply: Vec<u8>,
    },
}

/// Discriminant used to pair replies with the requests that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    BindService,
    BindServiceReply,
    InvokeMethod,
    InvokeMethodReply,
}

impl FrameMsg {
    pub fn kind(&self) -> MsgKind {
        match self {
            FrameMsg::BindService { .. } => MsgKind::BindService,
            FrameMsg::BindServiceReply { .. } => MsgKind::BindServiceReply,
            FrameMsg::InvokeMethod { .. } => MsgKind::InvokeMethod,
            FrameMsg::InvokeMethodReply { .. } => MsgKind::InvokeMethodReply,
        }
    }
}

impl MsgKind {
    /// The reply kind expected for a request of this kind.
    pub fn reply_kind(self) -> MsgKind {
        match self {
            MsgKind::BindService => MsgKind::BindServiceReply,
            MsgKind::InvokeMethod => MsgKind::InvokeMethodReply,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub request_id: RequestId,
    pub msg: FrameMsg,
}

impl Frame {
    /// Encodes the frame, size prefix included, ready for a stream write.
    ///
    /// Frames that would exceed [`DEFAULT_MAX_FRAME_SIZE`] are refused here
    /// rather than letting the peer tear the connection down on receipt.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let payload = bincode::serialize(self).map_err(Error::Serialize)?;
        if payload.len() > DEFAULT_MAX_FRAME_SIZE {
            return Err(Error::OversizeFrame {
                declared: payload.len(),
                max: DEFAULT_MAX_FRAME_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decodes one whole frame payload (the bytes after the size prefix).
    pub fn decode(payload: &[u8]) -> Result<Frame, Error> {
        bincode::deserialize(payload).map_err(Error::MalformedPayload)
    }
}
