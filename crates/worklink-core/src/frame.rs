//! Frame types for sending and receiving.

use bytes::Bytes;

use crate::{ErrorCode, FrameFlags, encode_error_payload};

/// Control method names (carried on `CONTROL` frames, channel 0).
pub mod control_method {
    /// Worker → controller: announce the worker uuid.
    /// Controller → worker: acknowledge (or reject with `ERROR`).
    pub const HANDSHAKE: &str = "handshake";
    /// Controller → worker: shut the session down in an orderly way.
    pub const TERMINATE: &str = "terminate";
}

/// Fixed-size frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgDesc {
    /// Per-connection, monotonically increasing message id (diagnostics only).
    pub msg_id: u64,
    /// Call identifier for requests and responses; 0 for events and control.
    pub channel_id: u64,
    pub flags: FrameFlags,
}

impl MsgDesc {
    pub fn new() -> Self {
        Self {
            msg_id: 0,
            channel_id: 0,
            flags: FrameFlags::empty(),
        }
    }
}

impl Default for MsgDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned frame for sending, receiving, or routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub desc: MsgDesc,
    /// Method name for requests, event name for events, verb for control frames.
    /// Empty on responses.
    pub method: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(desc: MsgDesc, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            desc,
            method: method.into(),
            payload: payload.into(),
        }
    }

    /// A call frame for `method` on `channel_id`.
    pub fn request(channel_id: u64, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let desc = MsgDesc {
            channel_id,
            flags: FrameFlags::REQUEST,
            ..MsgDesc::new()
        };
        Self::new(desc, method, payload)
    }

    /// A successful reply to the call on `channel_id`.
    pub fn response(channel_id: u64, payload: impl Into<Bytes>) -> Self {
        let desc = MsgDesc {
            channel_id,
            flags: FrameFlags::RESPONSE,
            ..MsgDesc::new()
        };
        Self::new(desc, String::new(), payload)
    }

    /// A failed reply to the call on `channel_id`.
    pub fn error_response(channel_id: u64, code: ErrorCode, message: &str) -> Self {
        let desc = MsgDesc {
            channel_id,
            flags: FrameFlags::RESPONSE | FrameFlags::ERROR,
            ..MsgDesc::new()
        };
        Self::new(desc, String::new(), encode_error_payload(code, message))
    }

    /// A controller-initiated event.
    pub fn event(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let desc = MsgDesc {
            flags: FrameFlags::EVENT,
            ..MsgDesc::new()
        };
        Self::new(desc, name, payload)
    }

    /// A session-level control frame.
    pub fn control(verb: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let desc = MsgDesc {
            flags: FrameFlags::CONTROL,
            ..MsgDesc::new()
        };
        Self::new(desc, verb, payload)
    }

    pub fn channel_id(&self) -> u64 {
        self.desc.channel_id
    }

    pub fn flags(&self) -> FrameFlags {
        self.desc.flags
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_response(&self) -> bool {
        self.desc.flags.contains(FrameFlags::RESPONSE)
    }

    pub fn is_error(&self) -> bool {
        self.desc.flags.contains(FrameFlags::ERROR)
    }

    pub fn is_control(&self) -> bool {
        self.desc.flags.contains(FrameFlags::CONTROL)
    }
}
