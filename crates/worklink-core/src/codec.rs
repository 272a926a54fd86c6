//! Pluggable frame codec and payload helpers.
//!
//! A [`Codec`] turns a whole [`Frame`] into bytes and back. Stream transports
//! add a length prefix around whatever the codec produces; in-memory
//! transports never touch a codec at all.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{DecodeError, EncodeError, Frame, FrameFlags, MsgDesc};

/// Frame serialization strategy used by stream transports.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError>;
}

/// Default codec: the frame as a postcard struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

#[derive(Serialize)]
struct WireFrameRef<'a> {
    msg_id: u64,
    channel_id: u64,
    flags: u32,
    method: &'a str,
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct WireFrame {
    msg_id: u64,
    channel_id: u64,
    flags: u32,
    method: String,
    payload: Vec<u8>,
}

impl Codec for PostcardCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
        let wire = WireFrameRef {
            msg_id: frame.desc.msg_id,
            channel_id: frame.desc.channel_id,
            flags: frame.desc.flags.bits(),
            method: &frame.method,
            payload: frame.payload_bytes(),
        };
        Ok(postcard::to_allocvec(&wire)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        let wire: WireFrame = postcard::from_bytes(bytes)?;
        let desc = MsgDesc {
            msg_id: wire.msg_id,
            channel_id: wire.channel_id,
            flags: FrameFlags::from_bits_truncate(wire.flags),
        };
        Ok(Frame::new(desc, wire.method, wire.payload))
    }
}

/// Serialize call arguments (or a reply value) into a frame payload.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Deserialize a frame payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    Ok(postcard::from_bytes(bytes)?)
}
