//! worklink-core: the connection a worker process keeps to its controller.
//!
//! This crate defines:
//! - Frames and flags ([`Frame`], [`MsgDesc`], [`FrameFlags`])
//! - The pluggable wire codec ([`Codec`], [`PostcardCodec`])
//! - Transports ([`Transport`], `MemTransport`, `StreamTransport`)
//! - Endpoint parsing ([`Endpoint`], [`parse_locators`])
//! - Outstanding calls ([`InvocationTable`], [`PendingCall`], [`CallId`])
//! - Event routing ([`Dispatcher`], [`Event`])
//! - The multiplexed session ([`RpcSession`], [`Invoker`])
//! - Error codes and error types ([`ErrorCode`], [`RpcError`], [`SessionError`])

#![forbid(unsafe_code)]

mod codec;
mod dispatch;
mod endpoint;
mod error;
mod flags;
mod frame;
mod invocation;
mod session;
mod transport;

pub use codec::*;
pub use dispatch::*;
pub use endpoint::*;
pub use error::*;
pub use flags::*;
pub use frame::*;
pub use invocation::{CallId, InvocationTable, PendingCall, Reply};
pub use session::*;
pub use transport::*;

#[cfg(feature = "mem")]
pub use transport::mem::MemTransport;
#[cfg(feature = "stream")]
pub use transport::stream::{MAX_FRAME_SIZE, StreamTransport};
