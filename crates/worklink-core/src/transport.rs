//! Transport trait and backends.
//!
//! The [`Transport`] trait defines the interface every backend implements.
//! Each backend lives in its own module under `transport/`.

use std::future::Future;

use crate::{Frame, TransportError};

/// A reliable, ordered, bidirectional frame pipe.
///
/// Uses return-position `impl Trait` for the async methods so sessions stay
/// monomorphized over the concrete transport.
pub trait Transport: Send + Sync + Clone + 'static {
    /// Send a frame over this transport.
    fn send_frame(
        &self,
        frame: Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + '_;

    /// Receive the next frame.
    ///
    /// Only one task may be receiving at a time; the session's reader loop is
    /// the sole caller once the session runs.
    fn recv_frame(&self) -> impl Future<Output = Result<Frame, TransportError>> + Send + '_;

    /// Close this transport.
    ///
    /// After closing, `send_frame` and `recv_frame` return `TransportError::Closed`.
    fn close(&self);

    /// Check if this transport is closed.
    fn is_closed(&self) -> bool;
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
