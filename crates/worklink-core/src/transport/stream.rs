use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::{
    Codec, ConnectionError, DecodeError, EncodeError, Endpoint, Frame, PostcardCodec,
    TransportError,
};

use super::Transport;

/// Largest frame (codec bytes, excluding the length prefix) either side may send.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed frames over any byte stream.
///
/// Each frame is `u32 LE length | codec bytes`.
pub struct StreamTransport<C: Codec = PostcardCodec> {
    inner: Arc<StreamInner<C>>,
}

impl<C: Codec> Clone for StreamTransport<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Codec> std::fmt::Debug for StreamTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed_inner())
            .finish_non_exhaustive()
    }
}

struct StreamInner<C> {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    close_notify: Notify,
    codec: C,
}

impl StreamTransport<PostcardCodec> {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::with_codec(stream, PostcardCodec)
    }

    /// Two transports joined by an in-memory duplex pipe.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    /// Open a socket to `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ConnectionError> {
        let unreachable = |source| ConnectionError::Unreachable {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Tcp { .. } => {
                let addr = endpoint
                    .socket_addr()
                    .ok_or_else(|| ConnectionError::InvalidEndpoint(endpoint.to_string()))?;
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(unreachable)?;
                stream.set_nodelay(true).map_err(unreachable)?;
                Ok(Self::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unreachable)?;
                Ok(Self::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(ConnectionError::InvalidEndpoint(endpoint.to_string())),
        }
    }
}

impl<C: Codec> StreamTransport<C> {
    pub fn with_codec<S>(stream: S, codec: C) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                codec,
            }),
        }
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn read_frame(&self) -> Result<Frame, TransportError> {
        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        let frame_len = u32::from_le_bytes(len_buf) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(DecodeError::FrameTooLarge {
                len: frame_len,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let mut buf = vec![0u8; frame_len];
        reader.read_exact(&mut buf).await?;

        Ok(self.inner.codec.decode(&buf)?)
    }
}

impl<C: Codec> Transport for StreamTransport<C> {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let bytes = self.inner.codec.encode(&frame)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(EncodeError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        let notified = self.inner.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            frame = self.read_frame() => frame,
            _ = notified => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.close_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (a, b) = StreamTransport::pair();

        let mut request = Frame::request(3, "refresh_ticket", vec![1, 2, 3]);
        request.desc.msg_id = 9;
        a.send_frame(request.clone()).await.unwrap();
        a.send_frame(Frame::response(3, Vec::new())).await.unwrap();

        assert_eq!(b.recv_frame().await.unwrap(), request);
        let reply = b.recv_frame().await.unwrap();
        assert!(reply.is_response());
        assert!(reply.payload_bytes().is_empty());
    }

    #[tokio::test]
    async fn eof_is_reported_as_closed() {
        let (a, b) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(a);
        drop(b);
        assert!(matches!(
            transport.recv_frame().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (a, mut b) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(a);
        b.write_all(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            transport.recv_frame().await,
            Err(TransportError::Decode(DecodeError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn local_close_wakes_the_reader() {
        let (a, _b) = StreamTransport::pair();
        let reader = a.clone();
        let waiter = tokio::spawn(async move { reader.recv_frame().await });
        tokio::task::yield_now().await;

        a.close();
        assert!(matches!(waiter.await.unwrap(), Err(TransportError::Closed)));
    }
}
