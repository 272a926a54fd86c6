use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use crate::{Frame, TransportError};

use super::Transport;

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport pair.
///
/// Closing either end closes both, the way a socket shutdown would be
/// observed by the peer.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::Sender<Frame>,
    rx: AsyncMutex<mpsc::Receiver<Frame>>,
    shutdown: Arc<Shutdown>,
}

#[derive(Debug, Default)]
struct Shutdown {
    closed: AtomicBool,
    notify: Notify,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = Arc::new(Shutdown::default());

        let inner_a = Arc::new(MemInner {
            tx: tx_b,
            rx: AsyncMutex::new(rx_a),
            shutdown: shutdown.clone(),
        });

        let inner_b = Arc::new(MemInner {
            tx: tx_a,
            rx: AsyncMutex::new(rx_b),
            shutdown,
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.shutdown.closed.load(Ordering::Acquire)
    }
}

impl Transport for MemTransport {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        let notified = self.inner.shutdown.notify.notified();
        tokio::pin!(notified);
        // Register for the wakeup before checking the flag so a concurrent
        // close() cannot slip in between.
        notified.as_mut().enable();

        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
            _ = notified => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.inner.shutdown.closed.store(true, Ordering::Release);
        self.inner.shutdown.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Frame::event("hello", b"x".to_vec())).await.unwrap();
        let frame = b.recv_frame().await.unwrap();
        assert_eq!(frame.method, "hello");
        assert_eq!(frame.payload_bytes(), b"x");
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_receiver_on_either_end() {
        let (a, b) = MemTransport::pair();
        let waiter = tokio::spawn(async move { b.recv_frame().await });
        tokio::task::yield_now().await;

        a.close();
        assert!(matches!(waiter.await.unwrap(), Err(TransportError::Closed)));
        assert!(a.is_closed());
        assert!(matches!(
            a.send_frame(Frame::event("late", Vec::new())).await,
            Err(TransportError::Closed)
        ));
    }
}
