//! RpcSession: one connection to the controller, shared by every caller.
//!
//! # Architecture
//!
//! ```text
//!   invoke() ──► InvocationTable ──► outbound queue ──► writer loop ──► transport
//!                      ▲                                                  │
//!                      │ resolve(id)                                      │
//!                      └──────── reader loop (demux) ◄────────────────────┘
//!                                        │
//!                              EVENT ────┴──► Dispatcher ──► spawned handler
//! ```
//!
//! Only [`RpcSession::run`] calls `transport.recv_frame()` once the session is
//! established. `invoke` never awaits: it registers the call and queues the
//! request frame, so it can be called from synchronous code, from a timer
//! callback, or before `run` has started.
//!
//! # Usage
//!
//! ```ignore
//! let session = Arc::new(RpcSession::new(transport));
//! session.handshake("worker-uuid").await?;
//! tokio::spawn(session.clone().run());
//!
//! let reply: String = session.call("refresh_ticket", &("app", "body")).await?;
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::invocation::ForgetCall;
use crate::{
    CallId, ConnectionError, Dispatcher, ErrorCode, Event, Frame, FrameFlags, InvocationTable,
    PendingCall, RpcError, SessionError, Transport, TransportError, control_method,
    decode_payload, encode_payload, parse_error_payload,
};

const DEFAULT_MAX_PENDING: usize = 8192;

/// Anything that can start a remote call by method name.
///
/// Object-safe so token managers and refresh tasks can hold a
/// `Arc<dyn Invoker>` without knowing the transport.
pub trait Invoker: Send + Sync {
    fn invoke(&self, method: &str, payload: Bytes) -> PendingCall;
}

/// Per-session limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Calls allowed in the invocation table at once.
    pub max_pending: usize,
    /// Deadline applied by [`RpcSession::call`]. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            call_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Defaults, overridden by `WORKLINK_MAX_PENDING` and `WORKLINK_CALL_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let max_pending = std::env::var("WORKLINK_MAX_PENDING")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_PENDING);

        let call_timeout = std::env::var("WORKLINK_CALL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_millis);

        Self {
            max_pending,
            call_timeout,
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Running,
    Failed(SessionError),
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }

    /// The error a new call gets in this state, if it cannot be issued.
    fn terminal_error(&self) -> Option<SessionError> {
        match self {
            Self::Failed(e) => Some(e.clone()),
            Self::Closed => Some(SessionError::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Running => write!(f, "running"),
            Self::Failed(e) => write!(f, "failed ({e})"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State and calls change together under one lock, so no call can be
/// registered after the table was drained.
#[derive(Debug)]
struct Shared {
    state: SessionState,
    calls: InvocationTable,
}

impl ForgetCall for Mutex<Shared> {
    fn forget_call(&self, id: CallId) {
        if self.lock().calls.forget(id) {
            tracing::debug!(call_id = id.get(), "call dropped: removed pending entry");
        }
    }
}

/// A multiplexed RPC session over one transport.
pub struct RpcSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    shared: Arc<Mutex<Shared>>,
    dispatcher: Dispatcher,

    /// Request frames waiting for the writer loop.
    outbound_tx: mpsc::UnboundedSender<Frame>,
    /// Taken by the first `run()`.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,

    shutdown: CancellationToken,
    next_msg_id: AtomicU64,
}

impl<T: Transport> fmt::Debug for RpcSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("RpcSession")
            .field("state", &shared.state)
            .field("pending", &shared.calls.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> RpcSession<T> {
    /// Wrap `transport`, with limits taken from the environment.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::from_env())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Disconnected,
                calls: InvocationTable::new(),
            })),
            dispatcher: Dispatcher::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown: CancellationToken::new(),
            next_msg_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Event routing table for this session.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state.clone()
    }

    /// Ids of calls still waiting for a reply, sorted (for diagnostics).
    pub fn pending_call_ids(&self) -> Vec<CallId> {
        self.shared.lock().calls.ids()
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Announce `uuid` to the controller and wait for its acknowledgement.
    ///
    /// Must complete before [`run`](Self::run) is started. On failure the
    /// session is left in `Failed` and the transport is closed.
    pub async fn handshake(&self, uuid: &str) -> Result<(), ConnectionError> {
        {
            let mut shared = self.shared.lock();
            if !matches!(shared.state, SessionState::Disconnected) {
                return Err(ConnectionError::Protocol(format!(
                    "handshake attempted while {}",
                    shared.state
                )));
            }
            shared.state = SessionState::Connecting;
        }

        tracing::debug!(uuid, "handshake: sending");
        match self.exchange_handshake(uuid).await {
            Ok(()) => {
                let mut shared = self.shared.lock();
                if shared.state.is_terminal() {
                    // close() raced the acknowledgement.
                    return Err(ConnectionError::Transport(TransportError::Closed));
                }
                shared.state = SessionState::Running;
                tracing::info!(uuid, "handshake: session established");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(uuid, error = %e, "handshake: failed");
                self.finish(SessionError::HandshakeFailed);
                Err(e)
            }
        }
    }

    async fn exchange_handshake(&self, uuid: &str) -> Result<(), ConnectionError> {
        let mut hello = Frame::control(control_method::HANDSHAKE, uuid.as_bytes().to_vec());
        hello.desc.msg_id = self.next_msg_id();
        self.transport.send_frame(hello).await?;

        let reply = self.transport.recv_frame().await?;
        if !reply.is_control() || reply.method != control_method::HANDSHAKE {
            return Err(ConnectionError::Protocol(format!(
                "expected handshake acknowledgement, got {:?} frame `{}`",
                reply.flags(),
                reply.method
            )));
        }
        if reply.is_error() {
            let err = parse_error_payload(reply.payload_bytes());
            return Err(ConnectionError::Rejected {
                code: err.code,
                message: err.message,
            });
        }
        Ok(())
    }

    /// Start a call and return immediately.
    ///
    /// The request is queued for the writer loop; the returned future
    /// resolves when the matching reply arrives or the session ends.
    pub fn invoke(&self, method: &str, payload: impl Into<Bytes>) -> PendingCall {
        let payload = payload.into();
        let payload_len = payload.len();

        let (id, rx) = {
            let mut shared = self.shared.lock();
            if let Some(error) = shared.state.terminal_error() {
                tracing::debug!(method, error = %error, "invoke: session is down");
                return PendingCall::failed(RpcError::Session(error));
            }

            let pending_len = shared.calls.len();
            if pending_len >= self.config.max_pending {
                tracing::warn!(
                    method,
                    pending_len,
                    max_pending = self.config.max_pending,
                    "too many pending calls; refusing new call"
                );
                return PendingCall::failed(RpcError::status(
                    ErrorCode::ResourceExhausted,
                    "too many pending calls",
                ));
            }

            let (id, rx) = shared.calls.issue();
            let mut frame = Frame::request(id.get(), method, payload);
            frame.desc.msg_id = self.next_msg_id();
            if self.outbound_tx.send(frame).is_err() {
                // The writer is gone, which only happens after run() returned.
                shared.calls.forget(id);
                return PendingCall::failed(RpcError::Session(SessionError::Closed));
            }
            (id, rx)
        };

        tracing::debug!(call_id = id.get(), method, payload_len, "invoke: request queued");
        let owner = Arc::downgrade(&self.shared) as Weak<dyn ForgetCall>;
        PendingCall::new(id, rx, owner)
    }

    /// Typed call: encode `args`, wait for the reply (bounded by
    /// `call_timeout`), decode it as `R`.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = encode_payload(args)?;
        let pending = self.invoke(method, payload);
        let call_id = pending.id();

        let bytes = match self.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, pending).await {
                Ok(reply) => reply?,
                Err(_elapsed) => {
                    tracing::warn!(
                        call_id = call_id.map(CallId::get),
                        method,
                        timeout_ms = timeout.as_millis() as u64,
                        "call timed out waiting for response"
                    );
                    return Err(RpcError::status(
                        ErrorCode::DeadlineExceeded,
                        format!("no reply to `{method}` within {timeout:?}"),
                    ));
                }
            },
            None => pending.await?,
        };

        Ok(decode_payload(&bytes)?)
    }

    /// Drive the session until it closes or fails.
    ///
    /// Must follow a successful [`handshake`](Self::handshake); before that
    /// it returns [`SessionError::NotEstablished`] and can be retried.
    ///
    /// Returns `Ok(())` after [`close`](Self::close) or a controller
    /// `terminate`, and the terminal error otherwise. Every call still
    /// pending at that point has been failed with that error.
    pub async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        {
            let shared = self.shared.lock();
            if matches!(
                shared.state,
                SessionState::Disconnected | SessionState::Connecting
            ) {
                tracing::warn!(state = %shared.state, "RpcSession::run: handshake not complete");
                return Err(SessionError::NotEstablished);
            }
        }

        let Some(outbound) = self.outbound_rx.lock().take() else {
            tracing::warn!("RpcSession::run: already started");
            return Ok(());
        };

        if let Some(error) = self.shared.lock().state.terminal_error() {
            tracing::debug!(error = %error, "RpcSession::run: session already down");
            return match error {
                SessionError::Closed => Ok(()),
                other => Err(other),
            };
        }

        tracing::debug!("RpcSession::run: starting reader and writer loops");
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(()),
            result = self.read_loop() => result,
            result = self.write_loop(outbound) => result,
        };
        // A local close() also closes the transport, which the loops may
        // report as an error first.
        let outcome = if self.shutdown.is_cancelled() {
            Ok(())
        } else {
            outcome
        };

        match outcome {
            Ok(()) => {
                self.finish(SessionError::Closed);
                tracing::info!("RpcSession::run: session closed");
                Ok(())
            }
            Err(e) => {
                self.finish(e.clone());
                tracing::error!(error = %e, "RpcSession::run: session failed");
                Err(e)
            }
        }
    }

    async fn read_loop(&self) -> Result<(), SessionError> {
        loop {
            let frame = self.transport.recv_frame().await?;

            tracing::trace!(
                channel_id = frame.channel_id(),
                msg_id = frame.desc.msg_id,
                flags = ?frame.flags(),
                method = %frame.method,
                payload_len = frame.payload_bytes().len(),
                "RpcSession::run: received frame"
            );

            if frame.is_control() {
                if frame.method == control_method::TERMINATE {
                    tracing::info!("RpcSession::run: controller requested terminate");
                    return Ok(());
                }
                tracing::debug!(method = %frame.method, "RpcSession::run: ignoring control frame");
            } else if frame.is_response() {
                self.deliver_response(frame);
            } else if frame.flags().contains(FrameFlags::EVENT) {
                self.dispatcher.dispatch(Event {
                    name: frame.method,
                    payload: frame.payload,
                });
            } else if frame.flags().contains(FrameFlags::REQUEST) {
                tracing::warn!(
                    channel_id = frame.channel_id(),
                    method = %frame.method,
                    "RpcSession::run: worker does not serve calls; replying unimplemented"
                );
                let mut reply = Frame::error_response(
                    frame.channel_id(),
                    ErrorCode::Unimplemented,
                    "worker does not serve calls",
                );
                reply.desc.msg_id = self.next_msg_id();
                let _ = self.outbound_tx.send(reply);
            } else {
                tracing::debug!(flags = ?frame.flags(), "RpcSession::run: ignoring frame");
            }
        }
    }

    async fn write_loop(
        &self,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Result<(), SessionError> {
        while let Some(frame) = outbound.recv().await {
            let channel_id = frame.channel_id();
            self.transport.send_frame(frame).await?;
            tracing::trace!(channel_id, "RpcSession::run: frame written");
        }
        Ok(())
    }

    fn deliver_response(&self, frame: Frame) {
        let id = CallId(frame.channel_id());
        let reply = if frame.is_error() {
            Err(RpcError::Call(parse_error_payload(frame.payload_bytes())))
        } else {
            Ok(frame.payload)
        };

        if self.shared.lock().calls.resolve(id, reply) {
            tracing::debug!(call_id = id.get(), "RpcSession::run: delivered response");
        } else {
            tracing::debug!(
                call_id = id.get(),
                "RpcSession::run: dropping response for unknown call"
            );
        }
    }

    /// Move to a terminal state (unless already there) and fail every pending call.
    fn finish(&self, error: SessionError) {
        let drained = {
            let mut shared = self.shared.lock();
            if shared.state.is_terminal() {
                None
            } else {
                shared.state = match &error {
                    SessionError::Closed => SessionState::Closed,
                    other => SessionState::Failed(other.clone()),
                };
                Some(shared.calls.drain_fail(&error))
            }
        };

        if let Some(drained) = drained {
            tracing::debug!(drained, error = %error, "session finished; failed pending calls");
        }
        self.shutdown.cancel();
        self.transport.close();
    }

    /// Shut the session down locally.
    ///
    /// Pending calls fail with [`SessionError::Closed`], `run` returns
    /// `Ok(())`, and the transport is closed. Calling it again does nothing.
    pub fn close(&self) {
        self.finish(SessionError::Closed);
    }
}

impl<T: Transport> Invoker for RpcSession<T> {
    fn invoke(&self, method: &str, payload: Bytes) -> PendingCall {
        RpcSession::invoke(self, method, payload)
    }
}

#[cfg(feature = "stream")]
impl RpcSession<crate::StreamTransport> {
    /// Open a socket to `endpoint` and perform the handshake.
    pub async fn connect(
        endpoint: &crate::Endpoint,
        uuid: &str,
        config: SessionConfig,
    ) -> Result<Arc<Self>, ConnectionError> {
        tracing::debug!(%endpoint, "connecting to controller");
        let transport = crate::StreamTransport::connect(endpoint).await?;
        let session = Arc::new(Self::with_config(transport, config));
        session.handshake(uuid).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_pending, 8192);
        assert_eq!(config.call_timeout, None);
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed(SessionError::PeerClosed).is_terminal());
        assert!(matches!(
            SessionState::Closed.terminal_error(),
            Some(SessionError::Closed)
        ));
        assert!(SessionState::Connecting.terminal_error().is_none());
    }
}
