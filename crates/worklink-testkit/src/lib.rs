//! worklink-testkit: a scripted controller for exercising worker sessions.
//!
//! The worker side gets an ordinary [`MemTransport`]; the test drives the
//! other end through [`FakeController`], frame by frame.
//!
//! # Usage
//!
//! ```ignore
//! let (session, controller, run) = worklink_testkit::running_session(SessionConfig::default()).await?;
//!
//! let call = session.invoke("refresh_ticket", payload);
//! let request = controller.recv_request().await?;
//! controller.reply(request.call_id, &"t1").await?;
//! assert_eq!(call.await?, ...);
//! ```

use std::sync::{Arc, Once};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use worklink_core::{
    CallId, DecodeError, EncodeError, ErrorCode, Frame, FrameFlags, MemTransport, RpcSession,
    SessionConfig, SessionError, Transport, TransportError, control_method, decode_payload,
    encode_error_payload, encode_payload,
};

pub mod ticket;

pub use ticket::{TicketReply, TicketRequest, TicketService, TicketStats};

/// Uuid the helpers announce during the handshake.
pub const TEST_UUID: &str = "7a8c3f1e-worker";

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// The worker sent something the script did not expect.
    Protocol(String),
    Transport(TransportError),
    Encode(EncodeError),
    Decode(DecodeError),
    Setup(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TestError::Transport(e) => write!(f, "transport error: {e}"),
            TestError::Encode(e) => write!(f, "encode error: {e}"),
            TestError::Decode(e) => write!(f, "decode error: {e}"),
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Transport(e)
    }
}

impl From<EncodeError> for TestError {
    fn from(e: EncodeError) -> Self {
        TestError::Encode(e)
    }
}

impl From<DecodeError> for TestError {
    fn from(e: DecodeError) -> Self {
        TestError::Decode(e)
    }
}

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary. Honours `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A call the worker made, as seen by the controller.
#[derive(Debug, Clone)]
pub struct Request {
    pub call_id: CallId,
    pub method: String,
    pub payload: Bytes,
}

impl Request {
    /// Decode the call arguments.
    pub fn args<A: DeserializeOwned>(&self) -> Result<A, TestError> {
        Ok(decode_payload(&self.payload)?)
    }
}

/// The controller end of a [`MemTransport`] pair.
#[derive(Clone, Debug)]
pub struct FakeController {
    transport: MemTransport,
}

impl FakeController {
    /// Returns the worker-side transport and the controller driving it.
    pub fn pair() -> (MemTransport, Self) {
        let (worker, controller) = MemTransport::pair();
        (worker, Self { transport: controller })
    }

    pub fn transport(&self) -> &MemTransport {
        &self.transport
    }

    pub async fn recv(&self) -> Result<Frame, TestError> {
        Ok(self.transport.recv_frame().await?)
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TestError> {
        Ok(self.transport.send_frame(frame).await?)
    }

    async fn expect_handshake(&self) -> Result<String, TestError> {
        let frame = self.recv().await?;
        if !frame.is_control() || frame.method != control_method::HANDSHAKE {
            return Err(TestError::Protocol(format!(
                "expected handshake, got {:?} `{}`",
                frame.flags(),
                frame.method
            )));
        }
        Ok(String::from_utf8_lossy(frame.payload_bytes()).into_owned())
    }

    /// Wait for the worker's handshake and acknowledge it. Returns the uuid.
    pub async fn accept_handshake(&self) -> Result<String, TestError> {
        let uuid = self.expect_handshake().await?;
        self.send(Frame::control(control_method::HANDSHAKE, Vec::new()))
            .await?;
        Ok(uuid)
    }

    /// Wait for the worker's handshake and refuse it. Returns the uuid.
    pub async fn reject_handshake(
        &self,
        code: ErrorCode,
        message: &str,
    ) -> Result<String, TestError> {
        let uuid = self.expect_handshake().await?;
        let payload = encode_error_payload(code, message);
        let mut frame = Frame::control(control_method::HANDSHAKE, payload);
        frame.desc.flags |= FrameFlags::ERROR;
        self.send(frame).await?;
        Ok(uuid)
    }

    /// Wait for the next call from the worker.
    pub async fn recv_request(&self) -> Result<Request, TestError> {
        let frame = self.recv().await?;
        if !frame.flags().contains(FrameFlags::REQUEST) {
            return Err(TestError::Protocol(format!(
                "expected a request, got {:?} `{}`",
                frame.flags(),
                frame.method
            )));
        }
        Ok(Request {
            call_id: CallId(frame.channel_id()),
            method: frame.method,
            payload: frame.payload,
        })
    }

    /// Answer `call_id` with a postcard-encoded value.
    pub async fn reply<R: Serialize + ?Sized>(
        &self,
        call_id: CallId,
        value: &R,
    ) -> Result<(), TestError> {
        self.reply_raw(call_id, encode_payload(value)?).await
    }

    pub async fn reply_raw(
        &self,
        call_id: CallId,
        payload: impl Into<Bytes>,
    ) -> Result<(), TestError> {
        self.send(Frame::response(call_id.get(), payload)).await
    }

    pub async fn reply_error(
        &self,
        call_id: CallId,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), TestError> {
        self.send(Frame::error_response(call_id.get(), code, message))
            .await
    }

    pub async fn send_event(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), TestError> {
        self.send(Frame::event(name, payload)).await
    }

    /// Ask the worker to shut down in an orderly way.
    pub async fn terminate(&self) -> Result<(), TestError> {
        self.send(Frame::control(control_method::TERMINATE, Vec::new()))
            .await
    }

    /// Drop the connection, as a crashed controller would.
    pub fn close(&self) {
        self.transport.close();
    }
}

/// Handshake `session` against `controller` concurrently.
pub async fn establish(
    session: &RpcSession<MemTransport>,
    controller: &FakeController,
) -> Result<(), TestError> {
    let (worker, peer) = tokio::join!(session.handshake(TEST_UUID), controller.accept_handshake());
    worker.map_err(|e| TestError::Setup(format!("handshake failed: {e}")))?;
    let uuid = peer?;
    if uuid != TEST_UUID {
        return Err(TestError::Protocol(format!("unexpected uuid {uuid}")));
    }
    Ok(())
}

/// An established session whose `run` loop is already spawned.
pub async fn running_session(
    config: SessionConfig,
) -> Result<
    (
        Arc<RpcSession<MemTransport>>,
        FakeController,
        JoinHandle<Result<(), SessionError>>,
    ),
    TestError,
> {
    let (transport, controller) = FakeController::pair();
    let session = Arc::new(RpcSession::with_config(transport, config));
    establish(&session, &controller).await?;
    let run = tokio::spawn(session.clone().run());
    Ok((session, controller, run))
}
