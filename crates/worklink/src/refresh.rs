//! Background renewal of the authorization ticket.
//!
//! Every `interval` the task asks the tokens service for a fresh ticket body,
//! passing the application name and the current body. The reply is applied
//! by a spawned continuation, so the timer is re-armed straight away; the
//! next cycle then waits for that continuation before issuing its own call.
//! At most one `refresh_ticket` call is therefore ever outstanding, even with
//! a zero interval or a tokens service that never answers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worklink_core::{Invoker, PendingCall, RpcError, decode_payload, encode_payload};

use crate::error::RefreshError;
use crate::token::{SharedToken, Token};

/// Method the tokens service exposes for renewal.
pub const REFRESH_METHOD: &str = "refresh_ticket";

/// Unread failure reports kept per task; newer ones are dropped once full.
pub const FAILURE_BACKLOG: usize = 16;

/// Renews a [`SharedToken`] until cancelled.
///
/// Dropping the task cancels it.
pub struct RefreshTask {
    token: SharedToken,
    cancel: CancellationToken,
    cycles: Arc<AtomicU64>,
    failures: Mutex<Option<mpsc::Receiver<RefreshError>>>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for RefreshTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTask")
            .field("token", &self.token.get())
            .field("cycles", &self.cycles())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RefreshTask {
    /// Arm the first cycle. Must be called inside a tokio runtime.
    pub fn spawn(
        invoker: Arc<dyn Invoker>,
        application_name: impl Into<String>,
        interval: Duration,
        initial: Token,
    ) -> Self {
        let token = SharedToken::new(initial);
        let cancel = CancellationToken::new();
        let cycles = Arc::new(AtomicU64::new(0));
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_BACKLOG);

        let refresh = RefreshLoop {
            invoker,
            application_name: application_name.into(),
            interval,
            token: token.clone(),
            cancel: cancel.clone(),
            cycles: cycles.clone(),
            failures: failures_tx,
        };
        tracing::debug!(
            application = %refresh.application_name,
            interval_ms = interval.as_millis() as u64,
            "ticket refresh: armed"
        );
        let handle = tokio::spawn(refresh.run());

        Self {
            token,
            cancel,
            cycles,
            failures: Mutex::new(Some(failures_rx)),
            handle,
        }
    }

    /// Latest token. Never waits for a refresh in progress.
    pub fn token(&self) -> Token {
        self.token.get()
    }

    /// Stop renewing. The current token stays readable.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("ticket refresh: cancelled");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `true` once the renewal loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Number of `refresh_ticket` calls issued so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Failed cycles, in order. Can be taken once.
    ///
    /// At most [`FAILURE_BACKLOG`] reports wait here unread; the error log
    /// still records every failure.
    pub fn failures(&self) -> Option<mpsc::Receiver<RefreshError>> {
        self.failures.lock().take()
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RefreshLoop {
    invoker: Arc<dyn Invoker>,
    application_name: String,
    interval: Duration,
    token: SharedToken,
    cancel: CancellationToken,
    cycles: Arc<AtomicU64>,
    failures: mpsc::Sender<RefreshError>,
}

impl RefreshLoop {
    async fn run(self) {
        let mut in_flight: Option<JoinHandle<Result<(), RefreshError>>> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if let Some(mut previous) = in_flight.take() {
                let outcome = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        previous.abort();
                        break;
                    }
                    outcome = &mut previous => outcome,
                };
                let result = outcome.unwrap_or_else(|e| Err(RefreshError::Join(e.to_string())));
                if let Err(e) = result {
                    tracing::error!(
                        application = %self.application_name,
                        error = %e,
                        "ticket refresh: previous cycle failed"
                    );
                    if let Err(mpsc::error::TrySendError::Full(_)) = self.failures.try_send(e) {
                        tracing::debug!("ticket refresh: failure backlog full; dropping report");
                    }
                }
            }

            let pending = self.issue();
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(cycle, call_id = ?pending.id(), "ticket refresh: requested");
            in_flight = Some(tokio::spawn(apply(pending, self.token.clone(), cycle)));
        }

        if let Some(previous) = in_flight {
            previous.abort();
        }
        tracing::debug!(application = %self.application_name, "ticket refresh: stopped");
    }

    fn issue(&self) -> PendingCall {
        let current = self.token.get();
        match encode_payload(&(self.application_name.as_str(), current.body())) {
            Ok(payload) => self.invoker.invoke(REFRESH_METHOD, payload.into()),
            Err(e) => PendingCall::failed(RpcError::Encode(e)),
        }
    }
}

/// Wait for one `refresh_ticket` reply and install the new body.
async fn apply(pending: PendingCall, token: SharedToken, cycle: u64) -> Result<(), RefreshError> {
    let reply = pending.await?;
    let body: String = decode_payload(&reply).map_err(RpcError::from)?;
    token.replace_body(body);
    tracing::info!(cycle, "ticket refresh: token updated");
    Ok(())
}
