//! A scripted `refresh_ticket` service living on the controller side.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use worklink::REFRESH_METHOD;
use worklink_core::{CallId, ErrorCode};

use crate::{FakeController, TestError};

/// What the service does with one request.
#[derive(Debug, Clone)]
pub enum TicketReply {
    /// Answer with a new ticket body.
    Ticket(String),
    /// Answer with an error.
    Fail(ErrorCode, String),
    /// Wait, then do the inner thing.
    After(Duration, Box<TicketReply>),
    /// Never answer.
    Never,
}

impl TicketReply {
    pub fn ticket(body: impl Into<String>) -> Self {
        Self::Ticket(body.into())
    }

    pub fn after(delay: Duration, then: TicketReply) -> Self {
        Self::After(delay, Box::new(then))
    }
}

/// One `refresh_ticket` call as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRequest {
    pub call_id: CallId,
    pub app: String,
    pub body: String,
    pub received_at: Instant,
}

/// What the service has seen so far.
#[derive(Debug, Default)]
pub struct TicketStats {
    requests: Mutex<Vec<TicketRequest>>,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
}

impl TicketStats {
    pub fn requests(&self) -> Vec<TicketRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Highest value [`outstanding`](Self::outstanding) ever reached.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    fn record(&self, request: TicketRequest) -> usize {
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
        let mut requests = self.requests.lock();
        requests.push(request);
        requests.len()
    }

    fn answered(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves `refresh_ticket` on a [`FakeController`] until the connection drops.
///
/// The script is called with the 1-based request number and the request and
/// decides how that request is answered. Other methods get `Unimplemented`.
pub struct TicketService {
    stats: Arc<TicketStats>,
    task: JoinHandle<()>,
}

impl TicketService {
    pub fn spawn<F>(controller: FakeController, script: F) -> Self
    where
        F: Fn(usize, &TicketRequest) -> TicketReply + Send + 'static,
    {
        let stats = Arc::new(TicketStats::default());
        let task = tokio::spawn(serve(controller, stats.clone(), script));
        Self { stats, task }
    }

    /// Answers request `n` with ticket `t{n}`.
    pub fn numbered(controller: FakeController) -> Self {
        Self::spawn(controller, |n, _| TicketReply::Ticket(format!("t{n}")))
    }

    pub fn stats(&self) -> &Arc<TicketStats> {
        &self.stats
    }
}

impl Drop for TicketService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<F>(controller: FakeController, stats: Arc<TicketStats>, script: F)
where
    F: Fn(usize, &TicketRequest) -> TicketReply + Send + 'static,
{
    loop {
        let request = match controller.recv_request().await {
            Ok(request) => request,
            Err(TestError::Protocol(msg)) => {
                tracing::debug!(%msg, "ticket service: ignoring frame");
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "ticket service: connection gone");
                return;
            }
        };

        if request.method != REFRESH_METHOD {
            let _ = controller
                .reply_error(request.call_id, ErrorCode::Unimplemented, "no such method")
                .await;
            continue;
        }

        let (app, body): (String, String) = match request.args() {
            Ok(args) => args,
            Err(e) => {
                let _ = controller
                    .reply_error(request.call_id, ErrorCode::InvalidArgument, &e.to_string())
                    .await;
                continue;
            }
        };

        let ticket = TicketRequest {
            call_id: request.call_id,
            app,
            body,
            received_at: Instant::now(),
        };
        let reply = script(stats.count() + 1, &ticket);
        let n = stats.record(ticket);
        tracing::debug!(n, call_id = request.call_id.get(), ?reply, "ticket service: request");

        tokio::spawn(respond(controller.clone(), stats.clone(), request.call_id, reply));
    }
}

async fn respond(
    controller: FakeController,
    stats: Arc<TicketStats>,
    call_id: CallId,
    mut reply: TicketReply,
) {
    loop {
        match reply {
            TicketReply::After(delay, then) => {
                tokio::time::sleep(delay).await;
                reply = *then;
            }
            TicketReply::Never => return,
            TicketReply::Ticket(body) => {
                stats.answered();
                let _ = controller.reply(call_id, &body).await;
                return;
            }
            TicketReply::Fail(code, message) => {
                stats.answered();
                let _ = controller.reply_error(call_id, code, &message).await;
                return;
            }
        }
    }
}
