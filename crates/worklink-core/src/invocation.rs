//! Call identifiers, the table of outstanding calls, and the future a caller
//! awaits for its reply.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{ErrorCode, RpcError, SessionError};

/// What an outstanding call eventually receives.
pub type Reply = Result<Bytes, RpcError>;

/// Identifier of one call on one session.
///
/// Assigned from 1 upwards and never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub u64);

impl CallId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outstanding calls keyed by [`CallId`].
///
/// Every entry leaves the table exactly once: through [`resolve`](Self::resolve),
/// [`forget`](Self::forget) or [`drain_fail`](Self::drain_fail).
#[derive(Debug)]
pub struct InvocationTable {
    entries: HashMap<CallId, oneshot::Sender<Reply>>,
    next_id: u64,
}

impl InvocationTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate the next id and register its reply slot.
    pub fn issue(&mut self) -> (CallId, oneshot::Receiver<Reply>) {
        let id = CallId(self.next_id);
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        (id, rx)
    }

    /// Deliver `reply` to `id` and remove the entry.
    ///
    /// Returns `false` if no call with that id is outstanding.
    pub fn resolve(&mut self, id: CallId, reply: Reply) -> bool {
        match self.entries.remove(&id) {
            Some(tx) => {
                // The caller may have stopped listening; the entry is gone either way.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Remove `id` without delivering anything.
    pub fn forget(&mut self, id: CallId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Fail every outstanding call with `error`. Returns how many were failed.
    pub fn drain_fail(&mut self, error: &SessionError) -> usize {
        let drained = self.entries.len();
        for (_, tx) in self.entries.drain() {
            let _ = tx.send(Err(RpcError::Session(error.clone())));
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Outstanding ids, sorted.
    pub fn ids(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for InvocationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whoever owns the table a [`PendingCall`] was issued from.
pub(crate) trait ForgetCall: Send + Sync {
    fn forget_call(&self, id: CallId);
}

/// The caller's side of an outstanding call.
///
/// Resolves to the reply payload, or to the error that ended the call.
/// Dropping it before it resolves removes the call from its table, so a
/// reply arriving afterwards is treated as one for an unknown id.
#[must_use = "a PendingCall does nothing unless awaited"]
pub struct PendingCall {
    inner: PendingInner,
}

enum PendingInner {
    Waiting {
        id: CallId,
        rx: oneshot::Receiver<Reply>,
        owner: Weak<dyn ForgetCall>,
    },
    Failed(Option<RpcError>),
    Done,
}

impl PendingCall {
    pub(crate) fn new(
        id: CallId,
        rx: oneshot::Receiver<Reply>,
        owner: Weak<dyn ForgetCall>,
    ) -> Self {
        Self {
            inner: PendingInner::Waiting { id, rx, owner },
        }
    }

    /// A call that never reached the table.
    pub fn failed(error: RpcError) -> Self {
        Self {
            inner: PendingInner::Failed(Some(error)),
        }
    }

    /// The id this call was issued under, if it was issued at all.
    pub fn id(&self) -> Option<CallId> {
        match &self.inner {
            PendingInner::Waiting { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            PendingInner::Waiting { id, .. } => f.debug_tuple("PendingCall").field(id).finish(),
            PendingInner::Failed(error) => f.debug_tuple("PendingCall").field(error).finish(),
            PendingInner::Done => f.write_str("PendingCall(done)"),
        }
    }
}

impl Future for PendingCall {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let reply = match &mut self.inner {
            PendingInner::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(reply)) => reply,
                // The table dropped the sender without resolving it, which only
                // happens when the whole session is torn down.
                Poll::Ready(Err(_)) => Err(RpcError::Session(SessionError::Closed)),
            },
            PendingInner::Failed(error) => Err(error.take().unwrap_or_else(polled_after_completion)),
            PendingInner::Done => Err(polled_after_completion()),
        };

        self.inner = PendingInner::Done;
        Poll::Ready(reply)
    }
}

fn polled_after_completion() -> RpcError {
    RpcError::status(ErrorCode::Internal, "call polled after completion")
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let PendingInner::Waiting { id, owner, .. } = &self.inner {
            if let Some(owner) = owner.upgrade() {
                owner.forget_call(*id);
            }
        }
    }
}
