//! Routing of controller-initiated events to user handlers.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

/// An event pushed by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub payload: Bytes,
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    exact: HashMap<String, Handler>,
    fallback: Option<Handler>,
}

/// Event name → handler table, plus an optional catch-all.
///
/// Cloning shares the table. Handlers may be added while the session runs;
/// each event is routed with whatever table is current when it arrives.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<Mutex<Handlers>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock();
        let mut events: Vec<&String> = handlers.exact.keys().collect();
        events.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("events", &events)
            .field("fallback", &handlers.fallback.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle events named `event`, replacing any earlier handler for it.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let event = event.into();
        tracing::debug!(event = %event, "dispatcher: handler registered");
        self.handlers.lock().exact.insert(event, boxed(handler));
    }

    /// Handle every event that has no handler of its own.
    pub fn fallback<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("dispatcher: fallback registered");
        self.handlers.lock().fallback = Some(boxed(handler));
    }

    /// Spawn the handler for `event`. Returns `false` if the event was dropped.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn dispatch(&self, event: Event) -> bool {
        let (handler, route) = {
            let handlers = self.handlers.lock();
            match handlers.exact.get(&event.name) {
                Some(handler) => (handler.clone(), "exact"),
                None => match &handlers.fallback {
                    Some(handler) => (handler.clone(), "fallback"),
                    None => {
                        tracing::debug!(
                            event = %event.name,
                            payload_len = event.payload.len(),
                            "dispatcher: no handler; dropping event"
                        );
                        return false;
                    }
                },
            }
        };

        let name = event.name.clone();
        tracing::debug!(event = %name, route, "dispatcher: dispatching event");

        tokio::spawn(async move {
            // Calling the handler happens inside the guarded future so a panic
            // while building the future is caught too.
            let result = AssertUnwindSafe(async move { handler(event).await })
                .catch_unwind()
                .await;

            if let Err(panic) = result {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                tracing::error!(event = %name, %message, "dispatcher: event handler panicked");
            }
        });

        true
    }
}

fn boxed<F, Fut>(handler: F) -> Handler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}
