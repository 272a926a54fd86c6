//! The worker: one controller session, its event handlers, and the token.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use worklink_core::{
    Event, Invoker, RpcSession, SessionConfig, SessionError, StreamTransport, Transport,
};

use crate::error::{RefreshError, WorkerError};
use crate::manager::TokenManager;
use crate::options::Options;
use crate::token::Token;

/// A connected worker.
///
/// The tokens service is reached over the same controller session as
/// everything else.
pub struct Worker<T: Transport = StreamTransport> {
    options: Options,
    session: Arc<RpcSession<T>>,
    tokens: TokenManager,
    running: AtomicBool,
}

impl<T: Transport> std::fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("app", &self.options.app)
            .field("uuid", &self.options.uuid)
            .field("session", &self.session)
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl Worker<StreamTransport> {
    /// Connect to the controller named in `options` and start the token manager.
    pub async fn connect(options: Options) -> Result<Self, WorkerError> {
        let endpoint = options.endpoint()?;
        let locators = options.locators()?;
        tracing::debug!(
            app = %options.app,
            %endpoint,
            locators = locators.len(),
            protocol = options.protocol,
            "worker: connecting"
        );

        let session = RpcSession::connect(&endpoint, &options.uuid, SessionConfig::from_env())
            .await?;
        Ok(Self::with_session(options, session))
    }
}

impl<T: Transport> Worker<T> {
    /// Build a worker around an already established session.
    ///
    /// Must be called inside a tokio runtime when the token is renewable.
    pub fn with_session(options: Options, session: Arc<RpcSession<T>>) -> Self {
        let controller = session.clone();
        let factory = move |service_name: &str| -> Arc<dyn Invoker> {
            tracing::debug!(
                service = service_name,
                "worker: service multiplexed over controller session"
            );
            controller.clone() as Arc<dyn Invoker>
        };
        let tokens = TokenManager::make(&options.token_options(), &factory);

        Self {
            options,
            session,
            tokens,
            running: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn session(&self) -> &Arc<RpcSession<T>> {
        &self.session
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    /// Current token snapshot.
    pub fn token(&self) -> Token {
        self.tokens.token()
    }

    /// Handle events named `event`.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session.dispatcher().on(event, handler);
    }

    /// Handle events nobody registered for.
    pub fn fallback<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session.dispatcher().fallback(handler);
    }

    /// Serve until the controller terminates the session or it fails.
    ///
    /// Failed ticket refreshes are logged as they surface; they never end
    /// the worker. Token renewal stops when this returns.
    ///
    /// Runs once: later calls fail with [`WorkerError::AlreadyRunning`] and
    /// leave the first one serving.
    pub async fn run(&self) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(app = %self.options.app, "worker: run called twice");
            return Err(WorkerError::AlreadyRunning);
        }

        let mut failures = self.tokens.failures();
        let session_run = self.session.clone().run();
        tokio::pin!(session_run);

        let result: Result<(), SessionError> = loop {
            tokio::select! {
                result = &mut session_run => break result,
                failure = next_failure(&mut failures) => {
                    tracing::warn!(error = %failure, "worker: ticket refresh failed; keeping current token");
                }
            }
        };

        self.tokens.shutdown();
        match &result {
            Ok(()) => tracing::info!(app = %self.options.app, "worker: session closed"),
            Err(e) => tracing::error!(app = %self.options.app, error = %e, "worker: session failed"),
        }
        result.map_err(WorkerError::from)
    }
}

/// Next surfaced refresh failure; never resolves once there can be no more.
async fn next_failure(
    failures: &mut Option<mpsc::Receiver<RefreshError>>,
) -> RefreshError {
    loop {
        match failures {
            Some(rx) => match rx.recv().await {
                Some(failure) => return failure,
                None => *failures = None,
            },
            None => std::future::pending::<()>().await,
        }
    }
}
