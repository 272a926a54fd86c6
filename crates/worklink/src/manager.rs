//! Token managers: where a worker's authorization token comes from.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use worklink_core::Invoker;

use crate::error::RefreshError;
use crate::refresh::RefreshTask;
use crate::token::{TVM_TOKEN_KIND, Token};

pub const DEFAULT_TOKEN_BODY: &str = "very_secret";
pub const DEFAULT_TOKENS_SERVICE: &str = "tvm";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a token manager is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOptions {
    pub application_name: String,
    pub kind: String,
    pub body: String,
    /// Service answering `refresh_ticket`.
    pub service_name: String,
    pub refresh_interval: Duration,
}

impl TokenOptions {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            kind: TVM_TOKEN_KIND.to_string(),
            body: DEFAULT_TOKEN_BODY.to_string(),
            service_name: DEFAULT_TOKENS_SERVICE.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Resolves a service name to something that can call it.
///
/// This is where service discovery would plug in; the worker resolves every
/// name to its controller session.
pub trait SessionFactory {
    fn invoker(&self, service_name: &str) -> Arc<dyn Invoker>;
}

impl<F> SessionFactory for F
where
    F: Fn(&str) -> Arc<dyn Invoker>,
{
    fn invoker(&self, service_name: &str) -> Arc<dyn Invoker> {
        self(service_name)
    }
}

/// Source of the worker's token, chosen once from the token kind.
#[derive(Debug)]
pub enum TokenManager {
    /// Renews the token in the background.
    Remote(RemoteTokenManager),
    /// Hands out the configured token unchanged.
    Null(NullTokenManager),
}

#[derive(Debug)]
pub struct RemoteTokenManager {
    service_name: String,
    task: RefreshTask,
}

#[derive(Debug)]
pub struct NullTokenManager {
    token: Token,
}

impl TokenManager {
    /// Build the manager for `options.kind`.
    ///
    /// Kind `"TVM"` starts the refresh task against `options.service_name`
    /// (so this must run inside a tokio runtime); any other kind never
    /// consults `factory`.
    pub fn make(options: &TokenOptions, factory: &dyn SessionFactory) -> Self {
        let token = Token::new(options.kind.clone(), options.body.clone());

        if options.kind != TVM_TOKEN_KIND {
            tracing::debug!(kind = %options.kind, "token manager: static token");
            return Self::Null(NullTokenManager { token });
        }

        tracing::debug!(
            service = %options.service_name,
            application = %options.application_name,
            "token manager: renewing via tokens service"
        );
        let invoker = factory.invoker(&options.service_name);
        let task = RefreshTask::spawn(
            invoker,
            options.application_name.clone(),
            options.refresh_interval,
            token,
        );
        Self::Remote(RemoteTokenManager {
            service_name: options.service_name.clone(),
            task,
        })
    }

    /// The latest token snapshot.
    pub fn token(&self) -> Token {
        match self {
            Self::Remote(remote) => remote.task.token(),
            Self::Null(null) => null.token.clone(),
        }
    }

    /// Stop background renewal. Nothing to do for a static token.
    pub fn shutdown(&self) {
        if let Self::Remote(remote) = self {
            remote.task.cancel();
        }
    }

    /// Failed renewals, for whoever wants to watch them. Can be taken once.
    pub fn failures(&self) -> Option<mpsc::Receiver<RefreshError>> {
        match self {
            Self::Remote(remote) => remote.task.failures(),
            Self::Null(_) => None,
        }
    }

    pub fn refresh_task(&self) -> Option<&RefreshTask> {
        match self {
            Self::Remote(remote) => Some(&remote.task),
            Self::Null(_) => None,
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            Self::Remote(remote) => Some(&remote.service_name),
            Self::Null(_) => None,
        }
    }
}
