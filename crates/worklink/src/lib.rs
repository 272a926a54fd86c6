//! Worker runtime on top of `worklink-core`.
//!
//! A [`Worker`] holds one session to its controller, dispatches the events
//! the controller pushes, and keeps an authorization [`Token`] fresh by
//! calling `refresh_ticket` on the tokens service in the background.

#![forbid(unsafe_code)]

mod error;
mod manager;
mod options;
mod refresh;
mod token;
mod tracing_setup;
mod worker;

pub use error::{RefreshError, WorkerError};
pub use manager::{
    DEFAULT_REFRESH_INTERVAL, DEFAULT_TOKEN_BODY, DEFAULT_TOKENS_SERVICE, NullTokenManager,
    RemoteTokenManager, SessionFactory, TokenManager, TokenOptions,
};
pub use options::Options;
pub use refresh::{FAILURE_BACKLOG, REFRESH_METHOD, RefreshTask};
pub use token::{SharedToken, TVM_TOKEN_KIND, Token};
pub use tracing_setup::init_tracing;
pub use worker::Worker;

pub use worklink_core::Event;
