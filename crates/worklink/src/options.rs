//! Worker command line.

use std::time::Duration;

use clap::Parser;
use worklink_core::{ConnectionError, Endpoint, parse_locators};

use crate::manager::{DEFAULT_TOKEN_BODY, DEFAULT_TOKENS_SERVICE, TokenOptions};
use crate::token::TVM_TOKEN_KIND;

/// How the controller launched this worker.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "worklink-worker", version)]
#[command(about = "Worker process attached to a cluster controller")]
pub struct Options {
    /// Application name
    #[arg(long)]
    pub app: String,

    /// Worker uuid, announced in the handshake
    #[arg(long)]
    pub uuid: String,

    /// Controller endpoint: `host[:port]`, `[v6][:port]` or a socket path
    #[arg(long)]
    pub endpoint: String,

    /// Comma-separated locator endpoints
    #[arg(long)]
    pub locator: String,

    /// Protocol version
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=2))]
    pub protocol: u32,

    /// Token kind; `TVM` tokens are renewed in the background
    #[arg(long = "token-type", env = "WORKLINK_TOKEN_TYPE", default_value = TVM_TOKEN_KIND)]
    pub token_type: String,

    /// Initial token body
    #[arg(
        long = "token-body",
        env = "WORKLINK_TOKEN_BODY",
        default_value = DEFAULT_TOKEN_BODY,
        hide_env_values = true
    )]
    pub token_body: String,

    /// Service answering `refresh_ticket`
    #[arg(long = "tokens-service", default_value = DEFAULT_TOKENS_SERVICE)]
    pub tokens_service: String,

    /// Seconds between ticket refreshes
    #[arg(long = "refresh-interval", default_value_t = 15)]
    pub refresh_interval_secs: u64,
}

impl Options {
    pub fn endpoint(&self) -> Result<Endpoint, ConnectionError> {
        self.endpoint.parse()
    }

    /// Locator endpoints. Parsed for validation only; nothing resolves them.
    pub fn locators(&self) -> Result<Vec<Endpoint>, ConnectionError> {
        parse_locators(&self.locator)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn token_options(&self) -> TokenOptions {
        TokenOptions {
            application_name: self.app.clone(),
            kind: self.token_type.clone(),
            body: self.token_body.clone(),
            service_name: self.tokens_service.clone(),
            refresh_interval: self.refresh_interval(),
        }
    }
}
