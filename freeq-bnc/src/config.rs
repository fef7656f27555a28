//! Command-line and environment configuration.

use clap::Parser;

use crate::error::RelayError;

/// IRC bouncer: share one server connection between many clients.
#[derive(Parser, Debug, Clone)]
#[command(name = "freeq-bnc", about = "IRC bouncer sharing one server connection")]
pub struct BncConfig {
    /// Prefix for commands sent to the bouncer instead of the server
    #[arg(long, env = "FREEQ_BNC_PREFIX", default_value = "bnc-")]
    pub prefix: String,

    /// Server address to connect to (host:port)
    #[arg(long, env = "FREEQ_BNC_SERVER")]
    pub server: Option<String>,

    /// Local port to listen on
    #[arg(long = "local-port", env = "FREEQ_BNC_LOCAL_PORT", default_value_t = 3434)]
    pub local_port: u16,

    /// Local address to listen on
    #[arg(long = "listen-host", env = "FREEQ_BNC_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Verbose logging (debug level, upstream traffic echo)
    #[arg(long, env = "FREEQ_BNC_VERBOSE")]
    pub verbose: bool,

    /// Lines buffered per client before the oldest are dropped.
    ///
    /// Applies to every client: an upstream burst larger than this evicts
    /// the oldest queued lines even for a client that is reading, if its
    /// writer has not caught up yet. Other clients are never slowed down.
    #[arg(long = "client-queue", env = "FREEQ_BNC_CLIENT_QUEUE", default_value_t = 512)]
    pub client_queue: usize,
}

impl Default for BncConfig {
    fn default() -> Self {
        Self {
            prefix: "bnc-".to_string(),
            server: None,
            local_port: 3434,
            listen_host: "0.0.0.0".to_string(),
            verbose: false,
            client_queue: 512,
        }
    }
}

impl BncConfig {
    /// Reject configurations the relay cannot start with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.server.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(RelayError::MissingServer);
        }
        if self.client_queue == 0 {
            return Err(RelayError::InvalidQueue);
        }
        Ok(())
    }

    /// Upstream address. Empty if unset; call [`validate`](Self::validate) first.
    pub fn upstream(&self) -> &str {
        self.server.as_deref().map(str::trim).unwrap_or_default()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.local_port)
    }
}
