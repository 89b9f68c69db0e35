//! Message gateway contract.
//!
//! The broadcast engine only knows how to hand a text payload to a channel
//! address and read back a message id. Concrete transports (Telegram Bot API)
//! live in `courier-notifier`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Successful send acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReceipt {
    pub message_id: i64,
}

/// Structured send failure reported by the gateway.
///
/// `code` is absent for transport-level failures (timeouts, connection resets)
/// where the remote side never answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub code: Option<i32>,
    pub description: String,
    /// Back-off hint from the remote side (rate limiting).
    pub retry_after: Option<Duration>,
}

impl GatewayError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn transport(description: impl Into<String>) -> Self {
        Self {
            code: None,
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.description),
            None => write!(f, "{}", self.description),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Outbound messaging capability.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send(&self, address: &str, text: &str) -> Result<GatewayReceipt, GatewayError>;
}
