//! Telegram Bot API gateway.
//!
//! Sends plain-text messages through `sendMessage` and maps the Bot API's
//! `{ok, result, error_code, description, parameters}` envelope onto
//! [`GatewayReceipt`] / [`GatewayError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_common::gateway::{GatewayError, GatewayReceipt, MessageGateway};

/// Longest response snippet kept when the body is not a Bot API envelope.
const MAX_BODY_SNIPPET: usize = 200;

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<SentMessage>,
    error_code: Option<i32>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Turn an HTTP status plus raw body into a send result.
fn interpret(status: u16, body: &str) -> Result<GatewayReceipt, GatewayError> {
    let parsed: ApiResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            let snippet: String = body.chars().take(MAX_BODY_SNIPPET).collect();
            return Err(GatewayError::new(
                status as i32,
                format!("Unexpected response from Telegram: {}", snippet),
            ));
        }
    };

    if parsed.ok {
        return match parsed.result {
            Some(message) => Ok(GatewayReceipt {
                message_id: message.message_id,
            }),
            None => Err(GatewayError::new(
                status as i32,
                "Telegram reported success without a message",
            )),
        };
    }

    let mut err = GatewayError::new(
        parsed.error_code.unwrap_or(status as i32),
        parsed
            .description
            .unwrap_or_else(|| "Telegram request failed".to_string()),
    );
    if let Some(seconds) = parsed.parameters.and_then(|p| p.retry_after) {
        err = err.with_retry_after(Duration::from_secs(seconds));
    }
    Err(err)
}

pub struct TelegramGateway {
    client: reqwest::Client,
    send_url: String,
}

impl TelegramGateway {
    pub fn new(api_base: &str, token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            send_url: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
        })
    }
}

#[async_trait]
impl MessageGateway for TelegramGateway {
    async fn send(&self, address: &str, text: &str) -> Result<GatewayReceipt, GatewayError> {
        let response = self
            .client
            .post(&self.send_url)
            .json(&SendMessageRequest {
                chat_id: address,
                text,
            })
            .send()
            .await
            // The URL carries the bot token.
            .map_err(|e| GatewayError::transport(e.without_url().to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::transport(e.without_url().to_string()))?;

        let result = interpret(status, &body);
        if let Err(e) = &result {
            tracing::debug!(chat_id = address, error = %e, "Telegram send failed");
        }
        result
    }
}
