//! Signed HTTP dispatch to the agent gateway.
//!
//! One retry on network-level failures only; HTTP status errors are never
//! retried. Each attempt is signed fresh so a retried request can never
//! trip the receiver's replay cache.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentId, GatewayConfig};
use crate::services::delegation::{DelegationMessage, MessageDispatcher};

use super::signing::MessageSigner;

/// Gateway URLs may be `https` anywhere, or `http` on loopback only.
pub fn validate_gateway_url(url: &str) -> CoreResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| CoreError::ForbiddenScheme(url.to_string()))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or_default();
            if host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1" {
                Ok(())
            } else {
                Err(CoreError::ForbiddenScheme(url.to_string()))
            }
        }
        _ => Err(CoreError::ForbiddenScheme(url.to_string())),
    }
}

/// HTTP client for the agent gateway.
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    signer: MessageSigner,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig, signer: MessageSigner) -> CoreResult<Self> {
        validate_gateway_url(&config.url)?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            signer,
        })
    }

    async fn post_signed(&self, path: &str, body: &[u8]) -> CoreResult<StatusCode> {
        let headers = self.signer.sign("POST", path, body);
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header("X-Agent-Id", headers.agent_id.as_str())
            .header("X-Timestamp", headers.timestamp.to_string())
            .header("X-Nonce", &headers.nonce)
            .header("X-Signature", &headers.signature)
            .header("Content-Type", "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    CoreError::Timeout(0)
                } else {
                    CoreError::Network(err.to_string())
                }
            })?;
        Ok(response.status())
    }
}

#[async_trait]
impl MessageDispatcher for GatewayClient {
    async fn dispatch(&self, target: AgentId, message: &DelegationMessage) -> CoreResult<()> {
        let path = format!("/agent/{target}/message");
        let body = serde_json::to_vec(message)?;

        let mut attempts = 0;
        let status = loop {
            match self.post_signed(&path, &body).await {
                Ok(status) => break status,
                Err(err) if err.is_transient() && attempts == 0 => {
                    tracing::debug!(target = %target, error = %err, "gateway dispatch retrying after network failure");
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        };

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(CoreError::SignatureInvalid),
            StatusCode::NOT_FOUND => Err(CoreError::NotFound(format!("agent {target}"))),
            StatusCode::TOO_MANY_REQUESTS => Err(CoreError::RateLimited {
                agent: target,
                operation: "message".to_string(),
                count: 0,
            }),
            s => Err(CoreError::GatewayUnavailable(format!(
                "gateway answered {s} for {path}"
            ))),
        }
    }
}
