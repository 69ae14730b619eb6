//! Outbound calls from the gateway to agent containers.
//!
//! Agents expose `POST /invoke` and receive the caller's JSON payload with
//! the thread id in `X-Thread-Id`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::runtime::AgentEndpoint;

pub const THREAD_ID_HEADER: &str = "X-Thread-Id";

/// Raw agent reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl AgentReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body as a job result. Non-JSON bodies are wrapped as `{"raw": …}`.
    pub fn into_result(self) -> Value {
        match serde_json::from_slice::<Value>(&self.body) {
            Ok(v) => v,
            Err(_) => serde_json::json!({ "raw": String::from_utf8_lossy(&self.body) }),
        }
    }

    /// Short error text for a non-2xx reply.
    pub fn failure_message(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let text = text.trim();
        if text.is_empty() {
            format!("agent returned HTTP {}", self.status)
        } else {
            let snippet: String = text.chars().take(512).collect();
            format!("agent returned HTTP {}: {snippet}", self.status)
        }
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &AgentEndpoint,
        thread_id: &str,
        payload: &Value,
    ) -> Result<AgentReply>;
}

/// `reqwest`-backed client.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("agentgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(
        &self,
        endpoint: &AgentEndpoint,
        thread_id: &str,
        payload: &Value,
    ) -> Result<AgentReply> {
        let url = format!("{}/invoke", endpoint.base_url());
        let response = self
            .http
            .post(&url)
            .header(THREAD_ID_HEADER, thread_id)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::timeout(format!("invoke {endpoint}"), self.timeout)
                } else {
                    GatewayError::Upstream(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        Ok(AgentReply {
            status,
            body: body.to_vec(),
        })
    }
}
