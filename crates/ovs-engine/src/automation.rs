//! Automation worker client — the boundary that physically runs commands on
//! hosts. Specified at the interface only; the HTTP implementation talks to
//! the configured automation service.
//!
//! Credential handles travel as-is; the automation worker resolves them
//! against the broker just in time. Plaintext never passes through here.

use std::time::Duration;

use async_trait::async_trait;
use ovs_schemas::OvsError;
use serde_json::{json, Value};

#[async_trait]
pub trait AutomationClient: Send + Sync {
    /// Run a command payload against a host. `inputs` may carry
    /// `secret_handle` objects produced by the safety layer.
    async fn run_command(
        &self,
        host: &str,
        inputs: &Value,
        deadline: Duration,
    ) -> Result<Value, OvsError>;

    /// Service control (start/stop/restart) against a host.
    async fn control_service(
        &self,
        host: &str,
        service: &str,
        action: &str,
        inputs: &Value,
        deadline: Duration,
    ) -> Result<Value, OvsError>;
}

pub struct HttpAutomationClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAutomationClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, body: Value, deadline: Duration) -> Result<Value, OvsError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OvsError::timeout(format!("automation call to {path} timed out"))
                } else {
                    OvsError::transient(format!("automation call to {path} failed: {e}"))
                }
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(OvsError::transient(format!(
                "automation returned {status} for {path}"
            )));
        }
        if !status.is_success() {
            return Err(OvsError::internal(format!(
                "automation returned {status} for {path}"
            )));
        }

        resp.json()
            .await
            .map_err(|e| OvsError::transient(format!("automation body unreadable: {e}")))
    }
}

#[async_trait]
impl AutomationClient for HttpAutomationClient {
    async fn run_command(
        &self,
        host: &str,
        inputs: &Value,
        deadline: Duration,
    ) -> Result<Value, OvsError> {
        self.post(
            "/commands/run",
            json!({"host": host, "inputs": inputs}),
            deadline,
        )
        .await
    }

    async fn control_service(
        &self,
        host: &str,
        service: &str,
        action: &str,
        inputs: &Value,
        deadline: Duration,
    ) -> Result<Value, OvsError> {
        self.post(
            "/services/control",
            json!({"host": host, "service": service, "action": action, "inputs": inputs}),
            deadline,
        )
        .await
    }
}
