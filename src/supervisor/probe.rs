//! Bridge-server session probing.
//!
//! A probe asks the bridge server which sessions it is currently serving.
//! Any failure (connection refused, timeout, non-200 status, unexpected
//! body) means the server is treated as down; probing never errors.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::wait::{WaitOutcome, Waiter};

/// Point-in-time occupancy of a bridge server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionProbe {
    pub server_up: bool,
    pub active_sessions: Vec<String>,
}

impl SessionProbe {
    pub fn down() -> Self {
        Self::default()
    }

    pub fn up(active_sessions: Vec<String>) -> Self {
        Self {
            server_up: true,
            active_sessions,
        }
    }

    /// Whether a server is up and already serving someone else.
    pub fn has_sessions(&self) -> bool {
        self.server_up && !self.active_sessions.is_empty()
    }
}

/// Queries a bridge server's session endpoint.
#[async_trait]
pub trait SessionProber: Send + Sync {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> SessionProbe;
}

/// Probes over HTTP with `reqwest`.
pub struct HttpSessionProber {
    client: reqwest::Client,
    session_path: String,
}

impl HttpSessionProber {
    pub fn new(session_path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            session_path: session_path.into(),
        }
    }

    pub fn endpoint(&self, host: &str, port: u16) -> String {
        let path = self.session_path.trim_start_matches('/');
        format!("http://{host}:{port}/{path}")
    }

    async fn fetch(&self, url: &str) -> Result<Option<Vec<String>>, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            debug!("Session probe {} returned {}", url, response.status());
            return Ok(None);
        }
        let body: Value = response.json().await?;
        Ok(parse_sessions(&body))
    }
}

#[async_trait]
impl SessionProber for HttpSessionProber {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> SessionProbe {
        let url = self.endpoint(host, port);
        match Waiter::new(timeout).within(self.fetch(&url)).await {
            WaitOutcome::Ready(Ok(Some(sessions))) => {
                debug!("Bridge server on {} has {} sessions", port, sessions.len());
                SessionProbe::up(sessions)
            }
            WaitOutcome::Ready(Ok(None)) => SessionProbe::down(),
            WaitOutcome::Ready(Err(e)) => {
                debug!("Session probe {} failed: {}", url, e);
                SessionProbe::down()
            }
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                debug!("Session probe {} timed out after {:?}", url, timeout);
                SessionProbe::down()
            }
        }
    }
}

/// Extracts session ids from the `value` array of a sessions response.
///
/// Returns `None` when `value` is missing or not an array. Descriptors that
/// carry no `id` or `sessionId` are identified by their JSON text.
pub fn parse_sessions(body: &Value) -> Option<Vec<String>> {
    let descriptors = body.get("value")?.as_array()?;
    let ids = descriptors
        .iter()
        .map(|descriptor| {
            ["id", "sessionId"]
                .iter()
                .find_map(|key| descriptor.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .or_else(|| descriptor.as_str().map(str::to_string))
                .unwrap_or_else(|| descriptor.to_string())
        })
        .collect();
    Some(ids)
}
