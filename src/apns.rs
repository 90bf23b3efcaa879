//! Push delivery through Apple Push Notification service.

use std::{fmt, path::Path, str::FromStr};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::notifications::Notification;
use crate::registration::ApnsToken;

const PRODUCTION_HOST: &str = "https://api.push.apple.com";
const DEVELOPMENT_HOST: &str = "https://api.sandbox.push.apple.com";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("apns request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("apns rejected push ({status}): {reason}")]
    Rejected { status: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    /// Silent push; the app builds the alert from the embedded event.
    Background,
    Alert,
}

impl PushType {
    fn as_str(self) -> &'static str {
        match self {
            PushType::Background => "background",
            PushType::Alert => "alert",
        }
    }
}

/// A single push request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub id: Uuid,
    pub token: ApnsToken,
    pub payload: Vec<u8>,
    pub push_type: PushType,
}

impl Push {
    pub fn mention(n: &Notification) -> Self {
        Self {
            id: n.uuid,
            token: n.token.clone(),
            payload: n.payload.clone(),
            push_type: PushType::Background,
        }
    }

    pub fn follow_change(token: ApnsToken, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            payload,
            push_type: PushType::Alert,
        }
    }
}

/// Fire-and-forget delivery; no receipt is reported back.
#[async_trait]
pub trait PushSender: Send + Sync + 'static {
    async fn send(&self, push: &Push) -> Result<(), PushError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApnsEnvironment {
    Production,
    Development,
}

impl FromStr for ApnsEnvironment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" => Ok(Self::Production),
            "development" => Ok(Self::Development),
            other => Err(anyhow!("unknown APNs environment {other:?}")),
        }
    }
}

impl fmt::Display for ApnsEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
        })
    }
}

/// HTTP/2 APNs client authenticated with a client certificate.
pub struct ApnsClient {
    client: reqwest::Client,
    host: String,
    topic: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    reason: Option<String>,
}

impl ApnsClient {
    /// Build a client from a PEM file holding the certificate and its key.
    pub fn from_pem_file(path: &Path, topic: &str, env: ApnsEnvironment) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading APNs certificate {}", path.display()))?;
        let identity = reqwest::Identity::from_pem(&pem).context("parsing APNs certificate")?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .build()?;
        let host = match env {
            ApnsEnvironment::Production => PRODUCTION_HOST,
            ApnsEnvironment::Development => DEVELOPMENT_HOST,
        };
        Ok(Self {
            client,
            host: host.to_string(),
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl PushSender for ApnsClient {
    async fn send(&self, push: &Push) -> Result<(), PushError> {
        let url = format!("{}/3/device/{}", self.host, push.token);
        let resp = self
            .client
            .post(url)
            .header("apns-topic", &self.topic)
            .header("apns-push-type", push.push_type.as_str())
            .header("apns-priority", "5")
            .header("apns-id", push.id.to_string())
            .body(push.payload.clone())
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            debug!(uuid = %push.id, status = status.as_u16(), host = %self.host, "sent push");
            return Ok(());
        }
        let reason = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.reason)
            .unwrap_or_else(|| "unknown".into());
        Err(PushError::Rejected {
            status: status.as_u16(),
            reason,
        })
    }
}

/// Logs pushes instead of sending them; used when APNs is not configured.
pub struct LogSender;

#[async_trait]
impl PushSender for LogSender {
    async fn send(&self, push: &Push) -> Result<(), PushError> {
        info!(
            uuid = %push.id,
            token = %push.token,
            push_type = push.push_type.as_str(),
            bytes = push.payload.len(),
            "push not sent, APNs is not configured"
        );
        Ok(())
    }
}
