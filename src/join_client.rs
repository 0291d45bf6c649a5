use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::models::ChatTarget;

/// What the platform said about one join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    /// Account is rate-limited; nothing may be attempted before the duration
    /// has fully elapsed.
    FloodWait(Duration),
    /// Invalid or expired link, banned account and the like. Not retried.
    PermanentFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("join gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("join gateway URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("join gateway returned HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("unexpected join gateway response: {0}")]
    InvalidResponse(String),
}

/// Capability to make a Telegram account join a chat.
#[async_trait]
pub trait JoinClient: Send + Sync {
    async fn attempt_join(
        &self,
        account_id: i64,
        target: &ChatTarget,
    ) -> Result<JoinOutcome, JoinError>;
}

#[derive(Debug, Serialize)]
struct JoinRequest {
    target: String,
}

#[derive(Debug, Deserialize)]
struct JoinReply {
    status: String,
    seconds: Option<u64>,
    retry_after: Option<u64>,
    reason: Option<String>,
}

impl JoinReply {
    fn wait_seconds(&self) -> Option<u64> {
        self.seconds.or(self.retry_after)
    }

    fn into_outcome(self) -> Result<JoinOutcome, JoinError> {
        match self.status.as_str() {
            "joined" => Ok(JoinOutcome::Joined),
            "already_member" => Ok(JoinOutcome::AlreadyMember),
            "flood_wait" => match self.wait_seconds() {
                Some(seconds) => Ok(JoinOutcome::FloodWait(Duration::from_secs(seconds))),
                None => Err(JoinError::InvalidResponse(
                    "flood_wait without a duration".to_string(),
                )),
            },
            "failed" => Ok(JoinOutcome::PermanentFailure(
                self.reason.unwrap_or_else(|| "join rejected".to_string()),
            )),
            other => Err(JoinError::InvalidResponse(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

/// Join client backed by the session gateway that owns the MTProto sessions.
///
/// `POST {base}/accounts/{account_id}/join` with `{"target": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpJoinClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpJoinClient {
    pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> Result<Self, JoinError> {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }
}

fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl JoinClient for HttpJoinClient {
    async fn attempt_join(
        &self,
        account_id: i64,
        target: &ChatTarget,
    ) -> Result<JoinOutcome, JoinError> {
        let url = self
            .base_url
            .join(&format!("accounts/{}/join", account_id))?;

        let mut request = self.client.post(url).json(&JoinRequest {
            target: target.to_string(),
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_wait = retry_after_header(response.headers());
            let body_wait = response
                .json::<JoinReply>()
                .await
                .ok()
                .and_then(|reply| reply.wait_seconds());
            return match body_wait.or(header_wait) {
                Some(seconds) => {
                    warn!(account_id, %target, seconds, "Join gateway reported flood wait");
                    Ok(JoinOutcome::FloodWait(Duration::from_secs(seconds)))
                }
                None => Err(JoinError::InvalidResponse(
                    "429 without retry_after".to_string(),
                )),
            };
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JoinError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let reply: JoinReply = response.json().await?;
        debug!(account_id, %target, status = %reply.status, "Join gateway replied");
        reply.into_outcome()
    }
}
