use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, str::FromStr};
use url::Url;

use crate::errors::AppError;

const TELEGRAM_HOSTS: &[&str] = &["t.me", "www.t.me", "telegram.me", "www.telegram.me", "telegram.dog"];

/// A destination an account can be asked to join.
///
/// Parsed from whatever the operator pasted (numeric id, `@username`,
/// `t.me` link or private invite link) and kept in canonical form so that
/// duplicates collapse and snapshots compare byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChatTarget {
    ChatId(i64),
    Username(String),
    InviteLink(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chat target '{input}': {reason}")]
pub struct InvalidChatTarget {
    pub input: String,
    pub reason: &'static str,
}

impl InvalidChatTarget {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

fn is_valid_username(name: &str) -> bool {
    (5..=32).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_invite_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl FromStr for ChatTarget {
    type Err = InvalidChatTarget;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(InvalidChatTarget::new(raw, "empty"));
        }

        if let Ok(id) = input.parse::<i64>() {
            if id == 0 {
                return Err(InvalidChatTarget::new(raw, "chat id cannot be zero"));
            }
            return Ok(ChatTarget::ChatId(id));
        }

        if let Some(name) = input.strip_prefix('@') {
            return if is_valid_username(name) {
                Ok(ChatTarget::Username(name.to_ascii_lowercase()))
            } else {
                Err(InvalidChatTarget::new(raw, "malformed username"))
            };
        }

        if is_valid_username(input) {
            return Ok(ChatTarget::Username(input.to_ascii_lowercase()));
        }

        let with_scheme = if input.starts_with("http://") || input.starts_with("https://") {
            input.to_string()
        } else {
            format!("https://{}", input)
        };
        let url = Url::parse(&with_scheme).map_err(|_| InvalidChatTarget::new(raw, "not a link"))?;

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !TELEGRAM_HOSTS.contains(&host.as_str()) {
            return Err(InvalidChatTarget::new(raw, "not a Telegram link"));
        }

        let mut segments = url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty());

        match segments.next() {
            Some(first) if first.starts_with('+') => {
                let hash = &first[1..];
                if is_valid_invite_hash(hash) {
                    Ok(ChatTarget::InviteLink(hash.to_string()))
                } else {
                    Err(InvalidChatTarget::new(raw, "malformed invite link"))
                }
            }
            Some("joinchat") => match segments.next() {
                Some(hash) if is_valid_invite_hash(hash) => Ok(ChatTarget::InviteLink(hash.to_string())),
                _ => Err(InvalidChatTarget::new(raw, "malformed invite link")),
            },
            Some(name) if is_valid_username(name) => Ok(ChatTarget::Username(name.to_ascii_lowercase())),
            _ => Err(InvalidChatTarget::new(raw, "link does not name a chat")),
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatTarget::ChatId(id) => write!(f, "{}", id),
            ChatTarget::Username(name) => write!(f, "@{}", name),
            ChatTarget::InviteLink(hash) => write!(f, "https://t.me/+{}", hash),
        }
    }
}

impl TryFrom<String> for ChatTarget {
    type Error = InvalidChatTarget;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatTarget> for String {
    fn from(target: ChatTarget) -> Self {
        target.to_string()
    }
}

/// Parse operator input into targets, keeping first-seen order and dropping
/// duplicates.
pub fn parse_chat_targets<S: AsRef<str>>(links: &[S]) -> Result<Vec<ChatTarget>, AppError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(links.len());
    for link in links {
        let target: ChatTarget = link
            .as_ref()
            .parse()
            .map_err(|e: InvalidChatTarget| AppError::Validation(e.to_string()))?;
        if seen.insert(target.clone()) {
            targets.push(target);
        }
    }
    Ok(targets)
}
