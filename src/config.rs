//! Runtime settings, read from the environment (`.env` is loaded by the
//! binary before this runs).

use anyhow::{bail, Context};
use std::{collections::HashMap, num::NonZeroU32, str::FromStr, time::Duration};
use url::Url;

use crate::engine::PacingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => bail!("STORAGE_BACKEND must be 'postgres' or 'memory', got '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub skip_migrations: bool,
    pub debug_mode: bool,
    pub allowed_origins: Vec<String>,
    /// Bearer token -> owner user id.
    pub api_tokens: HashMap<String, i64>,
    pub api_rate_per_second: NonZeroU32,
    pub join_gateway_url: Url,
    pub join_gateway_token: Option<String>,
    pub join_timeout: Duration,
    pub pacing: PacingConfig,
    pub auto_resume_flood_wait: bool,
    pub auto_resume_poll: Duration,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// `token:user_id,token:user_id`
pub fn parse_api_tokens(raw: &str) -> anyhow::Result<HashMap<String, i64>> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (token, user) = entry
            .rsplit_once(':')
            .with_context(|| format!("API_TOKENS entry '{}' is not token:user_id", entry))?;
        let token = token.trim();
        if token.is_empty() {
            bail!("API_TOKENS contains an empty token");
        }
        let user_id: i64 = user
            .trim()
            .parse()
            .with_context(|| format!("API_TOKENS user id '{}' is not a number", user))?;
        if tokens.insert(token.to_string(), user_id).is_some() {
            bail!("API_TOKENS lists a token more than once");
        }
    }
    Ok(tokens)
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be a non-negative integer", key)),
                None => Ok(default),
            }
        };

        let storage = match get("STORAGE_BACKEND") {
            Some(v) => v.parse()?,
            None => StorageBackend::Postgres,
        };

        let port = match get("PORT") {
            Some(v) => v.trim().parse().context("PORT must be a valid number")?,
            None => 3001,
        };

        let rate = number("API_RATE_PER_SECOND", 10)?;
        let api_rate_per_second = u32::try_from(rate)
            .ok()
            .and_then(NonZeroU32::new)
            .context("API_RATE_PER_SECOND must be between 1 and 4294967295")?;

        let join_gateway_url = get("JOIN_GATEWAY_URL").context("JOIN_GATEWAY_URL must be set")?;
        let join_gateway_url = Url::parse(join_gateway_url.trim())
            .with_context(|| format!("JOIN_GATEWAY_URL '{}' is not a valid URL", join_gateway_url))?;

        let jitter = match get("INTERVAL_JITTER") {
            Some(v) => v
                .trim()
                .parse::<f64>()
                .context("INTERVAL_JITTER must be a number")?,
            None => 0.2,
        };

        let settings = Settings {
            storage,
            database_url: get("DATABASE_URL"),
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            skip_migrations: get("SKIP_MIGRATIONS").map_or(false, |v| parse_flag(&v)),
            debug_mode: get("DEBUG_MODE").map_or(false, |v| parse_flag(&v)),
            allowed_origins: get("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            api_tokens: parse_api_tokens(&get("API_TOKENS").unwrap_or_default())?,
            api_rate_per_second,
            join_gateway_url,
            join_gateway_token: get("JOIN_GATEWAY_TOKEN"),
            join_timeout: Duration::from_secs(number("JOIN_TIMEOUT_SECS", 30)?),
            pacing: PacingConfig {
                safe: Duration::from_secs(number("SAFE_INTERVAL_SECS", 600)?),
                aggressive: Duration::from_secs(number("AGGRESSIVE_INTERVAL_SECS", 120)?),
                jitter,
            },
            auto_resume_flood_wait: get("AUTO_RESUME_FLOOD_WAIT").map_or(false, |v| parse_flag(&v)),
            auto_resume_poll: Duration::from_secs(number("AUTO_RESUME_POLL_SECS", 30)?),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage == StorageBackend::Postgres && self.database_url.is_none() {
            bail!("DATABASE_URL must be set when STORAGE_BACKEND=postgres");
        }
        if self.api_tokens.is_empty() {
            bail!("API_TOKENS must list at least one token:user_id pair");
        }
        if !(0.0..1.0).contains(&self.pacing.jitter) {
            bail!("INTERVAL_JITTER must be in [0, 1), got {}", self.pacing.jitter);
        }
        if self.join_timeout.is_zero() {
            bail!("JOIN_TIMEOUT_SECS must be greater than zero");
        }
        if self.auto_resume_flood_wait && self.auto_resume_poll.is_zero() {
            bail!("AUTO_RESUME_POLL_SECS must be greater than zero");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
