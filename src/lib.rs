//! Resumable, rate-limited join-chat sequencer.
//!
//! Operators keep named groups of Telegram chats and start per-account
//! tasks that join them one by one, pausing for pacing intervals and
//! platform flood waits. Progress is persisted after every attempt so a
//! task can be paused, continued or retried without re-joining anything.

pub mod config;
pub mod database;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod join_client;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;

use std::sync::Arc;

pub use config::Settings;
pub use errors::{AppError, Result};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<engine::SubscriptionEngine>,
    pub groups: Arc<services::ChatGroupService>,
    pub auth: Arc<middleware::ApiAuth>,
}
