// Re-export all model types from submodules
mod chat_groups;
mod common;
mod subscription_tasks;

pub use chat_groups::*;
pub use common::*;
pub use subscription_tasks::*;
