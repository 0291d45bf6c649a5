//! Owner-scoped CRUD over chat groups.
//!
//! Edits only touch the stored group; tasks already started keep the
//! snapshot they copied at creation.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Clock;
use crate::errors::{AppError, Result};
use crate::models::{parse_chat_targets, ChatGroup, ChatTarget, UpdateGroupRequest};
use crate::store::{GroupDeletion, GroupStore};

#[derive(Clone)]
pub struct ChatGroupService {
    store: Arc<dyn GroupStore>,
    clock: Arc<dyn Clock>,
}

fn clean_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("group name must not be blank".to_string()));
    }
    Ok(name.to_string())
}

fn clean_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

impl ChatGroupService {
    pub fn new(store: Arc<dyn GroupStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create(
        &self,
        owner_user_id: i64,
        name: &str,
        description: Option<String>,
        links: &[String],
    ) -> Result<ChatGroup> {
        let name = clean_name(name)?;
        let chat_targets = parse_chat_targets(links)?;
        if chat_targets.is_empty() {
            return Err(AppError::Validation(
                "a group needs at least one chat target".to_string(),
            ));
        }

        let now = self.clock.now();
        let group = ChatGroup {
            group_id: Uuid::new_v4(),
            owner_user_id,
            name,
            description: clean_description(description),
            chat_targets,
            created_at: now,
            updated_at: now,
        };
        let group = self.store.insert_group(&group).await?;
        info!(
            group_id = %group.group_id,
            owner_user_id,
            targets = group.chat_targets.len(),
            "Chat group created"
        );
        Ok(group)
    }

    pub async fn list(&self, owner_user_id: i64) -> Result<Vec<ChatGroup>> {
        self.store.list_groups(owner_user_id).await
    }

    /// Foreign groups are reported as missing.
    pub async fn get(&self, owner_user_id: i64, group_id: Uuid) -> Result<ChatGroup> {
        self.store
            .get_group(group_id)
            .await?
            .filter(|g| g.owner_user_id == owner_user_id)
            .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))
    }

    pub async fn update(
        &self,
        owner_user_id: i64,
        group_id: Uuid,
        request: UpdateGroupRequest,
    ) -> Result<ChatGroup> {
        let name = request.name.as_deref().map(clean_name).transpose()?;
        let description = request.description.map(|d| clean_description(Some(d)));
        self.edit(owner_user_id, group_id, |group| {
            if let Some(name) = &name {
                group.name = name.clone();
            }
            if let Some(description) = &description {
                group.description = description.clone();
            }
            Ok(())
        })
        .await
    }

    /// Append targets not already in the group, keeping order.
    pub async fn add_targets(
        &self,
        owner_user_id: i64,
        group_id: Uuid,
        links: &[String],
    ) -> Result<ChatGroup> {
        let additions = parse_chat_targets(links)?;
        self.edit(owner_user_id, group_id, |group| {
            for target in &additions {
                if !group.chat_targets.contains(target) {
                    group.chat_targets.push(target.clone());
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_targets(
        &self,
        owner_user_id: i64,
        group_id: Uuid,
        links: &[String],
    ) -> Result<ChatGroup> {
        let removals: Vec<ChatTarget> = parse_chat_targets(links)?;
        self.edit(owner_user_id, group_id, |group| {
            group.chat_targets.retain(|t| !removals.contains(t));
            if group.chat_targets.is_empty() {
                return Err(AppError::Validation(
                    "cannot remove every target from a group; delete it instead".to_string(),
                ));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, owner_user_id: i64, group_id: Uuid) -> Result<()> {
        // Ownership check first so foreign groups stay invisible.
        self.get(owner_user_id, group_id).await?;
        match self.store.delete_group(group_id).await? {
            GroupDeletion::Deleted => {
                info!(%group_id, owner_user_id, "Chat group deleted");
                Ok(())
            }
            GroupDeletion::NotFound => Err(AppError::NotFound(format!("group {}", group_id))),
            GroupDeletion::Referenced => Err(AppError::Conflict(format!(
                "group {} is used by an active subscription task",
                group_id
            ))),
        }
    }

    /// Apply `change` to the stored group in one store step. Foreign groups
    /// are reported as missing.
    async fn edit<F>(&self, owner_user_id: i64, group_id: Uuid, change: F) -> Result<ChatGroup>
    where
        F: Fn(&mut ChatGroup) -> Result<()> + Send + Sync,
    {
        let now = self.clock.now();
        let group = self
            .store
            .modify_group(group_id, &|group: &mut ChatGroup| {
                if group.owner_user_id != owner_user_id {
                    return Err(AppError::NotFound(format!("group {}", group_id)));
                }
                change(group)?;
                group.updated_at = now;
                Ok(())
            })
            .await?;
        debug!(group_id = %group.group_id, targets = group.chat_targets.len(), "Chat group updated");
        Ok(group)
    }
}
