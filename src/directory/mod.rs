//! Resource directory: where conversations and messages live, keyed by owner identity.
//!
//! The directory is an external collaborator. This crate only needs three things from it:
//! create a resource for an owner, count what an owner has, and move everything an owner
//! has to another owner with a single conditional bulk update
//! (`UPDATE <table> SET owner_id = :to WHERE owner_id = :from`).
//! The `WHERE owner_id = :from` predicate is what makes a repeated or racing migration a
//! harmless no-op, so backends must never fall back to an unconditional update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

mod memory;
mod rest;

pub use memory::MemoryDirectory;
pub use rest::RestDirectory;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Conversation,
    Message,
}

impl ResourceKind {
    /// Every kind an identity upgrade must re-parent.
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Conversation, ResourceKind::Message];

    pub fn table(&self) -> &'static str {
        match self {
            ResourceKind::Conversation => "conversations",
            ResourceKind::Message => "human_messages",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub owner_identity_id: String,
    /// Conversation a message belongs to; `None` for conversations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewResource {
    pub kind: ResourceKind,
    pub owner_identity_id: String,
    pub parent_id: Option<String>,
    pub text: Option<String>,
}

impl NewResource {
    pub fn conversation<S: Into<String>>(owner: S) -> Self {
        Self { kind: ResourceKind::Conversation, owner_identity_id: owner.into(), parent_id: None, text: None }
    }

    pub fn message<S: Into<String>>(owner: S, conversation_id: S, text: S) -> Self {
        Self {
            kind: ResourceKind::Message,
            owner_identity_id: owner.into(),
            parent_id: Some(conversation_id.into()),
            text: Some(text.into()),
        }
    }

    pub(crate) fn into_resource(self) -> Resource {
        Resource {
            id: uuid::Uuid::new_v4().to_string(),
            kind: self.kind,
            owner_identity_id: self.owner_identity_id,
            parent_id: self.parent_id,
            text: self.text,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn insert(&self, new: NewResource) -> AppResult<Resource>;
    async fn fetch(&self, kind: ResourceKind, id: &str) -> AppResult<Option<Resource>>;
    async fn count_owned(&self, kind: ResourceKind, owner_identity_id: &str) -> AppResult<u64>;
    /// Move every `kind` resource owned by `from` to `to`; returns the number of rows moved.
    /// Atomic per call.
    async fn reassign_owner(&self, kind: ResourceKind, from: &str, to: &str) -> AppResult<u64>;
}
