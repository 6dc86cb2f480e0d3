//! Ownership migration: re-parent everything a guest identity created onto the
//! authenticated identity that supersedes it.
//!
//! Each resource kind is moved with one conditional bulk update scoped to the exact prior
//! owner id. No lock is taken: a repeated or racing migration matches zero rows, so retries
//! after a partial failure are safe and a second run reports 0.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::directory::{ResourceDirectory, ResourceKind};
use crate::error::{AppError, AppResult};

pub type MigratedCount = u64;

#[async_trait]
pub trait OwnershipMigrator: Send + Sync {
    async fn migrate(&self, from: Option<&str>, to: &str) -> AppResult<MigratedCount>;
}

pub struct MigrationEngine {
    directory: Arc<dyn ResourceDirectory>,
}

impl MigrationEngine {
    pub fn new(directory: Arc<dyn ResourceDirectory>) -> Self { Self { directory } }
}

#[async_trait]
impl OwnershipMigrator for MigrationEngine {
    async fn migrate(&self, from: Option<&str>, to: &str) -> AppResult<MigratedCount> {
        let Some(from) = from.filter(|f| !f.is_empty()) else { return Ok(0); };
        if from == to {
            return Ok(0);
        }

        let mut migrated: MigratedCount = 0;
        let mut failed: Vec<(ResourceKind, AppError)> = Vec::new();
        for kind in ResourceKind::ALL {
            match self.directory.reassign_owner(kind, from, to).await {
                Ok(n) => migrated += n,
                Err(e) => failed.push((kind, e)),
            }
        }

        if failed.is_empty() {
            info!(target: "migration", from, to, migrated, "ownership migrated");
            return Ok(migrated);
        }
        let message = failed
            .iter()
            .map(|(k, e)| format!("{}: {}", k.table(), e))
            .collect::<Vec<_>>()
            .join("; ");
        warn!(target: "migration", from, to, migrated, failures = %message, "ownership migration incomplete");
        Err(AppError::MigrationPartialFailure {
            migrated,
            failed_kinds: failed.into_iter().map(|(k, _)| k).collect(),
            message,
        })
    }
}
