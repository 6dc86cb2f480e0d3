use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::AppResult;

use super::{NewResource, Resource, ResourceDirectory, ResourceKind};

/// In-process directory. One write lock per update keeps each bulk reassignment atomic.
#[derive(Default)]
pub struct MemoryDirectory {
    tables: RwLock<HashMap<ResourceKind, Vec<Resource>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self { Self::default() }

    pub fn owned_by(&self, kind: ResourceKind, owner: &str) -> Vec<Resource> {
        self.tables
            .read()
            .get(&kind)
            .map(|rows| rows.iter().filter(|r| r.owner_identity_id == owner).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResourceDirectory for MemoryDirectory {
    async fn insert(&self, new: NewResource) -> AppResult<Resource> {
        let res = new.into_resource();
        self.tables.write().entry(res.kind).or_default().push(res.clone());
        Ok(res)
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> AppResult<Option<Resource>> {
        Ok(self.tables.read().get(&kind).and_then(|rows| rows.iter().find(|r| r.id == id).cloned()))
    }

    async fn count_owned(&self, kind: ResourceKind, owner_identity_id: &str) -> AppResult<u64> {
        Ok(self
            .tables
            .read()
            .get(&kind)
            .map(|rows| rows.iter().filter(|r| r.owner_identity_id == owner_identity_id).count() as u64)
            .unwrap_or(0))
    }

    async fn reassign_owner(&self, kind: ResourceKind, from: &str, to: &str) -> AppResult<u64> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(&kind) else { return Ok(0); };
        let mut moved = 0u64;
        for row in rows.iter_mut().filter(|r| r.owner_identity_id == from) {
            row.owner_identity_id = to.to_string();
            moved += 1;
        }
        Ok(moved)
    }
}
