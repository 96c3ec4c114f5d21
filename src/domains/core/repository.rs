use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::DomainResult;

/// Trait for finding container-scoped entities by their row id.
///
/// Every entity in this crate lives inside a container; lookups always
/// carry the container id so one study can never read another's rows.
#[async_trait]
pub trait FindById<T>: Send + Sync {
    /// Find an entity by ID
    async fn find_by_id(&self, container_id: Uuid, row_id: i64) -> DomainResult<T>;
}
