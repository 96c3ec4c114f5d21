use async_trait::async_trait;
use log::debug;
use sqlx::{query, query_as, query_scalar, SqlitePool};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::repository::FindById;
use crate::domains::qcstate::types::{NewQCState, QCState, QCStateRow};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::Validate;

/// Trait defining QC state repository operations
#[async_trait]
pub trait QCStateRepository: FindById<QCState> + Send + Sync {
    async fn create(
        &self,
        container_id: Uuid,
        new_state: &NewQCState,
        auth: &AuthContext,
    ) -> DomainResult<QCState>;

    /// All QC states for a container, ordered by label.
    async fn find_for_container(&self, container_id: Uuid) -> DomainResult<Vec<QCState>>;

    async fn delete(&self, container_id: Uuid, row_id: i64, auth: &AuthContext)
        -> DomainResult<()>;
}

/// SQLite implementation for QCStateRepository
#[derive(Clone)]
pub struct SqliteQCStateRepository {
    pool: SqlitePool,
}

impl SqliteQCStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FindById<QCState> for SqliteQCStateRepository {
    async fn find_by_id(&self, container_id: Uuid, row_id: i64) -> DomainResult<QCState> {
        let row = query_as::<_, QCStateRow>(
            "SELECT * FROM qc_state WHERE container_id = ? AND row_id = ?",
        )
        .bind(container_id.to_string())
        .bind(row_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("QCState", row_id))?;

        row.into_entity()
    }
}

#[async_trait]
impl QCStateRepository for SqliteQCStateRepository {
    async fn create(
        &self,
        container_id: Uuid,
        new_state: &NewQCState,
        _auth: &AuthContext,
    ) -> DomainResult<QCState> {
        new_state.validate()?;

        let duplicate: Option<i64> = query_scalar(
            "SELECT row_id FROM qc_state WHERE container_id = ? AND label = ?",
        )
        .bind(container_id.to_string())
        .bind(&new_state.label)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        if duplicate.is_some() {
            return Err(DomainError::Validation(ValidationError::unique("label")));
        }

        let result = query(
            "INSERT INTO qc_state (container_id, label, description, public_data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(container_id.to_string())
        .bind(&new_state.label)
        .bind(&new_state.description)
        .bind(new_state.public_data as i64)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        debug!("created qc state '{}' in {}", new_state.label, container_id);
        self.find_by_id(container_id, result.last_insert_rowid()).await
    }

    async fn find_for_container(&self, container_id: Uuid) -> DomainResult<Vec<QCState>> {
        let rows = query_as::<_, QCStateRow>(
            "SELECT * FROM qc_state WHERE container_id = ? ORDER BY label",
        )
        .bind(container_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(QCStateRow::into_entity).collect()
    }

    async fn delete(
        &self,
        container_id: Uuid,
        row_id: i64,
        _auth: &AuthContext,
    ) -> DomainResult<()> {
        let result = query("DELETE FROM qc_state WHERE container_id = ? AND row_id = ?")
            .bind(container_id.to_string())
            .bind(row_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("QCState", row_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthContext, UserRole};
    use crate::db::init_memory_pool;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    #[tokio::test]
    async fn test_create_list_and_duplicate_label() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteQCStateRepository::new(pool);
        let container = Uuid::new_v4();
        let auth = admin();

        let approved = repo
            .create(
                container,
                &NewQCState {
                    label: "Approved".to_string(),
                    description: None,
                    public_data: true,
                },
                &auth,
            )
            .await
            .unwrap();
        assert!(approved.public_data);

        let dup = repo
            .create(
                container,
                &NewQCState {
                    label: "Approved".to_string(),
                    description: None,
                    public_data: false,
                },
                &auth,
            )
            .await;
        assert!(dup.is_err());

        repo.create(
            container,
            &NewQCState {
                label: "Pending".to_string(),
                description: Some("awaiting review".to_string()),
                public_data: false,
            },
            &auth,
        )
        .await
        .unwrap();

        let states = repo.find_for_container(container).await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].label, "Approved");

        // Other containers see nothing
        assert!(repo.find_for_container(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
