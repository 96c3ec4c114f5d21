use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::cohort::types::{Cohort, CohortRow, NewCohort, UpdateCohort};
use crate::domains::core::repository::FindById;
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::Validate;

/// Trait defining cohort repository operations
#[async_trait]
pub trait CohortRepository: FindById<Cohort> + Send + Sync {
    async fn create(
        &self,
        container_id: Uuid,
        new_cohort: &NewCohort,
        auth: &AuthContext,
    ) -> DomainResult<Cohort>;

    async fn create_with_tx<'t>(
        &self,
        container_id: Uuid,
        new_cohort: &NewCohort,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Cohort>;

    /// Find the cohort with the given label, creating it if absent.
    async fn ensure_with_tx<'t>(
        &self,
        container_id: Uuid,
        label: &str,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Cohort>;

    async fn find_by_label(&self, container_id: Uuid, label: &str)
        -> DomainResult<Option<Cohort>>;

    /// All cohorts for a container, ordered by label.
    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<Cohort>>;

    /// Label-to-row-id map read inside the reassignment transaction.
    async fn labels_to_ids_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<HashMap<String, i64>>;

    async fn update(
        &self,
        container_id: Uuid,
        row_id: i64,
        update: &UpdateCohort,
        auth: &AuthContext,
    ) -> DomainResult<Cohort>;

    async fn delete(&self, container_id: Uuid, row_id: i64, auth: &AuthContext)
        -> DomainResult<()>;

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}

/// SQLite implementation for CohortRepository
#[derive(Clone)]
pub struct SqliteCohortRepository {
    pool: SqlitePool,
}

impl SqliteCohortRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_by_id_with_tx<'t>(
        &self,
        container_id: Uuid,
        row_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Cohort> {
        let row = query_as::<_, CohortRow>(
            "SELECT * FROM cohort WHERE container_id = ? AND row_id = ?",
        )
        .bind(container_id.to_string())
        .bind(row_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("Cohort", row_id))?;

        row.into_entity()
    }
}

#[async_trait]
impl FindById<Cohort> for SqliteCohortRepository {
    async fn find_by_id(&self, container_id: Uuid, row_id: i64) -> DomainResult<Cohort> {
        let row = query_as::<_, CohortRow>(
            "SELECT * FROM cohort WHERE container_id = ? AND row_id = ?",
        )
        .bind(container_id.to_string())
        .bind(row_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("Cohort", row_id))?;

        row.into_entity()
    }
}

#[async_trait]
impl CohortRepository for SqliteCohortRepository {
    async fn create(
        &self,
        container_id: Uuid,
        new_cohort: &NewCohort,
        auth: &AuthContext,
    ) -> DomainResult<Cohort> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let cohort = self.create_with_tx(container_id, new_cohort, auth, &mut tx).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(cohort)
    }

    async fn create_with_tx<'t>(
        &self,
        container_id: Uuid,
        new_cohort: &NewCohort,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Cohort> {
        new_cohort.validate()?;

        // Labels are unique per container; fail fast on duplicates
        let duplicate: Option<i64> = query_scalar(
            "SELECT row_id FROM cohort WHERE container_id = ? AND label = ?",
        )
        .bind(container_id.to_string())
        .bind(&new_cohort.label)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        if duplicate.is_some() {
            return Err(DomainError::Validation(ValidationError::unique("label")));
        }

        let now = Utc::now().to_rfc3339();
        let result = query(
            "INSERT INTO cohort
             (container_id, label, enrolled, subject_count, description, created_at, updated_at, created_by_user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(container_id.to_string())
        .bind(&new_cohort.label)
        .bind(new_cohort.enrolled as i64)
        .bind(new_cohort.subject_count)
        .bind(&new_cohort.description)
        .bind(&now)
        .bind(&now)
        .bind(auth.user_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        debug!("created cohort '{}' in {}", new_cohort.label, container_id);
        self.find_by_id_with_tx(container_id, result.last_insert_rowid(), tx).await
    }

    async fn ensure_with_tx<'t>(
        &self,
        container_id: Uuid,
        label: &str,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Cohort> {
        let existing = query_as::<_, CohortRow>(
            "SELECT * FROM cohort WHERE container_id = ? AND label = ?",
        )
        .bind(container_id.to_string())
        .bind(label)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        match existing {
            Some(row) => row.into_entity(),
            None => {
                self.create_with_tx(container_id, &NewCohort::with_label(label), auth, tx)
                    .await
            }
        }
    }

    async fn find_by_label(
        &self,
        container_id: Uuid,
        label: &str,
    ) -> DomainResult<Option<Cohort>> {
        let row = query_as::<_, CohortRow>(
            "SELECT * FROM cohort WHERE container_id = ? AND label = ?",
        )
        .bind(container_id.to_string())
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(CohortRow::into_entity).transpose()
    }

    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<Cohort>> {
        let rows = query_as::<_, CohortRow>(
            "SELECT * FROM cohort WHERE container_id = ? ORDER BY label",
        )
        .bind(container_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(CohortRow::into_entity).collect()
    }

    async fn labels_to_ids_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            query_as("SELECT label, row_id FROM cohort WHERE container_id = ?")
                .bind(container_id.to_string())
                .fetch_all(&mut **tx)
                .await
                .map_err(DbError::from)?;

        Ok(rows.into_iter().collect())
    }

    async fn update(
        &self,
        container_id: Uuid,
        row_id: i64,
        update: &UpdateCohort,
        auth: &AuthContext,
    ) -> DomainResult<Cohort> {
        update.validate()?;
        let current = self.find_by_id(container_id, row_id).await?;

        if let Some(label) = &update.label {
            if label != &current.label {
                let clash = self.find_by_label(container_id, label).await?;
                if clash.is_some() {
                    return Err(DomainError::Validation(ValidationError::unique("label")));
                }
            }
        }

        query(
            "UPDATE cohort
             SET label = ?, enrolled = ?, subject_count = ?, description = ?,
                 updated_at = ?, updated_by_user_id = ?
             WHERE container_id = ? AND row_id = ?",
        )
        .bind(update.label.as_ref().unwrap_or(&current.label))
        .bind(update.enrolled.unwrap_or(current.enrolled) as i64)
        .bind(update.subject_count.or(current.subject_count))
        .bind(update.description.as_ref().or(current.description.as_ref()))
        .bind(Utc::now().to_rfc3339())
        .bind(auth.user_id.to_string())
        .bind(container_id.to_string())
        .bind(row_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(container_id, row_id).await
    }

    async fn delete(
        &self,
        container_id: Uuid,
        row_id: i64,
        _auth: &AuthContext,
    ) -> DomainResult<()> {
        let result = query("DELETE FROM cohort WHERE container_id = ? AND row_id = ?")
            .bind(container_id.to_string())
            .bind(row_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("Cohort", row_id));
        }
        Ok(())
    }

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query("DELETE FROM cohort WHERE container_id = ?")
            .bind(container_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }
}
