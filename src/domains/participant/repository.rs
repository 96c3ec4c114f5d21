use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use log::debug;
use rust_decimal::Decimal;
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::cohort::assignment::{
    ParticipantCohortUpdate, PerVisitCohortUpdate, StoredCohorts, UniformCohortUpdate,
};
use crate::domains::participant::types::{
    NewParticipant, Participant, ParticipantRow, ParticipantVisit, ParticipantVisitRow,
};
use crate::domains::visit::types::{participant_sequence_num, sequence_num_to_storage};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::validation::Validate;

/// Trait defining participant repository operations
#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    async fn create(
        &self,
        container_id: Uuid,
        new_participant: &NewParticipant,
        auth: &AuthContext,
    ) -> DomainResult<Participant>;

    async fn find_by_id(
        &self,
        container_id: Uuid,
        participant_id: &str,
    ) -> DomainResult<Participant>;

    /// All participants in the container, ordered by participant id.
    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<Participant>>;

    /// Participant ids currently assigned to the given cohort.
    async fn find_ids_by_cohort(
        &self,
        container_id: Uuid,
        cohort_id: i64,
    ) -> DomainResult<Vec<String>>;

    /// True when any participant or participant/visit row references the
    /// cohort.
    async fn cohort_in_use(&self, container_id: Uuid, cohort_id: i64) -> DomainResult<bool>;

    /// Insert any of the given participant ids not already present.
    async fn ensure_exist_with_tx<'t>(
        &self,
        container_id: Uuid,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    /// Stored initial/current cohort columns for every participant,
    /// keyed by participant id. Read inside the reassignment transaction.
    async fn cohort_assignments_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<HashMap<String, StoredCohorts>>;

    /// Batched application of participant-level cohort updates.
    async fn apply_cohort_updates_with_tx<'t>(
        &self,
        container_id: Uuid,
        updates: &[ParticipantCohortUpdate],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    /// Set one participant's cohort directly (manual assignment mode).
    async fn set_cohort_with_tx<'t>(
        &self,
        container_id: Uuid,
        participant_id: &str,
        cohort_id: Option<i64>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Null every participant's cohort columns.
    async fn clear_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}

/// SQLite implementation for ParticipantRepository
#[derive(Clone)]
pub struct SqliteParticipantRepository {
    pool: SqlitePool,
}

impl SqliteParticipantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParticipantRepository for SqliteParticipantRepository {
    async fn create(
        &self,
        container_id: Uuid,
        new_participant: &NewParticipant,
        _auth: &AuthContext,
    ) -> DomainResult<Participant> {
        new_participant.validate()?;
        let now = Utc::now().to_rfc3339();

        query(
            "INSERT INTO participant (container_id, participant_id, start_date, enrollment_site_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(container_id.to_string())
        .bind(&new_participant.participant_id)
        .bind(new_participant.start_date.map(|d| d.to_string()))
        .bind(new_participant.enrollment_site_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(container_id, &new_participant.participant_id).await
    }

    async fn find_by_id(
        &self,
        container_id: Uuid,
        participant_id: &str,
    ) -> DomainResult<Participant> {
        let row = query_as::<_, ParticipantRow>(
            "SELECT * FROM participant WHERE container_id = ? AND participant_id = ?",
        )
        .bind(container_id.to_string())
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("Participant", participant_id))?;

        row.into_entity()
    }

    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<Participant>> {
        let rows = query_as::<_, ParticipantRow>(
            "SELECT * FROM participant WHERE container_id = ? ORDER BY participant_id",
        )
        .bind(container_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(ParticipantRow::into_entity).collect()
    }

    async fn find_ids_by_cohort(
        &self,
        container_id: Uuid,
        cohort_id: i64,
    ) -> DomainResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT participant_id FROM participant
             WHERE container_id = ? AND current_cohort_id = ?
             ORDER BY participant_id",
        )
        .bind(container_id.to_string())
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(ids)
    }

    async fn cohort_in_use(&self, container_id: Uuid, cohort_id: i64) -> DomainResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT
                (SELECT COUNT(*) FROM participant
                  WHERE container_id = ?1
                    AND (initial_cohort_id = ?2 OR current_cohort_id = ?2))
              + (SELECT COUNT(*) FROM participant_visit
                  WHERE container_id = ?1 AND cohort_id = ?2)",
        )
        .bind(container_id.to_string())
        .bind(cohort_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(count > 0)
    }

    async fn ensure_exist_with_tx<'t>(
        &self,
        container_id: Uuid,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0u64;

        for participant_id in participant_ids {
            let result = query(
                "INSERT OR IGNORE INTO participant (container_id, participant_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(container_id.to_string())
            .bind(participant_id)
            .bind(&now)
            .bind(&now)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

            inserted += result.rows_affected();
        }

        if inserted > 0 {
            debug!("inserted {} new participant(s) in {}", inserted, container_id);
        }
        Ok(inserted)
    }

    async fn cohort_assignments_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<HashMap<String, StoredCohorts>> {
        let rows: Vec<(String, Option<i64>, Option<i64>)> = query_as(
            "SELECT participant_id, initial_cohort_id, current_cohort_id
             FROM participant WHERE container_id = ?",
        )
        .bind(container_id.to_string())
        .fetch_all(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(|(participant_id, initial_cohort_id, current_cohort_id)| {
                (
                    participant_id,
                    StoredCohorts {
                        initial_cohort_id,
                        current_cohort_id,
                    },
                )
            })
            .collect())
    }

    async fn apply_cohort_updates_with_tx<'t>(
        &self,
        container_id: Uuid,
        updates: &[ParticipantCohortUpdate],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let now = Utc::now().to_rfc3339();
        let mut affected = 0u64;

        for update in updates {
            let result = query(
                "UPDATE participant
                 SET initial_cohort_id = ?, current_cohort_id = ?, updated_at = ?
                 WHERE container_id = ? AND participant_id = ?",
            )
            .bind(update.initial_cohort_id)
            .bind(update.current_cohort_id)
            .bind(&now)
            .bind(container_id.to_string())
            .bind(&update.participant_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

            affected += result.rows_affected();
        }

        Ok(affected)
    }

    async fn set_cohort_with_tx<'t>(
        &self,
        container_id: Uuid,
        participant_id: &str,
        cohort_id: Option<i64>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();

        let result = query(
            "UPDATE participant
             SET initial_cohort_id = ?1, current_cohort_id = ?1, updated_at = ?2
             WHERE container_id = ?3 AND participant_id = ?4",
        )
        .bind(cohort_id)
        .bind(&now)
        .bind(container_id.to_string())
        .bind(participant_id)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("Participant", participant_id));
        }
        Ok(())
    }

    async fn clear_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query(
            "UPDATE participant
             SET initial_cohort_id = NULL, current_cohort_id = NULL
             WHERE container_id = ?",
        )
        .bind(container_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query("DELETE FROM participant WHERE container_id = ?")
            .bind(container_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }
}

/// One event row to be written into the participant/visit mapping.
#[derive(Debug, Clone)]
pub struct NewParticipantVisit {
    pub participant_id: String,
    pub sequence_num: Decimal,
    pub visit_row_id: Option<i64>,
    pub visit_date: Option<NaiveDate>,
}

/// Trait defining participant/visit mapping repository operations
#[async_trait]
pub trait ParticipantVisitRepository: Send + Sync {
    /// All mapping rows for the container, ordered by participant and
    /// sequence number.
    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<ParticipantVisit>>;

    async fn find_for_participant(
        &self,
        container_id: Uuid,
        participant_id: &str,
    ) -> DomainResult<Vec<ParticipantVisit>>;

    async fn insert_with_tx<'t>(
        &self,
        container_id: Uuid,
        rows: &[NewParticipantVisit],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn delete_by_row_ids_with_tx<'t>(
        &self,
        row_ids: &[i64],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    /// Re-point a mapping row at a (possibly different) visit.
    async fn update_visit_with_tx<'t>(
        &self,
        row_id: i64,
        visit_row_id: Option<i64>,
        visit_date: Option<NaiveDate>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Rows for the reassignment pass, inside the transaction.
    async fn find_all_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<ParticipantVisit>>;

    /// Batched per-visit cohort updates (advanced mode).
    async fn apply_per_visit_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        updates: &[PerVisitCohortUpdate],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    /// Batched uniform cohort updates (simple mode).
    async fn apply_uniform_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        updates: &[UniformCohortUpdate],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn clear_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}

/// SQLite implementation for ParticipantVisitRepository
#[derive(Clone)]
pub struct SqliteParticipantVisitRepository {
    pool: SqlitePool,
}

impl SqliteParticipantVisitRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_rows(rows: Vec<ParticipantVisitRow>) -> DomainResult<Vec<ParticipantVisit>> {
        rows.into_iter().map(ParticipantVisitRow::into_entity).collect()
    }
}

#[async_trait]
impl ParticipantVisitRepository for SqliteParticipantVisitRepository {
    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<ParticipantVisit>> {
        let rows = query_as::<_, ParticipantVisitRow>(
            "SELECT * FROM participant_visit WHERE container_id = ?
             ORDER BY participant_id, sequence_num",
        )
        .bind(container_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Self::map_rows(rows)
    }

    async fn find_for_participant(
        &self,
        container_id: Uuid,
        participant_id: &str,
    ) -> DomainResult<Vec<ParticipantVisit>> {
        let rows = query_as::<_, ParticipantVisitRow>(
            "SELECT * FROM participant_visit
             WHERE container_id = ? AND participant_id = ?
             ORDER BY sequence_num",
        )
        .bind(container_id.to_string())
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Self::map_rows(rows)
    }

    async fn insert_with_tx<'t>(
        &self,
        container_id: Uuid,
        rows: &[NewParticipantVisit],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let mut inserted = 0u64;

        for row in rows {
            let result = query(
                "INSERT OR IGNORE INTO participant_visit
                 (container_id, participant_id, sequence_num, visit_row_id, visit_date, participant_sequence_num)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(container_id.to_string())
            .bind(&row.participant_id)
            .bind(sequence_num_to_storage(row.sequence_num))
            .bind(row.visit_row_id)
            .bind(row.visit_date.map(|d| d.to_string()))
            .bind(participant_sequence_num(&row.participant_id, row.sequence_num))
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    async fn delete_by_row_ids_with_tx<'t>(
        &self,
        row_ids: &[i64],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let mut deleted = 0u64;

        for row_id in row_ids {
            let result = query("DELETE FROM participant_visit WHERE row_id = ?")
                .bind(row_id)
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
            deleted += result.rows_affected();
        }

        Ok(deleted)
    }

    async fn update_visit_with_tx<'t>(
        &self,
        row_id: i64,
        visit_row_id: Option<i64>,
        visit_date: Option<NaiveDate>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query("UPDATE participant_visit SET visit_row_id = ?, visit_date = ? WHERE row_id = ?")
            .bind(visit_row_id)
            .bind(visit_date.map(|d| d.to_string()))
            .bind(row_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(())
    }

    async fn find_all_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<ParticipantVisit>> {
        let rows = query_as::<_, ParticipantVisitRow>(
            "SELECT * FROM participant_visit WHERE container_id = ?
             ORDER BY participant_id, sequence_num",
        )
        .bind(container_id.to_string())
        .fetch_all(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Self::map_rows(rows)
    }

    async fn apply_per_visit_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        updates: &[PerVisitCohortUpdate],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let mut affected = 0u64;

        for update in updates {
            let result = query(
                "UPDATE participant_visit SET cohort_id = ?
                 WHERE container_id = ? AND participant_id = ? AND visit_row_id = ?",
            )
            .bind(update.cohort_id)
            .bind(container_id.to_string())
            .bind(&update.participant_id)
            .bind(update.visit_row_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

            affected += result.rows_affected();
        }

        Ok(affected)
    }

    async fn apply_uniform_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        updates: &[UniformCohortUpdate],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let mut affected = 0u64;

        for update in updates {
            let result = query(
                "UPDATE participant_visit SET cohort_id = ?
                 WHERE container_id = ? AND participant_id = ?",
            )
            .bind(update.cohort_id)
            .bind(container_id.to_string())
            .bind(&update.participant_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

            affected += result.rows_affected();
        }

        Ok(affected)
    }

    async fn clear_cohorts_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query(
            "UPDATE participant_visit SET cohort_id = NULL WHERE container_id = ?",
        )
        .bind(container_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query("DELETE FROM participant_visit WHERE container_id = ?")
            .bind(container_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::db::init_memory_pool;
    use rust_decimal_macros::dec;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    #[tokio::test]
    async fn test_ensure_exist_is_idempotent() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteParticipantRepository::new(pool.clone());
        let container = Uuid::new_v4();

        let ids = vec!["PT-1".to_string(), "PT-2".to_string()];

        let mut tx = pool.begin().await.unwrap();
        let inserted = repo.ensure_exist_with_tx(container, &ids, &mut tx).await.unwrap();
        assert_eq!(inserted, 2);
        let again = repo.ensure_exist_with_tx(container, &ids, &mut tx).await.unwrap();
        assert_eq!(again, 0);
        tx.commit().await.unwrap();

        let all = repo.find_all(container).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].current_cohort_id.is_none());
    }

    #[tokio::test]
    async fn test_participant_visit_insert_and_cohort_updates() {
        let pool = init_memory_pool().await.unwrap();
        let participants = SqliteParticipantRepository::new(pool.clone());
        let visits = SqliteParticipantVisitRepository::new(pool.clone());
        let container = Uuid::new_v4();
        let auth = admin();

        participants
            .create(container, &NewParticipant::with_id("PT-1"), &auth)
            .await
            .unwrap();

        // A referenced cohort row must exist before assignment
        sqlx::query(
            "INSERT INTO cohort (row_id, container_id, label, created_at, updated_at)
             VALUES (7, ?, 'Positive', ?, ?)",
        )
        .bind(container.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let rows = vec![
            NewParticipantVisit {
                participant_id: "PT-1".to_string(),
                sequence_num: dec!(1),
                visit_row_id: None,
                visit_date: None,
            },
            NewParticipantVisit {
                participant_id: "PT-1".to_string(),
                sequence_num: dec!(2),
                visit_row_id: None,
                visit_date: None,
            },
        ];
        assert_eq!(visits.insert_with_tx(container, &rows, &mut tx).await.unwrap(), 2);
        // Duplicate (participant, sequence) pairs are ignored
        assert_eq!(visits.insert_with_tx(container, &rows, &mut tx).await.unwrap(), 0);
        tx.commit().await.unwrap();

        let mapped = visits.find_for_participant(container, "PT-1").await.unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].participant_sequence_num, "PT-1|1.0000");

        let mut tx = pool.begin().await.unwrap();
        let updates = vec![UniformCohortUpdate {
            cohort_id: Some(7),
            participant_id: "PT-1".to_string(),
        }];
        assert_eq!(
            visits
                .apply_uniform_cohorts_with_tx(container, &updates, &mut tx)
                .await
                .unwrap(),
            2
        );
        visits.clear_cohorts_with_tx(container, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let mapped = visits.find_for_participant(container, "PT-1").await.unwrap();
        assert!(mapped.iter().all(|pv| pv.cohort_id.is_none()));
    }
}
