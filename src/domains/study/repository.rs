use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::study::types::{NewStudy, Study, StudyRow};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::types::TimepointType;
use crate::validation::Validate;

/// Trait defining study repository operations
#[async_trait]
pub trait StudyRepository: Send + Sync {
    /// Create the container's study. Each container holds at most one.
    async fn create(
        &self,
        container_id: Uuid,
        new_study: &NewStudy,
        auth: &AuthContext,
    ) -> DomainResult<Study>;

    async fn find_by_container(&self, container_id: Uuid) -> DomainResult<Study>;

    /// Change the study's time axis. Fails fast on unknown enum text.
    async fn set_timepoint_type(
        &self,
        container_id: Uuid,
        timepoint_type: &str,
        auth: &AuthContext,
    ) -> DomainResult<Study>;

    /// Flip the cohort-assignment mode flags and driving-dataset
    /// configuration inside an enclosing transaction.
    async fn set_cohort_assignment_with_tx<'t>(
        &self,
        container_id: Uuid,
        manual: bool,
        advanced: bool,
        cohort_dataset_id: Option<i64>,
        cohort_property: Option<&str>,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn delete_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}

/// SQLite implementation for StudyRepository
#[derive(Clone)]
pub struct SqliteStudyRepository {
    pool: SqlitePool,
}

impl SqliteStudyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StudyRepository for SqliteStudyRepository {
    async fn create(
        &self,
        container_id: Uuid,
        new_study: &NewStudy,
        auth: &AuthContext,
    ) -> DomainResult<Study> {
        new_study.validate()?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT label FROM study WHERE container_id = ?")
                .bind(container_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::from)?;

        if existing.is_some() {
            return Err(DomainError::Validation(ValidationError::entity(
                "Container already holds a study",
            )));
        }

        let now = Utc::now().to_rfc3339();
        query(
            "INSERT INTO study
             (container_id, label, timepoint_type, start_date, created_at, updated_at, created_by_user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(container_id.to_string())
        .bind(&new_study.label)
        .bind(new_study.timepoint_type.as_str())
        .bind(new_study.start_date.map(|d| d.to_string()))
        .bind(&now)
        .bind(&now)
        .bind(auth.user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        debug!("created study '{}' in {}", new_study.label, container_id);
        self.find_by_container(container_id).await
    }

    async fn find_by_container(&self, container_id: Uuid) -> DomainResult<Study> {
        let row = query_as::<_, StudyRow>("SELECT * FROM study WHERE container_id = ?")
            .bind(container_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or(DomainError::NoStudy(container_id))?;

        row.into_entity()
    }

    async fn set_timepoint_type(
        &self,
        container_id: Uuid,
        timepoint_type: &str,
        auth: &AuthContext,
    ) -> DomainResult<Study> {
        let parsed = TimepointType::from_str(timepoint_type).ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(
                "timepoint_type",
                &format!("'{}' is not one of VISIT, DATE, CONTINUOUS", timepoint_type),
            ))
        })?;

        let result = query(
            "UPDATE study SET timepoint_type = ?, updated_at = ?, updated_by_user_id = ?
             WHERE container_id = ?",
        )
        .bind(parsed.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(auth.user_id.to_string())
        .bind(container_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::NoStudy(container_id));
        }
        self.find_by_container(container_id).await
    }

    async fn set_cohort_assignment_with_tx<'t>(
        &self,
        container_id: Uuid,
        manual: bool,
        advanced: bool,
        cohort_dataset_id: Option<i64>,
        cohort_property: Option<&str>,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let result = query(
            "UPDATE study
             SET manual_cohort_assignment = ?, advanced_cohorts = ?,
                 participant_cohort_dataset_id = ?, participant_cohort_property = ?,
                 updated_at = ?, updated_by_user_id = ?
             WHERE container_id = ?",
        )
        .bind(manual as i64)
        .bind(advanced as i64)
        .bind(cohort_dataset_id)
        .bind(cohort_property)
        .bind(Utc::now().to_rfc3339())
        .bind(auth.user_id.to_string())
        .bind(container_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::NoStudy(container_id));
        }
        Ok(())
    }

    async fn delete_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let result = query("DELETE FROM study WHERE container_id = ?")
            .bind(container_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::NoStudy(container_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::db::init_memory_pool;
    use chrono::NaiveDate;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    #[tokio::test]
    async fn test_one_study_per_container() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteStudyRepository::new(pool);
        let container = Uuid::new_v4();
        let auth = admin();

        let study = repo
            .create(
                container,
                &NewStudy::new("HIV Vaccine Trial", TimepointType::Visit)
                    .starting(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()),
                &auth,
            )
            .await
            .unwrap();
        assert_eq!(study.timepoint_type, TimepointType::Visit);
        assert!(!study.manual_cohort_assignment);

        assert!(repo
            .create(container, &NewStudy::new("Second", TimepointType::Date), &auth)
            .await
            .is_err());

        // A container without a study reports NoStudy
        let missing = repo.find_by_container(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(DomainError::NoStudy(_))));
    }

    #[tokio::test]
    async fn test_set_timepoint_type_fails_fast_on_bad_value() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteStudyRepository::new(pool);
        let container = Uuid::new_v4();
        let auth = admin();

        repo.create(container, &NewStudy::new("Study", TimepointType::Date), &auth)
            .await
            .unwrap();

        assert!(repo.set_timepoint_type(container, "WEEKLY", &auth).await.is_err());
        let updated = repo
            .set_timepoint_type(container, "continuous", &auth)
            .await
            .unwrap();
        assert_eq!(updated.timepoint_type, TimepointType::Continuous);
    }
}
