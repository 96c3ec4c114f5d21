use std::sync::Arc;

use log::info;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::cohort::repository::CohortRepository;
use crate::domains::core::cache::ContainerCache;
use crate::domains::dataset::repository::DatasetRepository;
use crate::domains::participant::repository::{ParticipantRepository, ParticipantVisitRepository};
use crate::domains::study::repository::StudyRepository;
use crate::domains::study::types::{NewStudy, Study};
use crate::domains::visit::repository::VisitRepository;
use crate::errors::{DbError, DbResult, ServiceResult};

/// Study lifecycle operations: creation, cached lookup, time-axis
/// changes, and the full-container cascade delete.
pub struct StudyService {
    pool: SqlitePool,
    study_repo: Arc<dyn StudyRepository>,
    visit_repo: Arc<dyn VisitRepository>,
    cohort_repo: Arc<dyn CohortRepository>,
    participant_repo: Arc<dyn ParticipantRepository>,
    participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
    dataset_repo: Arc<dyn DatasetRepository>,
    study_cache: Arc<ContainerCache<Study>>,
}

impl StudyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        study_repo: Arc<dyn StudyRepository>,
        visit_repo: Arc<dyn VisitRepository>,
        cohort_repo: Arc<dyn CohortRepository>,
        participant_repo: Arc<dyn ParticipantRepository>,
        participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
        dataset_repo: Arc<dyn DatasetRepository>,
        study_cache: Arc<ContainerCache<Study>>,
    ) -> Self {
        Self {
            pool,
            study_repo,
            visit_repo,
            cohort_repo,
            participant_repo,
            participant_visit_repo,
            dataset_repo,
            study_cache,
        }
    }

    pub async fn create_study(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        new_study: NewStudy,
    ) -> ServiceResult<Study> {
        auth.require_study_admin()?;
        let study = self.study_repo.create(container_id, &new_study, auth).await?;
        self.study_cache.clear(container_id).await;
        Ok(study)
    }

    /// Cached study lookup. Mutators invalidate the cache after commit,
    /// so a read may briefly observe the previous state.
    pub async fn get_study(&self, container_id: Uuid) -> ServiceResult<Arc<Study>> {
        let study_repo = Arc::clone(&self.study_repo);
        let study = self
            .study_cache
            .get_or_load(container_id, || async move {
                study_repo.find_by_container(container_id).await
            })
            .await?;
        Ok(study)
    }

    pub async fn set_timepoint_type(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        timepoint_type: &str,
    ) -> ServiceResult<Study> {
        auth.require_study_admin()?;
        let study = self
            .study_repo
            .set_timepoint_type(container_id, timepoint_type, auth)
            .await?;
        self.study_cache.clear(container_id).await;
        Ok(study)
    }

    /// Delete the study and everything it owns: the participant/visit
    /// mapping, participants, visits, cohorts, datasets (with their
    /// provisioned tables), and QC states, in one transaction.
    pub async fn delete_study(&self, auth: &AuthContext, container_id: Uuid) -> ServiceResult<()> {
        auth.require_study_admin()?;
        // Confirm it exists before tearing anything down
        self.study_repo.find_by_container(container_id).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        // Referencing tables first: participant_visit points at visit and
        // cohort, participant points at cohort.
        self.participant_visit_repo
            .delete_for_container_with_tx(container_id, &mut tx)
            .await?;
        self.participant_repo
            .delete_for_container_with_tx(container_id, &mut tx)
            .await?;
        self.visit_repo
            .delete_for_container_with_tx(container_id, &mut tx)
            .await?;
        self.cohort_repo
            .delete_for_container_with_tx(container_id, &mut tx)
            .await?;
        self.dataset_repo
            .delete_for_container_with_tx(container_id, &mut tx)
            .await?;
        delete_qc_states_with_tx(container_id, &mut tx).await?;
        self.study_repo.delete_with_tx(container_id, &mut tx).await?;

        tx.commit().await.map_err(DbError::from)?;
        info!("deleted study and all study data in {}", container_id);

        self.study_cache.clear(container_id).await;
        Ok(())
    }
}

async fn delete_qc_states_with_tx<'t>(
    container_id: Uuid,
    tx: &mut sqlx::Transaction<'t, sqlx::Sqlite>,
) -> DbResult<()> {
    sqlx::query("DELETE FROM qc_state WHERE container_id = ?")
        .bind(container_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::domains::dataset::types::{DatasetRowData, NewDataset, NewDatasetProperty};
    use crate::domains::study::types::NewStudy;
    use crate::domains::visit::types::NewVisit;
    use crate::errors::DomainError;
    use crate::types::TimepointType;
    use crate::StudyCore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    #[tokio::test]
    async fn test_cached_lookup_and_invalidation() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();

        core.studies
            .create_study(&auth, container, NewStudy::new("Trial", TimepointType::Date))
            .await
            .unwrap();

        let first = core.studies.get_study(container).await.unwrap();
        assert_eq!(first.timepoint_type, TimepointType::Date);

        core.studies
            .set_timepoint_type(&auth, container, "VISIT")
            .await
            .unwrap();

        // The mutation invalidated the cache; the next read is fresh
        let second = core.studies.get_study(container).await.unwrap();
        assert_eq!(second.timepoint_type, TimepointType::Visit);
    }

    #[tokio::test]
    async fn test_delete_study_cascades() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();

        core.studies
            .create_study(&auth, container, NewStudy::new("Trial", TimepointType::Visit))
            .await
            .unwrap();
        core.visit_repo
            .create(container, &NewVisit::at_sequence(dec!(1), Some("Enrollment")), &auth)
            .await
            .unwrap();
        let dataset = core
            .dataset_repo
            .create(
                container,
                &NewDataset::named(5001, "cohort_assignment")
                    .with_property(NewDatasetProperty::text("cohort")),
                &auth,
            )
            .await
            .unwrap();
        core.dataset_repo
            .insert_rows(
                &dataset,
                &[DatasetRowData::new("PT-1", dec!(1)).with_value("cohort", json!("Negative"))],
                &auth,
            )
            .await
            .unwrap();
        core.visits
            .update_participant_visits(&auth, container, &[5001])
            .await
            .unwrap();
        core.cohorts
            .set_automatic_cohort_assignment(&auth, container, 5001, "cohort", false)
            .await
            .unwrap();

        core.studies.delete_study(&auth, container).await.unwrap();

        assert!(matches!(
            core.study_repo.find_by_container(container).await,
            Err(DomainError::NoStudy(_))
        ));
        assert!(core.participant_repo.find_all(container).await.unwrap().is_empty());
        assert!(core.cohort_repo.find_all(container).await.unwrap().is_empty());

        // The provisioned table is gone too
        let remaining: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(&dataset.table_name)
        .fetch_optional(&core.pool)
        .await
        .unwrap();
        assert!(remaining.is_none());
    }

    #[tokio::test]
    async fn test_non_admin_cannot_delete() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();

        core.studies
            .create_study(&auth, container, NewStudy::new("Trial", TimepointType::Date))
            .await
            .unwrap();

        let editor = AuthContext::new(Uuid::new_v4(), UserRole::Editor);
        assert!(core.studies.delete_study(&editor, container).await.is_err());
    }
}
