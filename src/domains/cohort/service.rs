use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use log::{debug, info};
use sqlx::{query_as, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::cohort::assignment::{
    reconcile_cohorts, CohortObservation, ParticipantVisitUpdates,
};
use crate::domains::cohort::repository::CohortRepository;
use crate::domains::cohort::types::{Cohort, NewCohort, UpdateCohort};
use crate::domains::core::cache::ContainerCache;
use crate::domains::core::repository::FindById;
use crate::domains::dataset::provision::sanitize_identifier;
use crate::domains::dataset::repository::DatasetRepository;
use crate::domains::dataset::types::Dataset;
use crate::domains::participant::repository::{ParticipantRepository, ParticipantVisitRepository};
use crate::domains::study::repository::StudyRepository;
use crate::domains::study::types::Study;
use crate::errors::{DbError, DomainError, DomainResult, ServiceResult, ValidationError};

/// Participant ids grouped by their current cohort; the cached view
/// behind `get_participants_for_cohort`.
pub type CohortMembership = HashMap<i64, Vec<String>>;

/// Outcome of one reassignment pass. Both counts are zero when the
/// stored assignments already matched the source data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignmentSummary {
    pub cohorts_created: u64,
    pub participant_visit_rows_updated: u64,
    pub participant_rows_updated: u64,
}

impl ReassignmentSummary {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ObservationRow {
    participant_id: String,
    visit_row_id: Option<i64>,
    cohort_label: Option<String>,
    stored_cohort_id: Option<i64>,
}

impl ObservationRow {
    fn into_observation(self) -> CohortObservation {
        CohortObservation {
            participant_id: self.participant_id,
            visit_row_id: self.visit_row_id,
            cohort_label: self.cohort_label.filter(|l| !l.is_empty()),
            stored_cohort_id: self.stored_cohort_id,
        }
    }
}

/// Cohort assignment engine: maintains the mapping from participants
/// (and, for advanced cohorts, participant x visit) to cohort records,
/// and keeps it consistent with the dataset column driving automatic
/// assignment.
pub struct CohortService {
    pool: SqlitePool,
    study_repo: Arc<dyn StudyRepository>,
    cohort_repo: Arc<dyn CohortRepository>,
    participant_repo: Arc<dyn ParticipantRepository>,
    participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
    dataset_repo: Arc<dyn DatasetRepository>,
    study_cache: Arc<ContainerCache<Study>>,
    membership_cache: Arc<ContainerCache<CohortMembership>>,
}

impl CohortService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        study_repo: Arc<dyn StudyRepository>,
        cohort_repo: Arc<dyn CohortRepository>,
        participant_repo: Arc<dyn ParticipantRepository>,
        participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
        dataset_repo: Arc<dyn DatasetRepository>,
        study_cache: Arc<ContainerCache<Study>>,
    ) -> Self {
        Self {
            pool,
            study_repo,
            cohort_repo,
            participant_repo,
            participant_visit_repo,
            dataset_repo,
            study_cache,
            membership_cache: Arc::new(ContainerCache::new()),
        }
    }

    // ---- cohort CRUD -----------------------------------------------------

    pub async fn create_cohort(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        new_cohort: NewCohort,
    ) -> ServiceResult<Cohort> {
        auth.require_study_admin()?;
        let cohort = self.cohort_repo.create(container_id, &new_cohort, auth).await?;
        self.invalidate(container_id).await;
        Ok(cohort)
    }

    pub async fn update_cohort(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        row_id: i64,
        update: UpdateCohort,
    ) -> ServiceResult<Cohort> {
        auth.require_study_admin()?;
        let cohort = self.cohort_repo.update(container_id, row_id, &update, auth).await?;
        self.invalidate(container_id).await;
        Ok(cohort)
    }

    /// Delete a cohort. Refuses while any participant or participant/visit
    /// row still references it.
    pub async fn delete_cohort(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        row_id: i64,
    ) -> ServiceResult<()> {
        auth.require_study_admin()?;

        if self.participant_repo.cohort_in_use(container_id, row_id).await? {
            return Err(DomainError::DependentRecordsExist {
                entity_type: "Cohort".to_string(),
                id: row_id.to_string(),
                dependencies: vec!["participant".to_string(), "participant_visit".to_string()],
            }
            .into());
        }

        self.cohort_repo.delete(container_id, row_id, auth).await?;
        self.invalidate(container_id).await;
        Ok(())
    }

    pub async fn get_cohorts(&self, container_id: Uuid) -> ServiceResult<Vec<Cohort>> {
        Ok(self.cohort_repo.find_all(container_id).await?)
    }

    pub async fn get_cohort(&self, container_id: Uuid, row_id: i64) -> ServiceResult<Cohort> {
        Ok(self.cohort_repo.find_by_id(container_id, row_id).await?)
    }

    pub async fn get_cohort_by_label(
        &self,
        container_id: Uuid,
        label: &str,
    ) -> ServiceResult<Option<Cohort>> {
        Ok(self.cohort_repo.find_by_label(container_id, label).await?)
    }

    /// Participant ids currently assigned to a cohort, served from the
    /// container cache. May lag behind an in-flight mutation until that
    /// mutation invalidates the cache.
    pub async fn get_participants_for_cohort(
        &self,
        container_id: Uuid,
        cohort_id: i64,
    ) -> ServiceResult<Vec<String>> {
        let participant_repo = Arc::clone(&self.participant_repo);
        let membership = self
            .membership_cache
            .get_or_load(container_id, || async move {
                let participants = participant_repo.find_all(container_id).await?;
                let mut grouped: CohortMembership = HashMap::new();
                for participant in participants {
                    if let Some(cohort_id) = participant.current_cohort_id {
                        grouped.entry(cohort_id).or_default().push(participant.participant_id);
                    }
                }
                Ok(grouped)
            })
            .await?;

        Ok(membership.get(&cohort_id).cloned().unwrap_or_default())
    }

    // ---- assignment modes ------------------------------------------------

    /// Switch the study to manual assignment and apply the supplied
    /// participant-to-cohort map, clearing stale assignments first. One
    /// transaction.
    pub async fn set_manual_cohort_assignment(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        assignments: &HashMap<String, i64>,
    ) -> ServiceResult<()> {
        auth.require_study_admin()?;
        let study = self.study_repo.find_by_container(container_id).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        self.study_repo
            .set_cohort_assignment_with_tx(
                container_id,
                true,
                study.advanced_cohorts,
                study.participant_cohort_dataset_id,
                study.participant_cohort_property.as_deref(),
                auth,
                &mut tx,
            )
            .await?;

        self.participant_repo.clear_cohorts_with_tx(container_id, &mut tx).await?;
        self.participant_visit_repo.clear_cohorts_with_tx(container_id, &mut tx).await?;

        for (participant_id, cohort_id) in assignments {
            self.participant_repo
                .set_cohort_with_tx(container_id, participant_id, Some(*cohort_id), &mut tx)
                .await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        info!(
            "manual cohort assignment applied for {} participant(s) in {}",
            assignments.len(),
            container_id
        );
        self.invalidate(container_id).await;
        Ok(())
    }

    /// Switch the study to automatic assignment driven by a dataset
    /// column, then recompute every assignment. Clearing and
    /// recomputation share one transaction: either the whole rebuild
    /// lands or the previous state remains.
    pub async fn set_automatic_cohort_assignment(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        cohort_dataset_id: i64,
        cohort_property: &str,
        advanced: bool,
    ) -> ServiceResult<ReassignmentSummary> {
        auth.require_study_admin()?;
        let mut study = self.study_repo.find_by_container(container_id).await?;

        let dataset = self.dataset_repo.find_by_id(container_id, cohort_dataset_id).await?;
        self.require_text_property(&dataset, cohort_property).await?;
        let labels = self.dataset_repo.distinct_string_values(&dataset, cohort_property).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        self.study_repo
            .set_cohort_assignment_with_tx(
                container_id,
                false,
                advanced,
                Some(cohort_dataset_id),
                Some(cohort_property),
                auth,
                &mut tx,
            )
            .await?;

        self.participant_repo.clear_cohorts_with_tx(container_id, &mut tx).await?;
        self.participant_visit_repo.clear_cohorts_with_tx(container_id, &mut tx).await?;

        study.manual_cohort_assignment = false;
        study.advanced_cohorts = advanced;
        study.participant_cohort_dataset_id = Some(cohort_dataset_id);
        study.participant_cohort_property = Some(cohort_property.to_string());

        let summary = self
            .update_cohorts_with_tx(auth, &study, &dataset, &labels, &mut tx)
            .await?;

        tx.commit().await.map_err(DbError::from)?;
        self.invalidate(container_id).await;
        Ok(summary)
    }

    /// Null every cohort assignment in the container.
    pub async fn clear_participant_cohorts(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
    ) -> ServiceResult<()> {
        auth.require_study_admin()?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.participant_repo.clear_cohorts_with_tx(container_id, &mut tx).await?;
        self.participant_visit_repo.clear_cohorts_with_tx(container_id, &mut tx).await?;
        tx.commit().await.map_err(DbError::from)?;

        self.invalidate(container_id).await;
        Ok(())
    }

    // ---- automatic reassignment ------------------------------------------

    /// Recompute cohort assignments from the driving dataset. No-op in
    /// manual mode or when no driving dataset/column is configured.
    /// Runs in one transaction; caches are invalidated after commit.
    pub async fn update_participant_cohorts(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
    ) -> ServiceResult<ReassignmentSummary> {
        auth.require_edit()?;
        let study = self.study_repo.find_by_container(container_id).await?;

        if study.manual_cohort_assignment || !study.cohort_source_configured() {
            debug!("cohort reassignment skipped for {}: not in automatic mode", container_id);
            return Ok(ReassignmentSummary::default());
        }

        let dataset_id = study
            .participant_cohort_dataset_id
            .ok_or_else(|| DomainError::Internal("cohort dataset id missing".to_string()))?;
        let dataset = self.dataset_repo.find_by_id(container_id, dataset_id).await?;
        let property = study
            .participant_cohort_property
            .clone()
            .ok_or_else(|| DomainError::Internal("cohort property missing".to_string()))?;
        self.require_text_property(&dataset, &property).await?;
        let labels = self.dataset_repo.distinct_string_values(&dataset, &property).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let summary = self
            .update_cohorts_with_tx(auth, &study, &dataset, &labels, &mut tx)
            .await?;
        tx.commit().await.map_err(DbError::from)?;

        if !summary.is_noop() {
            info!(
                "cohort reassignment in {}: {} new cohort(s), {} visit row(s), {} participant(s)",
                container_id,
                summary.cohorts_created,
                summary.participant_visit_rows_updated,
                summary.participant_rows_updated
            );
        }
        self.invalidate(container_id).await;
        Ok(summary)
    }

    /// The reassignment pass proper, inside the caller's transaction:
    /// discover new labels, stream observations in order, reconcile, and
    /// apply the two batched update sets (participant_visit, then
    /// participant).
    async fn update_cohorts_with_tx<'t>(
        &self,
        auth: &AuthContext,
        study: &Study,
        dataset: &Dataset,
        labels: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<ReassignmentSummary> {
        let property = study
            .participant_cohort_property
            .as_deref()
            .ok_or_else(|| DomainError::Internal("cohort property missing".to_string()))?;

        // Labels present in the driving column but not yet defined as
        // cohorts become new cohort rows.
        let mut cohorts_by_label = self.cohort_repo.labels_to_ids_with_tx(study.container_id, tx).await?;
        let mut cohorts_created = 0u64;
        for label in labels {
            if !cohorts_by_label.contains_key(label) {
                let cohort = self
                    .cohort_repo
                    .ensure_with_tx(study.container_id, label, auth, tx)
                    .await?;
                cohorts_by_label.insert(label.clone(), cohort.row_id);
                cohorts_created += 1;
            }
        }

        let has_visit_axis = study.timepoint_type.has_visit_axis();
        let observations = if has_visit_axis {
            self.visit_observations(study.container_id, dataset, property, tx).await?
        } else {
            self.continuous_observations(study.container_id, dataset, property, tx).await?
        };

        let stored = self
            .participant_repo
            .cohort_assignments_with_tx(study.container_id, tx)
            .await?;

        let reassignment = reconcile_cohorts(
            observations,
            &cohorts_by_label,
            &stored,
            study.advanced_cohorts,
            has_visit_axis,
        );

        let participant_visit_rows_updated = match &reassignment.participant_visit_updates {
            ParticipantVisitUpdates::PerVisit(updates) => {
                self.participant_visit_repo
                    .apply_per_visit_cohorts_with_tx(study.container_id, updates, tx)
                    .await?
            }
            ParticipantVisitUpdates::PerParticipant(updates) => {
                self.participant_visit_repo
                    .apply_uniform_cohorts_with_tx(study.container_id, updates, tx)
                    .await?
            }
            ParticipantVisitUpdates::None => 0,
        };

        let participant_rows_updated = self
            .participant_repo
            .apply_cohort_updates_with_tx(study.container_id, &reassignment.participant_updates, tx)
            .await?;

        Ok(ReassignmentSummary {
            cohorts_created,
            participant_visit_rows_updated,
            participant_rows_updated,
        })
    }

    /// Visit-axis observation query: one row per (participant, event) in
    /// chronological visit order, pairing the driving dataset's label
    /// with the stored per-visit cohort.
    async fn visit_observations<'t>(
        &self,
        container_id: Uuid,
        dataset: &Dataset,
        property: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<CohortObservation>> {
        let column = sanitize_identifier(&property.to_lowercase());
        let table = sanitize_identifier(&dataset.table_name);

        let sql = format!(
            "SELECT pv.participant_id AS participant_id,
                    pv.visit_row_id AS visit_row_id,
                    d.\"{column}\" AS cohort_label,
                    pv.cohort_id AS stored_cohort_id
             FROM participant_visit pv
             LEFT JOIN visit v ON v.row_id = pv.visit_row_id
             LEFT JOIN \"{table}\" d
               ON d.participant_id = pv.participant_id AND d.sequence_num = pv.sequence_num
             WHERE pv.container_id = ?
             ORDER BY pv.participant_id, IFNULL(v.chronological_order, 0), pv.sequence_num",
        );

        let mut rows = query_as::<_, ObservationRow>(&sql)
            .bind(container_id.to_string())
            .fetch(&mut **tx);

        let mut observations = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(DbError::from)? {
            observations.push(row.into_observation());
        }
        Ok(observations)
    }

    /// Continuous studies have no visit axis: one row per driving-dataset
    /// row in participant order, stored assignment taken from the
    /// participant itself.
    async fn continuous_observations<'t>(
        &self,
        container_id: Uuid,
        dataset: &Dataset,
        property: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<CohortObservation>> {
        let column = sanitize_identifier(&property.to_lowercase());
        let table = sanitize_identifier(&dataset.table_name);

        let sql = format!(
            "SELECT p.participant_id AS participant_id,
                    NULL AS visit_row_id,
                    d.\"{column}\" AS cohort_label,
                    p.current_cohort_id AS stored_cohort_id
             FROM participant p
             LEFT JOIN \"{table}\" d ON d.participant_id = p.participant_id
             WHERE p.container_id = ?
             ORDER BY p.participant_id, d.sequence_num",
        );

        let mut rows = query_as::<_, ObservationRow>(&sql)
            .bind(container_id.to_string())
            .fetch(&mut **tx);

        let mut observations = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(DbError::from)? {
            observations.push(row.into_observation());
        }
        Ok(observations)
    }

    /// The driving column must exist on the dataset and be textual.
    async fn require_text_property(
        &self,
        dataset: &Dataset,
        property: &str,
    ) -> DomainResult<()> {
        let column = sanitize_identifier(&property.to_lowercase());
        let properties = self
            .dataset_repo
            .properties(dataset.container_id, dataset.dataset_id)
            .await?;

        let found = properties.iter().find(|p| p.name == column).ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(
                "participant_cohort_property",
                &format!("Dataset '{}' has no column '{}'", dataset.name, property),
            ))
        })?;

        if !found.property_type.is_text() {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "participant_cohort_property",
                &format!("Column '{}' must be textual to drive cohort assignment", property),
            )));
        }
        Ok(())
    }

    /// Drop the container's cached study and cohort-membership views.
    /// Called by mutators after commit.
    pub async fn clear_caches(&self, container_id: Uuid) {
        self.invalidate(container_id).await;
    }

    async fn invalidate(&self, container_id: Uuid) {
        self.membership_cache.clear(container_id).await;
        self.study_cache.clear(container_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::domains::cohort::types::NewCohort;
    use crate::domains::dataset::types::{DatasetRowData, NewDataset, NewDatasetProperty, PropertyType};
    use crate::domains::study::types::NewStudy;
    use crate::domains::visit::types::NewVisit;
    use crate::errors::ServiceError;
    use crate::types::TimepointType;
    use crate::StudyCore;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    async fn setup_visit_study(core: &StudyCore, container: Uuid, auth: &AuthContext) {
        let _ = env_logger::builder().is_test(true).try_init();
        core.study_repo
            .create(
                container,
                &NewStudy::new("Vaccine Trial", TimepointType::Visit)
                    .starting(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()),
                auth,
            )
            .await
            .unwrap();

        for (seq, order, label) in [
            (dec!(1), 1, "Enrollment"),
            (dec!(2), 2, "Month 1"),
            (dec!(3), 3, "Month 2"),
        ] {
            let mut visit = NewVisit::at_sequence(seq, Some(label));
            visit.sequence_num_max = seq + dec!(0.9999);
            visit.chronological_order = order;
            visit.display_order = order;
            core.visit_repo.create(container, &visit, auth).await.unwrap();
        }

        let dataset = core
            .dataset_repo
            .create(
                container,
                &NewDataset::named(5001, "cohort_assignment")
                    .with_property(NewDatasetProperty::text("cohort")),
                auth,
            )
            .await
            .unwrap();

        let rows = vec![
            DatasetRowData::new("PT-1", dec!(1)).with_value("cohort", json!("Negative")),
            DatasetRowData::new("PT-1", dec!(2)),
            DatasetRowData::new("PT-1", dec!(3)).with_value("cohort", json!("Positive")),
        ];
        core.dataset_repo.insert_rows(&dataset, &rows, auth).await.unwrap();

        // Build the participant and participant/visit tables
        core.visits
            .update_participant_visits(auth, container, &[5001])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_advanced_assignment_carry_forward_and_idempotence() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_visit_study(&core, container, &auth).await;

        let summary = core
            .cohorts
            .set_automatic_cohort_assignment(&auth, container, 5001, "cohort", true)
            .await
            .unwrap();
        assert_eq!(summary.cohorts_created, 2);
        assert_eq!(summary.participant_visit_rows_updated, 3);
        assert_eq!(summary.participant_rows_updated, 1);

        let negative = core
            .cohorts
            .get_cohort_by_label(container, "Negative")
            .await
            .unwrap()
            .unwrap();
        let positive = core
            .cohorts
            .get_cohort_by_label(container, "Positive")
            .await
            .unwrap()
            .unwrap();

        // Unset visits inherit the prior visit's cohort
        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        let assigned: Vec<Option<i64>> = mapped.iter().map(|pv| pv.cohort_id).collect();
        assert_eq!(
            assigned,
            vec![Some(negative.row_id), Some(negative.row_id), Some(positive.row_id)]
        );

        let participant = core.participant_repo.find_by_id(container, "PT-1").await.unwrap();
        assert_eq!(participant.initial_cohort_id, Some(negative.row_id));
        assert_eq!(participant.current_cohort_id, Some(positive.row_id));

        // Second run with unchanged source data produces no row changes
        let rerun = core
            .cohorts
            .update_participant_cohorts(&auth, container)
            .await
            .unwrap();
        assert!(rerun.is_noop());
    }

    #[tokio::test]
    async fn test_simple_assignment_is_uniform() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_visit_study(&core, container, &auth).await;

        core.cohorts
            .set_automatic_cohort_assignment(&auth, container, 5001, "cohort", false)
            .await
            .unwrap();

        let positive = core
            .cohorts
            .get_cohort_by_label(container, "Positive")
            .await
            .unwrap()
            .unwrap();

        // The latest label applies to the whole study in simple mode
        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        assert!(mapped.iter().all(|pv| pv.cohort_id == Some(positive.row_id)));

        let participant = core.participant_repo.find_by_id(container, "PT-1").await.unwrap();
        assert_eq!(participant.initial_cohort_id, participant.current_cohort_id);
        assert_eq!(participant.current_cohort_id, Some(positive.row_id));

        assert_eq!(
            core.cohorts
                .get_participants_for_cohort(container, positive.row_id)
                .await
                .unwrap(),
            vec!["PT-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_continuous_study_has_no_visit_axis() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();

        core.study_repo
            .create(
                container,
                &NewStudy::new("Observational", TimepointType::Continuous),
                &auth,
            )
            .await
            .unwrap();

        let dataset = core
            .dataset_repo
            .create(
                container,
                &NewDataset::named(1, "enrollment")
                    .with_property(NewDatasetProperty::text("cohort")),
                &auth,
            )
            .await
            .unwrap();
        core.dataset_repo
            .insert_rows(
                &dataset,
                &[DatasetRowData::new("PT-9", dec!(20000102)).with_value("cohort", json!("Enrolled"))],
                &auth,
            )
            .await
            .unwrap();

        core.visits
            .update_participant_visits(&auth, container, &[1])
            .await
            .unwrap();

        // Continuous studies never populate the visit mapping
        assert!(core.participant_visit_repo.find_all(container).await.unwrap().is_empty());

        let summary = core
            .cohorts
            .set_automatic_cohort_assignment(&auth, container, 1, "cohort", false)
            .await
            .unwrap();
        assert_eq!(summary.participant_visit_rows_updated, 0);
        assert_eq!(summary.participant_rows_updated, 1);

        let enrolled = core
            .cohorts
            .get_cohort_by_label(container, "Enrolled")
            .await
            .unwrap()
            .unwrap();
        let participant = core.participant_repo.find_by_id(container, "PT-9").await.unwrap();
        assert_eq!(participant.current_cohort_id, Some(enrolled.row_id));
    }

    #[tokio::test]
    async fn test_manual_assignment_clears_then_applies() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_visit_study(&core, container, &auth).await;

        core.cohorts
            .set_automatic_cohort_assignment(&auth, container, 5001, "cohort", true)
            .await
            .unwrap();

        let control = core
            .cohorts
            .create_cohort(&auth, container, NewCohort::with_label("Control"))
            .await
            .unwrap();

        let assignments = HashMap::from([("PT-1".to_string(), control.row_id)]);
        core.cohorts
            .set_manual_cohort_assignment(&auth, container, &assignments)
            .await
            .unwrap();

        let participant = core.participant_repo.find_by_id(container, "PT-1").await.unwrap();
        assert_eq!(participant.initial_cohort_id, Some(control.row_id));
        assert_eq!(participant.current_cohort_id, Some(control.row_id));

        // Stale per-visit assignments were nulled, not carried over
        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        assert!(mapped.iter().all(|pv| pv.cohort_id.is_none()));

        // Automatic reassignment is a no-op in manual mode
        let summary = core
            .cohorts
            .update_participant_cohorts(&auth, container)
            .await
            .unwrap();
        assert!(summary.is_noop());
    }

    #[tokio::test]
    async fn test_delete_cohort_refuses_while_referenced() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_visit_study(&core, container, &auth).await;

        core.cohorts
            .set_automatic_cohort_assignment(&auth, container, 5001, "cohort", true)
            .await
            .unwrap();

        let positive = core
            .cohorts
            .get_cohort_by_label(container, "Positive")
            .await
            .unwrap()
            .unwrap();

        let blocked = core.cohorts.delete_cohort(&auth, container, positive.row_id).await;
        assert!(matches!(
            blocked,
            Err(ServiceError::Domain(DomainError::DependentRecordsExist { .. }))
        ));

        // After clearing assignments the delete goes through
        core.cohorts.clear_participant_cohorts(&auth, container).await.unwrap();
        core.cohorts.delete_cohort(&auth, container, positive.row_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_text_driving_column_is_rejected() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();

        core.study_repo
            .create(container, &NewStudy::new("Trial", TimepointType::Visit), &auth)
            .await
            .unwrap();

        core.dataset_repo
            .create(
                container,
                &NewDataset::named(7, "labs").with_property(NewDatasetProperty {
                    name: "score".to_string(),
                    property_type: PropertyType::Integer,
                    required: false,
                }),
                &auth,
            )
            .await
            .unwrap();

        let result = core
            .cohorts
            .set_automatic_cohort_assignment(&auth, container, 7, "score", false)
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(DomainError::Validation(_)))
        ));
    }
}
