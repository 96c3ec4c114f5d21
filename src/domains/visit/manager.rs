use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use log::{debug, info};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::cohort::service::{CohortService, ReassignmentSummary};
use crate::domains::core::repository::FindById;
use crate::domains::dataset::repository::DatasetRepository;
use crate::domains::dataset::types::{DatasetRowData, RawDatasetRow};
use crate::domains::participant::repository::{
    NewParticipantVisit, ParticipantRepository, ParticipantVisitRepository,
};
use crate::domains::study::repository::StudyRepository;
use crate::domains::visit::repository::VisitRepository;
use crate::domains::visit::sequence::SequenceNumTranslator;
use crate::errors::{DbError, DomainError, ServiceResult, ValidationError};

/// Outcome of one participant/visit refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitRefreshSummary {
    pub participants_added: u64,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub rows_remapped: u64,
    /// Present when the pass also triggered automatic cohort
    /// reassignment.
    pub cohorts: Option<ReassignmentSummary>,
}

/// Keeps the denormalized participant and participant/visit tables in
/// step with the dataset rows, and triggers automatic cohort
/// reassignment when the driving dataset changed.
pub struct VisitManager {
    pool: SqlitePool,
    study_repo: Arc<dyn StudyRepository>,
    visit_repo: Arc<dyn VisitRepository>,
    dataset_repo: Arc<dyn DatasetRepository>,
    participant_repo: Arc<dyn ParticipantRepository>,
    participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
    cohort_service: Arc<CohortService>,
}

impl VisitManager {
    pub fn new(
        pool: SqlitePool,
        study_repo: Arc<dyn StudyRepository>,
        visit_repo: Arc<dyn VisitRepository>,
        dataset_repo: Arc<dyn DatasetRepository>,
        participant_repo: Arc<dyn ParticipantRepository>,
        participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
        cohort_service: Arc<CohortService>,
    ) -> Self {
        Self {
            pool,
            study_repo,
            visit_repo,
            dataset_repo,
            participant_repo,
            participant_visit_repo,
            cohort_service,
        }
    }

    /// Translator for importing rows into one dataset: visit labels map
    /// to their sequence_num_min, demographic datasets fall back to the
    /// demographics sentinel, and log visits disambiguate by date.
    pub async fn sequence_translator(
        &self,
        container_id: Uuid,
        dataset_id: i64,
    ) -> ServiceResult<SequenceNumTranslator> {
        let study = self.study_repo.find_by_container(container_id).await?;
        let dataset = self.dataset_repo.find_by_id(container_id, dataset_id).await?;
        let sequence_map = self.visit_repo.sequence_map(container_id).await?;

        let name_map = sequence_map
            .visits()
            .filter_map(|visit| {
                visit
                    .label
                    .as_ref()
                    .map(|label| (label.clone(), visit.sequence_num_min))
            })
            .collect();

        let translator = if dataset.demographic {
            SequenceNumTranslator::for_demographic(
                study.timepoint_type,
                study.start_date,
                name_map,
                Some(Arc::new(sequence_map)),
            )
        } else {
            SequenceNumTranslator::new(
                study.timepoint_type,
                study.start_date,
                None,
                name_map,
                Some(Arc::new(sequence_map)),
            )
        };
        Ok(translator)
    }

    /// Translate and store raw imported rows, then refresh the
    /// participant/visit tables (and cohorts, when the dataset drives
    /// them). Rows whose event identifier cannot be resolved fail the
    /// whole import.
    pub async fn import_dataset_rows(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        dataset_id: i64,
        raw_rows: &[RawDatasetRow],
    ) -> ServiceResult<VisitRefreshSummary> {
        auth.require_edit()?;
        let dataset = self.dataset_repo.find_by_id(container_id, dataset_id).await?;
        let translator = self.sequence_translator(container_id, dataset_id).await?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let sequence_num = translator
                .translate(raw.sequence_value.as_ref(), raw.date)
                .ok_or_else(|| {
                    DomainError::Validation(ValidationError::invalid_value(
                        "sequence_num",
                        &format!(
                            "Could not resolve an event for participant '{}'",
                            raw.participant_id
                        ),
                    ))
                })?;

            rows.push(DatasetRowData {
                participant_id: raw.participant_id.clone(),
                sequence_num,
                visit_date: raw.date,
                key: raw.key.clone(),
                values: raw.values.clone(),
            });
        }

        self.dataset_repo.insert_rows(&dataset, &rows, auth).await?;
        self.update_participant_visits(auth, container_id, &[dataset_id]).await
    }

    /// Update the participant and participant/visit tables from the
    /// datasets' rows, then recompute automatic cohort assignments when
    /// one of `changed_dataset_ids` is the driving dataset.
    pub async fn update_participant_visits(
        &self,
        auth: &AuthContext,
        container_id: Uuid,
        changed_dataset_ids: &[i64],
    ) -> ServiceResult<VisitRefreshSummary> {
        auth.require_edit()?;
        let study = self.study_repo.find_by_container(container_id).await?;

        // Collect every distinct (participant, sequence, earliest date)
        // event across all datasets.
        let datasets = self.dataset_repo.find_all(container_id).await?;
        let mut events: BTreeMap<(String, Decimal), Option<NaiveDate>> = BTreeMap::new();
        for dataset in &datasets {
            for event in self.dataset_repo.distinct_events(dataset).await? {
                let entry = events
                    .entry((event.participant_id, event.sequence_num))
                    .or_insert(event.visit_date);
                if let (Some(existing), Some(candidate)) = (*entry, event.visit_date) {
                    if candidate < existing {
                        *entry = Some(candidate);
                    }
                } else if entry.is_none() {
                    *entry = event.visit_date;
                }
            }
        }

        let participant_ids: Vec<String> = events
            .keys()
            .map(|(participant_id, _)| participant_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let sequence_map = self.visit_repo.sequence_map(container_id).await?;
        let has_visit_axis = study.timepoint_type.has_visit_axis();

        let existing = if has_visit_axis {
            self.participant_visit_repo.find_all(container_id).await?
        } else {
            Vec::new()
        };

        let mut summary = VisitRefreshSummary::default();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        summary.participants_added = self
            .participant_repo
            .ensure_exist_with_tx(container_id, &participant_ids, &mut tx)
            .await?;

        if has_visit_axis {
            // Drop mapping rows no longer backed by any dataset event
            let orphaned: Vec<i64> = existing
                .iter()
                .filter(|pv| {
                    !events.contains_key(&(pv.participant_id.clone(), pv.sequence_num))
                })
                .map(|pv| pv.row_id)
                .collect();
            summary.rows_deleted = self
                .participant_visit_repo
                .delete_by_row_ids_with_tx(&orphaned, &mut tx)
                .await?;

            // Insert missing rows, resolved against the visit map
            let known: BTreeSet<(String, Decimal)> = existing
                .iter()
                .map(|pv| (pv.participant_id.clone(), pv.sequence_num))
                .collect();

            let mut to_insert = Vec::new();
            for ((participant_id, sequence_num), visit_date) in &events {
                if known.contains(&(participant_id.clone(), *sequence_num)) {
                    continue;
                }
                to_insert.push(NewParticipantVisit {
                    participant_id: participant_id.clone(),
                    sequence_num: *sequence_num,
                    visit_row_id: sequence_map
                        .find_by_sequence(*sequence_num)
                        .map(|v| v.row_id),
                    visit_date: *visit_date,
                });
            }
            summary.rows_inserted = self
                .participant_visit_repo
                .insert_with_tx(container_id, &to_insert, &mut tx)
                .await?;

            // Re-point surviving rows whose visit resolution or date moved
            for pv in &existing {
                let key = (pv.participant_id.clone(), pv.sequence_num);
                let Some(visit_date) = events.get(&key) else {
                    continue;
                };
                let resolved = sequence_map.find_by_sequence(pv.sequence_num).map(|v| v.row_id);
                if resolved != pv.visit_row_id || *visit_date != pv.visit_date {
                    self.participant_visit_repo
                        .update_visit_with_tx(pv.row_id, resolved, *visit_date, &mut tx)
                        .await?;
                    summary.rows_remapped += 1;
                }
            }
        }

        tx.commit().await.map_err(DbError::from)?;
        debug!(
            "participant/visit refresh in {}: +{} participants, +{} rows, -{} rows, {} remapped",
            container_id,
            summary.participants_added,
            summary.rows_inserted,
            summary.rows_deleted,
            summary.rows_remapped
        );

        // Only recompute cohorts when automatic assignment is on and the
        // driving dataset is among those that changed.
        let driving_changed = study
            .participant_cohort_dataset_id
            .map(|id| changed_dataset_ids.contains(&id))
            .unwrap_or(false);

        if study.is_automatic_cohort_assignment() && driving_changed {
            let cohorts = self
                .cohort_service
                .update_participant_cohorts(auth, container_id)
                .await?;
            summary.cohorts = Some(cohorts);
        }

        self.cohort_service.clear_caches(container_id).await;
        info!("participant/visit refresh completed for {}", container_id);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::domains::dataset::types::{NewDataset, NewDatasetProperty};
    use crate::domains::study::types::NewStudy;
    use crate::domains::visit::sequence::SequenceValue;
    use crate::domains::visit::types::{NewVisit, DEMOGRAPHICS_VISIT};
    use crate::types::TimepointType;
    use crate::StudyCore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn setup_study_with_log_visit(core: &StudyCore, container: Uuid, auth: &AuthContext) {
        let _ = env_logger::builder().is_test(true).try_init();
        core.study_repo
            .create(
                container,
                &NewStudy::new("Trial", TimepointType::Visit).starting(date(2000, 1, 1)),
                auth,
            )
            .await
            .unwrap();

        let mut enrollment = NewVisit::at_sequence(dec!(1), Some("Enrollment"));
        enrollment.sequence_num_max = dec!(1.9999);
        enrollment.chronological_order = 1;
        core.visit_repo.create(container, &enrollment, auth).await.unwrap();

        let mut log_visit = NewVisit::at_sequence(dec!(9999), Some("Study Report"));
        log_visit.sequence_num_max = dec!(9999.9999);
        log_visit.chronological_order = 99;
        core.visit_repo.create(container, &log_visit, auth).await.unwrap();
    }

    #[tokio::test]
    async fn test_import_translates_labels_and_log_visit_dates() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_study_with_log_visit(&core, container, &auth).await;

        let dataset = core
            .dataset_repo
            .create(
                container,
                &NewDataset::named(10, "adverse_events")
                    .with_property(NewDatasetProperty::text("notes")),
                &auth,
            )
            .await
            .unwrap();

        let rows = vec![
            RawDatasetRow::new("PT-1")
                .at(SequenceValue::text("Enrollment"))
                .with_value("notes", json!("baseline")),
            RawDatasetRow::new("PT-1")
                .at(SequenceValue::text("Study Report"))
                .on_date(date(2000, 1, 2)),
            RawDatasetRow::new("PT-1")
                .at(SequenceValue::text("Study Report"))
                .on_date(date(2001, 1, 1)),
        ];

        let summary = core
            .visits
            .import_dataset_rows(&auth, container, 10, &rows)
            .await
            .unwrap();
        assert_eq!(summary.participants_added, 1);
        assert_eq!(summary.rows_inserted, 3);

        let events = core.dataset_repo.distinct_events(&dataset).await.unwrap();
        let sequences: Vec<_> = events.iter().map(|e| e.sequence_num).collect();
        assert_eq!(sequences, vec![dec!(1.0000), dec!(9999.0001), dec!(9999.0366)]);

        // Every event resolved to its covering visit
        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        assert_eq!(mapped.len(), 3);
        assert!(mapped.iter().all(|pv| pv.visit_row_id.is_some()));

        // An unresolvable identifier fails the import
        let bad = vec![RawDatasetRow::new("PT-2").at(SequenceValue::text("Week 52"))];
        assert!(core
            .visits
            .import_dataset_rows(&auth, container, 10, &bad)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_demographic_import_uses_sentinel() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_study_with_log_visit(&core, container, &auth).await;

        core.dataset_repo
            .create(
                container,
                &NewDataset::named(1, "demographics")
                    .demographic()
                    .with_property(NewDatasetProperty::text("gender")),
                &auth,
            )
            .await
            .unwrap();

        let rows = vec![RawDatasetRow::new("PT-1").with_value("gender", json!("f"))];
        core.visits
            .import_dataset_rows(&auth, container, 1, &rows)
            .await
            .unwrap();

        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].sequence_num, DEMOGRAPHICS_VISIT);
        // No visit covers the sentinel
        assert!(mapped[0].visit_row_id.is_none());
    }

    #[tokio::test]
    async fn test_refresh_remaps_rows_when_visits_change() {
        let core = StudyCore::open_in_memory().await.unwrap();
        let container = Uuid::new_v4();
        let auth = admin();
        setup_study_with_log_visit(&core, container, &auth).await;

        core.dataset_repo
            .create(container, &NewDataset::named(20, "labs"), &auth)
            .await
            .unwrap();

        let rows = vec![RawDatasetRow::new("PT-1").at(SequenceValue::Number(dec!(5)))];
        core.visits
            .import_dataset_rows(&auth, container, 20, &rows)
            .await
            .unwrap();

        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        assert!(mapped[0].visit_row_id.is_none());

        // Defining the covering visit re-points the existing row
        let mut month_five = NewVisit::at_sequence(dec!(5), Some("Month 5"));
        month_five.sequence_num_max = dec!(5.9999);
        core.visit_repo.create(container, &month_five, &auth).await.unwrap();

        let summary = core
            .visits
            .update_participant_visits(&auth, container, &[20])
            .await
            .unwrap();
        assert_eq!(summary.rows_remapped, 1);

        let mapped = core
            .participant_visit_repo
            .find_for_participant(container, "PT-1")
            .await
            .unwrap();
        assert!(mapped[0].visit_row_id.is_some());
    }
}
