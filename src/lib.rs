use std::sync::Arc;

use sqlx::SqlitePool;

// Public modules
pub mod auth;
pub mod db;
pub mod domains;
pub mod errors;
pub mod types;
pub mod validation;

pub use auth::{AuthContext, UserRole};
pub use domains::cohort::service::{CohortService, ReassignmentSummary};
pub use domains::study::service::StudyService;
pub use domains::study::types::Study;
pub use domains::visit::manager::VisitManager;
pub use errors::{DbError, DomainError, DomainResult, ServiceError, ServiceResult};
pub use types::TimepointType;

use domains::cohort::repository::{CohortRepository, SqliteCohortRepository};
use domains::core::cache::ContainerCache;
use domains::dataset::repository::{DatasetRepository, SqliteDatasetRepository};
use domains::participant::repository::{
    ParticipantRepository, ParticipantVisitRepository, SqliteParticipantRepository,
    SqliteParticipantVisitRepository,
};
use domains::qcstate::repository::{QCStateRepository, SqliteQCStateRepository};
use domains::study::repository::{SqliteStudyRepository, StudyRepository};
use domains::visit::repository::{SqliteVisitRepository, VisitRepository};

/// Explicitly wired service registry for one database. Construct once,
/// share the `Arc`ed services; there are no process-wide singletons.
pub struct StudyCore {
    pub pool: SqlitePool,
    pub studies: Arc<StudyService>,
    pub cohorts: Arc<CohortService>,
    pub visits: Arc<VisitManager>,
    pub study_repo: Arc<dyn StudyRepository>,
    pub visit_repo: Arc<dyn VisitRepository>,
    pub cohort_repo: Arc<dyn CohortRepository>,
    pub participant_repo: Arc<dyn ParticipantRepository>,
    pub participant_visit_repo: Arc<dyn ParticipantVisitRepository>,
    pub dataset_repo: Arc<dyn DatasetRepository>,
    pub qc_state_repo: Arc<dyn QCStateRepository>,
}

impl StudyCore {
    /// Open (creating if missing) the database at `db_path`, apply
    /// migrations, and wire the services.
    pub async fn open(db_path: &str) -> errors::DbResult<Self> {
        let pool = db::init_db_pool(db_path).await?;
        Ok(Self::with_pool(pool))
    }

    /// In-memory instance, for tests.
    pub async fn open_in_memory() -> errors::DbResult<Self> {
        let pool = db::init_memory_pool().await?;
        Ok(Self::with_pool(pool))
    }

    /// Wire the services over an already-migrated pool.
    pub fn with_pool(pool: SqlitePool) -> Self {
        let study_repo: Arc<dyn StudyRepository> =
            Arc::new(SqliteStudyRepository::new(pool.clone()));
        let visit_repo: Arc<dyn VisitRepository> =
            Arc::new(SqliteVisitRepository::new(pool.clone()));
        let cohort_repo: Arc<dyn CohortRepository> =
            Arc::new(SqliteCohortRepository::new(pool.clone()));
        let participant_repo: Arc<dyn ParticipantRepository> =
            Arc::new(SqliteParticipantRepository::new(pool.clone()));
        let participant_visit_repo: Arc<dyn ParticipantVisitRepository> =
            Arc::new(SqliteParticipantVisitRepository::new(pool.clone()));
        let dataset_repo: Arc<dyn DatasetRepository> =
            Arc::new(SqliteDatasetRepository::new(pool.clone()));
        let qc_state_repo: Arc<dyn QCStateRepository> =
            Arc::new(SqliteQCStateRepository::new(pool.clone()));

        let study_cache = Arc::new(ContainerCache::new());

        let cohorts = Arc::new(CohortService::new(
            pool.clone(),
            Arc::clone(&study_repo),
            Arc::clone(&cohort_repo),
            Arc::clone(&participant_repo),
            Arc::clone(&participant_visit_repo),
            Arc::clone(&dataset_repo),
            Arc::clone(&study_cache),
        ));

        let studies = Arc::new(StudyService::new(
            pool.clone(),
            Arc::clone(&study_repo),
            Arc::clone(&visit_repo),
            Arc::clone(&cohort_repo),
            Arc::clone(&participant_repo),
            Arc::clone(&participant_visit_repo),
            Arc::clone(&dataset_repo),
            Arc::clone(&study_cache),
        ));

        let visits = Arc::new(VisitManager::new(
            pool.clone(),
            Arc::clone(&study_repo),
            Arc::clone(&visit_repo),
            Arc::clone(&dataset_repo),
            Arc::clone(&participant_repo),
            Arc::clone(&participant_visit_repo),
            Arc::clone(&cohorts),
        ));

        Self {
            pool,
            studies,
            cohorts,
            visits,
            study_repo,
            visit_repo,
            cohort_repo,
            participant_repo,
            participant_visit_repo,
            dataset_repo,
            qc_state_repo,
        }
    }
}
