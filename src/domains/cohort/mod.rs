pub mod assignment;
pub mod repository;
pub mod service;
pub mod types;

pub use assignment::{reconcile_cohorts, CohortObservation, CohortReassignment};
pub use repository::{CohortRepository, SqliteCohortRepository};
pub use service::CohortService;
pub use types::Cohort;
