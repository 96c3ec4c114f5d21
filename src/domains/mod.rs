pub mod cohort;
pub mod core;
pub mod dataset;
pub mod participant;
pub mod qcstate;
pub mod study;
pub mod visit;

pub use cohort::service::CohortService;
pub use study::types::Study;
