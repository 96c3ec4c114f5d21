pub mod repository;
pub mod service;
pub mod types;

pub use repository::{SqliteStudyRepository, StudyRepository};
pub use service::StudyService;
pub use types::Study;
