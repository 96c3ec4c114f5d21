pub mod provision;
pub mod repository;
pub mod types;

pub use provision::{ColumnSpec, DomainKind, DomainKindRegistry, StudyDatasetKind};
pub use repository::{DatasetRepository, SqliteDatasetRepository};
pub use types::{Dataset, DatasetProperty, PropertyType};
