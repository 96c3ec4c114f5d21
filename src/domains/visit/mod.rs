pub mod manager;
pub mod repository;
pub mod sequence;
pub mod types;

pub use manager::VisitManager;
pub use repository::{SqliteVisitRepository, VisitRepository};
pub use sequence::{SequenceNumTranslator, SequenceValue, VisitLookup};
pub use types::{Visit, VisitSequenceMap, VisitType, DEMOGRAPHICS_VISIT};
