pub mod repository;
pub mod types;

pub use repository::{QCStateRepository, SqliteQCStateRepository};
pub use types::{QCState, QCStateSet};
