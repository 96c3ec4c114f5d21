pub mod repository;
pub mod types;

pub use repository::{
    ParticipantRepository, ParticipantVisitRepository, SqliteParticipantRepository,
    SqliteParticipantVisitRepository,
};
pub use types::{Participant, ParticipantVisit};
