use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::visit::types::{
    parse_datetime, parse_uuid, participant_sequence_num, sequence_num_from_storage,
};
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{common, Validate};

/// Participant entity - one enrolled subject within a study container.
///
/// The cohort columns are denormalized: they are recomputed wholesale by
/// the cohort assignment engine and must not be edited directly outside
/// manual-assignment mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub container_id: Uuid,
    pub participant_id: String,
    pub start_date: Option<NaiveDate>,
    pub initial_cohort_id: Option<i64>,
    pub current_cohort_id: Option<i64>,
    pub enrollment_site_id: Option<i64>,
    pub current_site_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// NewParticipant DTO
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewParticipant {
    pub participant_id: String,
    pub start_date: Option<NaiveDate>,
    pub enrollment_site_id: Option<i64>,
}

impl NewParticipant {
    pub fn with_id(participant_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            start_date: None,
            enrollment_site_id: None,
        }
    }
}

impl Validate for NewParticipant {
    fn validate(&self) -> DomainResult<()> {
        common::validate_participant_id(&self.participant_id)
    }
}

/// ParticipantRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct ParticipantRow {
    pub container_id: String,
    pub participant_id: String,
    pub start_date: Option<String>,
    pub initial_cohort_id: Option<i64>,
    pub current_cohort_id: Option<i64>,
    pub enrollment_site_id: Option<i64>,
    pub current_site_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl ParticipantRow {
    /// Convert database row to domain entity
    pub fn into_entity(self) -> DomainResult<Participant> {
        let start_date = match &self.start_date {
            Some(s) => Some(parse_date(s, "start_date")?),
            None => None,
        };

        Ok(Participant {
            container_id: parse_uuid(&self.container_id, "container_id")?,
            participant_id: self.participant_id,
            start_date,
            initial_cohort_id: self.initial_cohort_id,
            current_cohort_id: self.current_cohort_id,
            enrollment_site_id: self.enrollment_site_id,
            current_site_id: self.current_site_id,
            created_at: parse_datetime(&self.created_at, "created_at")?,
            updated_at: parse_datetime(&self.updated_at, "updated_at")?,
        })
    }
}

/// ParticipantVisit entity - the denormalized (participant, event) row.
/// Populated only for studies with a visit axis, never for continuous
/// studies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantVisit {
    pub row_id: i64,
    pub container_id: Uuid,
    pub participant_id: String,
    pub sequence_num: Decimal,
    pub visit_row_id: Option<i64>,
    pub visit_date: Option<NaiveDate>,
    pub cohort_id: Option<i64>,
    pub participant_sequence_num: String,
}

/// ParticipantVisitRow - SQLite row representation
#[derive(Debug, Clone, FromRow)]
pub struct ParticipantVisitRow {
    pub row_id: i64,
    pub container_id: String,
    pub participant_id: String,
    pub sequence_num: f64,
    pub visit_row_id: Option<i64>,
    pub visit_date: Option<String>,
    pub cohort_id: Option<i64>,
    pub participant_sequence_num: Option<String>,
}

impl ParticipantVisitRow {
    pub fn into_entity(self) -> DomainResult<ParticipantVisit> {
        let sequence_num = sequence_num_from_storage(self.sequence_num, "sequence_num")?;
        let visit_date = match &self.visit_date {
            Some(s) => Some(parse_date(s, "visit_date")?),
            None => None,
        };
        let key = self
            .participant_sequence_num
            .unwrap_or_else(|| participant_sequence_num(&self.participant_id, sequence_num));

        Ok(ParticipantVisit {
            row_id: self.row_id,
            container_id: parse_uuid(&self.container_id, "container_id")?,
            participant_id: self.participant_id,
            sequence_num,
            visit_row_id: self.visit_row_id,
            visit_date,
            cohort_id: self.cohort_id,
            participant_sequence_num: key,
        })
    }
}

pub(crate) fn parse_date(value: &str, field: &str) -> DomainResult<NaiveDate> {
    // Dates arrive either bare (YYYY-MM-DD) or as a full RFC3339 stamp
    if let Ok(date) = value.parse::<NaiveDate>() {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.date_naive())
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field,
                &format!("Invalid date format: {}", value),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_forms() {
        assert_eq!(
            parse_date("2000-01-02", "d").unwrap(),
            NaiveDate::from_ymd_opt(2000, 1, 2).unwrap()
        );
        assert_eq!(
            parse_date("2000-01-02T10:30:00+00:00", "d").unwrap(),
            NaiveDate::from_ymd_opt(2000, 1, 2).unwrap()
        );
        assert!(parse_date("01/02/2000", "d").is_err());
    }
}
