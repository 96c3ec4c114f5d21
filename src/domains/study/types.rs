use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::participant::types::parse_date;
use crate::domains::visit::types::{parse_datetime, parse_optional_uuid, parse_uuid};
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::TimepointType;
use crate::validation::{common, Validate, ValidationBuilder};

/// Study entity - one per container. Carries the time axis style and the
/// cohort-assignment configuration for every other entity in the
/// container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub container_id: Uuid,
    pub label: String,
    pub timepoint_type: TimepointType,
    pub start_date: Option<NaiveDate>,
    /// Admins assign cohorts per participant by hand; the automatic
    /// assignment engine never runs.
    pub manual_cohort_assignment: bool,
    /// A participant's cohort may change from visit to visit.
    pub advanced_cohorts: bool,
    /// Dataset whose rows drive automatic assignment.
    pub participant_cohort_dataset_id: Option<i64>,
    /// Textual column of that dataset holding the cohort label.
    pub participant_cohort_property: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
}

impl Study {
    pub fn is_automatic_cohort_assignment(&self) -> bool {
        !self.manual_cohort_assignment
    }

    /// True when automatic assignment has a driving dataset and column
    /// configured.
    pub fn cohort_source_configured(&self) -> bool {
        self.participant_cohort_dataset_id.is_some() && self.participant_cohort_property.is_some()
    }
}

/// NewStudy DTO - used when creating a study
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStudy {
    pub label: String,
    pub timepoint_type: TimepointType,
    pub start_date: Option<NaiveDate>,
}

impl NewStudy {
    pub fn new(label: &str, timepoint_type: TimepointType) -> Self {
        Self {
            label: label.to_string(),
            timepoint_type,
            start_date: None,
        }
    }

    pub fn starting(mut self, start_date: NaiveDate) -> Self {
        self.start_date = Some(start_date);
        self
    }
}

impl Validate for NewStudy {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("label", Some(self.label.clone()))
            .required()
            .min_length(1)
            .max_length(200)
            .validate()?;
        common::validate_timepoint_type(self.timepoint_type.as_str())
    }
}

/// StudyRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct StudyRow {
    pub container_id: String,
    pub label: String,
    pub timepoint_type: String,
    pub start_date: Option<String>,
    pub manual_cohort_assignment: i64,
    pub advanced_cohorts: i64,
    pub participant_cohort_dataset_id: Option<i64>,
    pub participant_cohort_property: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
}

impl StudyRow {
    /// Convert database row to domain entity
    pub fn into_entity(self) -> DomainResult<Study> {
        let timepoint_type = TimepointType::from_str(&self.timepoint_type).ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(
                "timepoint_type",
                &format!("Unknown timepoint type: {}", self.timepoint_type),
            ))
        })?;

        let start_date = match &self.start_date {
            Some(s) => Some(parse_date(s, "start_date")?),
            None => None,
        };

        Ok(Study {
            container_id: parse_uuid(&self.container_id, "container_id")?,
            label: self.label,
            timepoint_type,
            start_date,
            manual_cohort_assignment: self.manual_cohort_assignment != 0,
            advanced_cohorts: self.advanced_cohorts != 0,
            participant_cohort_dataset_id: self.participant_cohort_dataset_id,
            participant_cohort_property: self.participant_cohort_property,
            created_at: parse_datetime(&self.created_at, "created_at")?,
            updated_at: parse_datetime(&self.updated_at, "updated_at")?,
            created_by_user_id: parse_optional_uuid(&self.created_by_user_id, "created_by_user_id")?,
            updated_by_user_id: parse_optional_uuid(&self.updated_by_user_id, "updated_by_user_id")?,
        })
    }
}
