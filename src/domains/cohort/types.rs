use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::visit::types::{parse_datetime, parse_optional_uuid, parse_uuid};
use crate::errors::DomainResult;
use crate::validation::{Validate, ValidationBuilder};

/// Cohort entity - a named sub-population of study participants.
///
/// Simple cohorts are static per participant; studies with advanced
/// cohorts let a participant's assignment vary per visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cohort {
    pub row_id: i64,
    pub container_id: Uuid,
    pub label: String,
    pub enrolled: bool,
    pub subject_count: Option<i64>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
}

/// NewCohort DTO - used when creating a cohort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCohort {
    pub label: String,
    pub enrolled: bool,
    pub subject_count: Option<i64>,
    pub description: Option<String>,
}

impl NewCohort {
    pub fn with_label(label: &str) -> Self {
        Self {
            label: label.to_string(),
            enrolled: true,
            subject_count: None,
            description: None,
        }
    }
}

impl Validate for NewCohort {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("label", Some(self.label.clone()))
            .required()
            .min_length(1)
            .max_length(200)
            .validate()
    }
}

/// UpdateCohort DTO - used when editing a cohort
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCohort {
    pub label: Option<String>,
    pub enrolled: Option<bool>,
    pub subject_count: Option<i64>,
    pub description: Option<String>,
}

impl Validate for UpdateCohort {
    fn validate(&self) -> DomainResult<()> {
        if let Some(label) = &self.label {
            ValidationBuilder::new("label", Some(label.clone()))
                .min_length(1)
                .max_length(200)
                .validate()?;
        }
        Ok(())
    }
}

/// CohortRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct CohortRow {
    pub row_id: i64,
    pub container_id: String,
    pub label: String,
    pub enrolled: i64,
    pub subject_count: Option<i64>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
}

impl CohortRow {
    /// Convert database row to domain entity
    pub fn into_entity(self) -> DomainResult<Cohort> {
        Ok(Cohort {
            row_id: self.row_id,
            container_id: parse_uuid(&self.container_id, "container_id")?,
            label: self.label,
            enrolled: self.enrolled != 0,
            subject_count: self.subject_count,
            description: self.description,
            created_at: parse_datetime(&self.created_at, "created_at")?,
            updated_at: parse_datetime(&self.updated_at, "updated_at")?,
            created_by_user_id: parse_optional_uuid(&self.created_by_user_id, "created_by_user_id")?,
            updated_by_user_id: parse_optional_uuid(&self.updated_by_user_id, "updated_by_user_id")?,
        })
    }
}
