use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::visit::types::{parse_datetime, parse_optional_uuid, parse_uuid};
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{Validate, ValidationBuilder};

/// Column type of a runtime-defined dataset property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Text,
    Integer,
    Double,
    Decimal,
    Boolean,
    Date,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Text => "text",
            PropertyType::Integer => "integer",
            PropertyType::Double => "double",
            PropertyType::Decimal => "decimal",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "string" => Some(PropertyType::Text),
            "integer" | "int" => Some(PropertyType::Integer),
            "double" | "float" => Some(PropertyType::Double),
            "decimal" | "numeric" => Some(PropertyType::Decimal),
            "boolean" | "bool" => Some(PropertyType::Boolean),
            "date" | "datetime" => Some(PropertyType::Date),
            _ => None,
        }
    }

    /// SQLite column type used when the property is provisioned.
    pub fn sql_type(&self) -> &'static str {
        match self {
            PropertyType::Text | PropertyType::Date => "TEXT",
            PropertyType::Integer | PropertyType::Boolean => "INTEGER",
            PropertyType::Double => "REAL",
            PropertyType::Decimal => "NUMERIC",
        }
    }

    /// Cohort-driving columns must be textual.
    pub fn is_text(&self) -> bool {
        matches!(self, PropertyType::Text)
    }
}

/// A runtime-defined property column of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetProperty {
    pub row_id: i64,
    pub container_id: Uuid,
    pub dataset_id: i64,
    pub name: String,
    pub property_type: PropertyType,
    pub required: bool,
}

/// NewDatasetProperty DTO
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDatasetProperty {
    pub name: String,
    pub property_type: PropertyType,
    pub required: bool,
}

impl NewDatasetProperty {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            property_type: PropertyType::Text,
            required: false,
        }
    }
}

/// DatasetPropertyRow - SQLite row representation
#[derive(Debug, Clone, FromRow)]
pub struct DatasetPropertyRow {
    pub row_id: i64,
    pub container_id: String,
    pub dataset_id: i64,
    pub name: String,
    pub property_type: String,
    pub required: i64,
}

impl DatasetPropertyRow {
    pub fn into_entity(self) -> DomainResult<DatasetProperty> {
        let property_type = PropertyType::from_str(&self.property_type).ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(
                "property_type",
                &format!("Unknown property type: {}", self.property_type),
            ))
        })?;

        Ok(DatasetProperty {
            row_id: self.row_id,
            container_id: parse_uuid(&self.container_id, "container_id")?,
            dataset_id: self.dataset_id,
            name: self.name,
            property_type,
            required: self.required != 0,
        })
    }
}

/// Dataset entity - a runtime-defined table of study data rows keyed by
/// (participant, sequence number[, extra key]). Demographic datasets hold
/// one row per participant at the demographics sentinel sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: i64,
    pub container_id: Uuid,
    pub name: String,
    pub label: Option<String>,
    pub category: Option<String>,
    pub demographic: bool,
    pub key_property_name: Option<String>,
    pub visit_date_property_name: Option<String>,
    /// Name of the provisioned storage table backing this dataset.
    pub table_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
}

/// NewDataset DTO - used when defining a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataset {
    pub dataset_id: i64,
    pub name: String,
    pub label: Option<String>,
    pub category: Option<String>,
    pub demographic: bool,
    pub key_property_name: Option<String>,
    pub visit_date_property_name: Option<String>,
    pub properties: Vec<NewDatasetProperty>,
}

impl NewDataset {
    pub fn named(dataset_id: i64, name: &str) -> Self {
        Self {
            dataset_id,
            name: name.to_string(),
            label: None,
            category: None,
            demographic: false,
            key_property_name: None,
            visit_date_property_name: None,
            properties: Vec::new(),
        }
    }

    pub fn demographic(mut self) -> Self {
        self.demographic = true;
        self
    }

    pub fn with_property(mut self, property: NewDatasetProperty) -> Self {
        self.properties.push(property);
        self
    }
}

impl Validate for NewDataset {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("name", Some(self.name.clone()))
            .required()
            .min_length(1)
            .max_length(64)
            .validate()?;
        ValidationBuilder::new("dataset_id", Some(self.dataset_id)).min(1).validate()?;

        for property in &self.properties {
            ValidationBuilder::new("property.name", Some(property.name.clone()))
                .required()
                .max_length(64)
                .validate()?;
        }
        Ok(())
    }
}

/// DatasetRow - SQLite row representation
#[derive(Debug, Clone, FromRow)]
pub struct DatasetRow {
    pub dataset_id: i64,
    pub container_id: String,
    pub name: String,
    pub label: Option<String>,
    pub category: Option<String>,
    pub demographic: i64,
    pub key_property_name: Option<String>,
    pub visit_date_property_name: Option<String>,
    pub table_name: String,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
}

impl DatasetRow {
    pub fn into_entity(self) -> DomainResult<Dataset> {
        Ok(Dataset {
            dataset_id: self.dataset_id,
            container_id: parse_uuid(&self.container_id, "container_id")?,
            name: self.name,
            label: self.label,
            category: self.category,
            demographic: self.demographic != 0,
            key_property_name: self.key_property_name,
            visit_date_property_name: self.visit_date_property_name,
            table_name: self.table_name,
            created_at: parse_datetime(&self.created_at, "created_at")?,
            updated_at: parse_datetime(&self.updated_at, "updated_at")?,
            created_by_user_id: parse_optional_uuid(&self.created_by_user_id, "created_by_user_id")?,
            updated_by_user_id: parse_optional_uuid(&self.updated_by_user_id, "updated_by_user_id")?,
        })
    }
}

/// One data row to be written into a dataset's provisioned table, with
/// the sequence number already translated to canonical form.
#[derive(Debug, Clone)]
pub struct DatasetRowData {
    pub participant_id: String,
    pub sequence_num: Decimal,
    pub visit_date: Option<NaiveDate>,
    pub key: Option<String>,
    pub values: HashMap<String, JsonValue>,
}

impl DatasetRowData {
    pub fn new(participant_id: &str, sequence_num: Decimal) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            sequence_num,
            visit_date: None,
            key: None,
            values: HashMap::new(),
        }
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.visit_date = Some(date);
        self
    }

    pub fn with_value(mut self, property: &str, value: JsonValue) -> Self {
        self.values.insert(property.to_string(), value);
        self
    }
}

/// A distinct (participant, event) pair observed in a dataset's rows;
/// drives the participant/visit mapping rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEvent {
    pub participant_id: String,
    pub sequence_num: Decimal,
    pub visit_date: Option<NaiveDate>,
}

/// An imported data row before sequence-number translation: the event
/// identifier may be a number, a numeric string, or a visit label, and
/// may be missing entirely for date-based and demographic datasets.
#[derive(Debug, Clone)]
pub struct RawDatasetRow {
    pub participant_id: String,
    pub sequence_value: Option<crate::domains::visit::sequence::SequenceValue>,
    pub date: Option<NaiveDate>,
    pub key: Option<String>,
    pub values: HashMap<String, JsonValue>,
}

impl RawDatasetRow {
    pub fn new(participant_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            sequence_value: None,
            date: None,
            key: None,
            values: HashMap::new(),
        }
    }

    pub fn at(mut self, value: crate::domains::visit::sequence::SequenceValue) -> Self {
        self.sequence_value = Some(value);
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_value(mut self, property: &str, value: JsonValue) -> Self {
        self.values.insert(property.to_string(), value);
        self
    }
}
