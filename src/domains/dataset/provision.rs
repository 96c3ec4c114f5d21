use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::domains::dataset::types::{NewDatasetProperty, PropertyType};
use crate::errors::{DomainError, DomainResult, ValidationError};

/// Typed descriptor for one column of a provisioned table.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub property_type: PropertyType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, property_type: PropertyType, nullable: bool) -> Self {
        Self {
            name,
            property_type,
            nullable,
        }
    }

    fn ddl(&self) -> String {
        let null_clause = if self.nullable { "" } else { " NOT NULL" };
        format!("\"{}\" {}{}", self.name, self.property_type.sql_type(), null_clause)
    }
}

/// A kind of provisioned table: the fixed base columns every instance
/// carries plus the index DDL applied after creation. Runtime-defined
/// property columns are appended per dataset.
pub trait DomainKind: Send + Sync {
    fn kind_name(&self) -> &'static str;

    fn base_columns(&self) -> Vec<ColumnSpec>;

    fn index_ddl(&self, table_name: &str) -> Vec<String>;
}

/// Provisioned-table kind for study dataset storage: rows keyed by
/// (participant, sequence number, extra key).
pub struct StudyDatasetKind;

pub const STUDY_DATASET_KIND: &str = "study-dataset";

impl DomainKind for StudyDatasetKind {
    fn kind_name(&self) -> &'static str {
        STUDY_DATASET_KIND
    }

    fn base_columns(&self) -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("participant_id", PropertyType::Text, false),
            ColumnSpec::new("sequence_num", PropertyType::Decimal, false),
            ColumnSpec::new("_key", PropertyType::Text, true),
            ColumnSpec::new("visit_date", PropertyType::Date, true),
            ColumnSpec::new("qc_state_id", PropertyType::Integer, true),
            ColumnSpec::new("created", PropertyType::Date, true),
            ColumnSpec::new("modified", PropertyType::Date, true),
        ]
    }

    fn index_ddl(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"uq_{0}_ptid_seq_key\" \
             ON \"{0}\" (participant_id, sequence_num, IFNULL(_key, ''))",
            table_name
        )]
    }
}

/// Explicit registry of provisioned-table kinds, keyed by kind name.
#[derive(Clone)]
pub struct DomainKindRegistry {
    kinds: HashMap<&'static str, Arc<dyn DomainKind>>,
}

impl DomainKindRegistry {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: Arc<dyn DomainKind>) {
        self.kinds.insert(kind.kind_name(), kind);
    }

    pub fn get(&self, kind_name: &str) -> DomainResult<Arc<dyn DomainKind>> {
        self.kinds.get(kind_name).cloned().ok_or_else(|| {
            DomainError::Internal(format!("No provisioned-table kind registered as '{}'", kind_name))
        })
    }
}

impl Default for DomainKindRegistry {
    /// Registry with the study dataset kind pre-registered.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StudyDatasetKind));
        registry
    }
}

/// Strip everything but alphanumerics and underscores from a dynamic SQL
/// identifier. Prevents injection through runtime-defined names.
pub fn sanitize_identifier(identifier: &str) -> String {
    let safe_id: String = identifier
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    if safe_id.is_empty() {
        return "_invalid".to_string();
    }

    if safe_id.chars().all(|c| c.is_numeric()) {
        return format!("_{}", safe_id);
    }

    safe_id
}

/// Storage table name for a dataset: container-scoped, stable across
/// renames of the dataset label.
pub fn table_name_for(container_id: Uuid, dataset_id: i64, name: &str) -> String {
    let container_part = container_id.simple().to_string();
    format!(
        "c{}_d{}_{}",
        &container_part[..8],
        dataset_id,
        sanitize_identifier(&name.to_lowercase())
    )
}

/// CREATE TABLE statement for a dataset's provisioned table: the kind's
/// base columns followed by the dataset's property columns.
pub fn create_table_ddl(
    kind: &dyn DomainKind,
    table_name: &str,
    properties: &[NewDatasetProperty],
) -> DomainResult<String> {
    let mut columns: Vec<String> = vec!["row_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];

    let base = kind.base_columns();
    for spec in &base {
        columns.push(spec.ddl());
    }

    for property in properties {
        let column_name = sanitize_identifier(&property.name.to_lowercase());
        if base.iter().any(|spec| spec.name == column_name) {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "property.name",
                &format!("'{}' collides with a base column", property.name),
            )));
        }
        let null_clause = if property.required { " NOT NULL" } else { "" };
        columns.push(format!(
            "\"{}\" {}{}",
            column_name,
            property.property_type.sql_type(),
            null_clause
        ));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table_name,
        columns.join(", ")
    ))
}

/// DROP statement used when a dataset is deleted.
pub fn drop_table_ddl(table_name: &str) -> String {
    format!("DROP TABLE IF EXISTS \"{}\"", sanitize_identifier(table_name))
}
