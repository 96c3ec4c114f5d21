use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteArguments;
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::dataset::provision::{
    create_table_ddl, drop_table_ddl, sanitize_identifier, table_name_for, DomainKindRegistry,
    STUDY_DATASET_KIND,
};
use crate::domains::dataset::types::{
    Dataset, DatasetEvent, DatasetProperty, DatasetPropertyRow, DatasetRow, DatasetRowData,
    NewDataset,
};
use crate::domains::core::repository::FindById;
use crate::domains::participant::types::parse_date;
use crate::domains::qcstate::types::QCStateSet;
use crate::domains::visit::types::{
    sequence_num_from_storage, sequence_num_to_storage, DEMOGRAPHICS_VISIT,
};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::Validate;

/// Trait defining dataset repository operations
#[async_trait]
pub trait DatasetRepository: FindById<Dataset> + Send + Sync {
    /// Define a dataset and provision its storage table, in one
    /// transaction.
    async fn create(
        &self,
        container_id: Uuid,
        new_dataset: &NewDataset,
        auth: &AuthContext,
    ) -> DomainResult<Dataset>;

    async fn find_by_name(&self, container_id: Uuid, name: &str) -> DomainResult<Dataset>;

    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<Dataset>>;

    async fn properties(
        &self,
        container_id: Uuid,
        dataset_id: i64,
    ) -> DomainResult<Vec<DatasetProperty>>;

    /// Write rows into the dataset's provisioned table. Demographic
    /// datasets pin every row to the demographics sentinel sequence.
    async fn insert_rows(
        &self,
        dataset: &Dataset,
        rows: &[DatasetRowData],
        auth: &AuthContext,
    ) -> DomainResult<u64>;

    /// Distinct (participant, sequence, earliest date) events in this
    /// dataset's rows.
    async fn distinct_events(&self, dataset: &Dataset) -> DomainResult<Vec<DatasetEvent>>;

    /// Distinct non-empty values of one textual column; used to discover
    /// cohort labels in the driving dataset.
    async fn distinct_string_values(
        &self,
        dataset: &Dataset,
        column: &str,
    ) -> DomainResult<Vec<String>>;

    /// Count dataset rows whose QC state falls within the given set.
    async fn count_rows_in_states(
        &self,
        dataset: &Dataset,
        states: &QCStateSet,
    ) -> DomainResult<i64>;

    /// Drop the dataset definition and its provisioned table.
    async fn delete(
        &self,
        container_id: Uuid,
        dataset_id: i64,
        auth: &AuthContext,
    ) -> DomainResult<()>;

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}

/// SQLite implementation for DatasetRepository
#[derive(Clone)]
pub struct SqliteDatasetRepository {
    pool: SqlitePool,
    kinds: DomainKindRegistry,
}

impl SqliteDatasetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            kinds: DomainKindRegistry::default(),
        }
    }

    pub fn with_registry(pool: SqlitePool, kinds: DomainKindRegistry) -> Self {
        Self { pool, kinds }
    }
}

fn bind_json<'q>(
    q: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q JsonValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        JsonValue::Null => q.bind(None::<String>),
        JsonValue::Bool(b) => q.bind(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else {
                q.bind(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => q.bind(s.as_str()),
        // Arrays and objects are stored as their JSON text
        other => q.bind(other.to_string()),
    }
}

#[async_trait]
impl FindById<Dataset> for SqliteDatasetRepository {
    async fn find_by_id(&self, container_id: Uuid, dataset_id: i64) -> DomainResult<Dataset> {
        let row = query_as::<_, DatasetRow>(
            "SELECT * FROM dataset WHERE container_id = ? AND dataset_id = ?",
        )
        .bind(container_id.to_string())
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("Dataset", dataset_id))?;

        row.into_entity()
    }
}

#[async_trait]
impl DatasetRepository for SqliteDatasetRepository {
    async fn create(
        &self,
        container_id: Uuid,
        new_dataset: &NewDataset,
        auth: &AuthContext,
    ) -> DomainResult<Dataset> {
        new_dataset.validate()?;

        let duplicate: Option<i64> = query_scalar(
            "SELECT dataset_id FROM dataset
             WHERE container_id = ? AND (dataset_id = ? OR name = ?)",
        )
        .bind(container_id.to_string())
        .bind(new_dataset.dataset_id)
        .bind(&new_dataset.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        if duplicate.is_some() {
            return Err(DomainError::Validation(ValidationError::unique("name")));
        }

        let kind = self.kinds.get(STUDY_DATASET_KIND)?;
        let table_name = table_name_for(container_id, new_dataset.dataset_id, &new_dataset.name);
        let table_ddl = create_table_ddl(kind.as_ref(), &table_name, &new_dataset.properties)?;

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        query(
            "INSERT INTO dataset
             (dataset_id, container_id, name, label, category, demographic,
              key_property_name, visit_date_property_name, table_name,
              created_at, updated_at, created_by_user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_dataset.dataset_id)
        .bind(container_id.to_string())
        .bind(&new_dataset.name)
        .bind(&new_dataset.label)
        .bind(&new_dataset.category)
        .bind(new_dataset.demographic as i64)
        .bind(&new_dataset.key_property_name)
        .bind(&new_dataset.visit_date_property_name)
        .bind(&table_name)
        .bind(&now)
        .bind(&now)
        .bind(auth.user_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        for property in &new_dataset.properties {
            query(
                "INSERT INTO dataset_property (container_id, dataset_id, name, property_type, required)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(container_id.to_string())
            .bind(new_dataset.dataset_id)
            .bind(sanitize_identifier(&property.name.to_lowercase()))
            .bind(property.property_type.as_str())
            .bind(property.required as i64)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        query(&table_ddl).execute(&mut *tx).await.map_err(DbError::from)?;
        for index_ddl in kind.index_ddl(&table_name) {
            query(&index_ddl).execute(&mut *tx).await.map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;
        debug!(
            "provisioned dataset {} ({}) in {}",
            new_dataset.dataset_id, table_name, container_id
        );

        self.find_by_id(container_id, new_dataset.dataset_id).await
    }

    async fn find_by_name(&self, container_id: Uuid, name: &str) -> DomainResult<Dataset> {
        let row = query_as::<_, DatasetRow>(
            "SELECT * FROM dataset WHERE container_id = ? AND name = ?",
        )
        .bind(container_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("Dataset", name))?;

        row.into_entity()
    }

    async fn find_all(&self, container_id: Uuid) -> DomainResult<Vec<Dataset>> {
        let rows = query_as::<_, DatasetRow>(
            "SELECT * FROM dataset WHERE container_id = ? ORDER BY dataset_id",
        )
        .bind(container_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(DatasetRow::into_entity).collect()
    }

    async fn properties(
        &self,
        container_id: Uuid,
        dataset_id: i64,
    ) -> DomainResult<Vec<DatasetProperty>> {
        let rows = query_as::<_, DatasetPropertyRow>(
            "SELECT * FROM dataset_property
             WHERE container_id = ? AND dataset_id = ? ORDER BY row_id",
        )
        .bind(container_id.to_string())
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(DatasetPropertyRow::into_entity).collect()
    }

    async fn insert_rows(
        &self,
        dataset: &Dataset,
        rows: &[DatasetRowData],
        _auth: &AuthContext,
    ) -> DomainResult<u64> {
        let properties = self.properties(dataset.container_id, dataset.dataset_id).await?;

        let property_columns: Vec<String> = properties
            .iter()
            .map(|p| sanitize_identifier(&p.name.to_lowercase()))
            .collect();

        let mut columns = vec![
            "participant_id".to_string(),
            "sequence_num".to_string(),
            "_key".to_string(),
            "visit_date".to_string(),
            "created".to_string(),
            "modified".to_string(),
        ];
        columns.extend(property_columns.iter().map(|c| format!("\"{}\"", c)));

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO \"{}\" ({}) VALUES ({})",
            sanitize_identifier(&dataset.table_name),
            columns.join(", "),
            placeholders
        );

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut written = 0u64;

        for row in rows {
            // Demographic datasets use the sentinel sequence by convention
            let sequence_num = if dataset.demographic {
                DEMOGRAPHICS_VISIT
            } else {
                row.sequence_num
            };

            let mut q = query(&sql)
                .bind(&row.participant_id)
                .bind(sequence_num_to_storage(sequence_num))
                .bind(row.key.as_deref().unwrap_or(""))
                .bind(row.visit_date.map(|d| d.to_string()))
                .bind(&now)
                .bind(&now);

            for property in &properties {
                let column = sanitize_identifier(&property.name.to_lowercase());
                match row.values.get(&column) {
                    Some(value) => q = bind_json(q, value),
                    None => q = q.bind(None::<String>),
                }
            }

            let result = q.execute(&mut *tx).await.map_err(DbError::from)?;
            written += result.rows_affected();
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(written)
    }

    async fn distinct_events(&self, dataset: &Dataset) -> DomainResult<Vec<DatasetEvent>> {
        let sql = format!(
            "SELECT participant_id, sequence_num, MIN(visit_date) AS visit_date
             FROM \"{}\"
             GROUP BY participant_id, sequence_num
             ORDER BY participant_id, sequence_num",
            sanitize_identifier(&dataset.table_name)
        );

        let rows: Vec<(String, f64, Option<String>)> = query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter()
            .map(|(participant_id, sequence_num, visit_date)| {
                let visit_date = match &visit_date {
                    Some(s) => Some(parse_date(s, "visit_date")?),
                    None => None,
                };
                Ok(DatasetEvent {
                    participant_id,
                    sequence_num: sequence_num_from_storage(sequence_num, "sequence_num")?,
                    visit_date,
                })
            })
            .collect()
    }

    async fn distinct_string_values(
        &self,
        dataset: &Dataset,
        column: &str,
    ) -> DomainResult<Vec<String>> {
        let column = sanitize_identifier(&column.to_lowercase());
        let sql = format!(
            "SELECT DISTINCT \"{0}\" FROM \"{1}\"
             WHERE \"{0}\" IS NOT NULL AND \"{0}\" <> ''
             ORDER BY \"{0}\"",
            column,
            sanitize_identifier(&dataset.table_name)
        );

        query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DomainError::Database(DbError::from(e)))
    }

    async fn count_rows_in_states(
        &self,
        dataset: &Dataset,
        states: &QCStateSet,
    ) -> DomainResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE {}",
            sanitize_identifier(&dataset.table_name),
            states.state_in_clause("qc_state_id")
        );

        let count: i64 = query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(count)
    }

    async fn delete(
        &self,
        container_id: Uuid,
        dataset_id: i64,
        _auth: &AuthContext,
    ) -> DomainResult<()> {
        let dataset = self.find_by_id(container_id, dataset_id).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        query("DELETE FROM dataset_property WHERE container_id = ? AND dataset_id = ?")
            .bind(container_id.to_string())
            .bind(dataset_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        query("DELETE FROM dataset WHERE container_id = ? AND dataset_id = ?")
            .bind(container_id.to_string())
            .bind(dataset_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        query(&drop_table_ddl(&dataset.table_name))
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let table_names: Vec<String> =
            query_scalar("SELECT table_name FROM dataset WHERE container_id = ?")
                .bind(container_id.to_string())
                .fetch_all(&mut **tx)
                .await
                .map_err(DbError::from)?;

        for table_name in &table_names {
            query(&drop_table_ddl(table_name))
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
        }

        query("DELETE FROM dataset_property WHERE container_id = ?")
            .bind(container_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        let result = query("DELETE FROM dataset WHERE container_id = ?")
            .bind(container_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::db::init_memory_pool;
    use crate::domains::dataset::types::NewDatasetProperty;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    #[tokio::test]
    async fn test_provision_insert_and_query() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteDatasetRepository::new(pool.clone());
        let container = Uuid::new_v4();
        let auth = admin();

        let dataset = repo
            .create(
                container,
                &NewDataset::named(5001, "cohort_assignment")
                    .with_property(NewDatasetProperty::text("cohort")),
                &auth,
            )
            .await
            .unwrap();
        assert_eq!(dataset.dataset_id, 5001);

        let rows = vec![
            DatasetRowData::new("PT-1", dec!(1)).with_value("cohort", json!("Negative")),
            DatasetRowData::new("PT-1", dec!(2)).with_value("cohort", json!("Positive")),
            DatasetRowData::new("PT-2", dec!(1)).with_value("cohort", JsonValue::Null),
        ];
        assert_eq!(repo.insert_rows(&dataset, &rows, &auth).await.unwrap(), 3);

        let events = repo.distinct_events(&dataset).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].participant_id, "PT-1");
        assert_eq!(events[0].sequence_num, dec!(1));

        let labels = repo.distinct_string_values(&dataset, "cohort").await.unwrap();
        assert_eq!(labels, vec!["Negative".to_string(), "Positive".to_string()]);

        // Rows carry no QC state yet: only unmarked-inclusive sets match
        let nothing = QCStateSet::new("Nothing", &[], false);
        assert_eq!(repo.count_rows_in_states(&dataset, &nothing).await.unwrap(), 0);
        let unmarked = QCStateSet::new("Unmarked", &[], true);
        assert_eq!(repo.count_rows_in_states(&dataset, &unmarked).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_demographic_rows_pin_to_sentinel() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteDatasetRepository::new(pool.clone());
        let container = Uuid::new_v4();
        let auth = admin();

        let dataset = repo
            .create(
                container,
                &NewDataset::named(1, "demographics")
                    .demographic()
                    .with_property(NewDatasetProperty::text("gender")),
                &auth,
            )
            .await
            .unwrap();

        let rows = vec![DatasetRowData::new("PT-1", dec!(3)).with_value("gender", json!("f"))];
        repo.insert_rows(&dataset, &rows, &auth).await.unwrap();

        let events = repo.distinct_events(&dataset).await.unwrap();
        assert_eq!(events[0].sequence_num, DEMOGRAPHICS_VISIT);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_and_delete_drops_table() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteDatasetRepository::new(pool.clone());
        let container = Uuid::new_v4();
        let auth = admin();

        let dataset = repo
            .create(container, &NewDataset::named(1, "labs"), &auth)
            .await
            .unwrap();

        assert!(repo
            .create(container, &NewDataset::named(2, "labs"), &auth)
            .await
            .is_err());

        repo.delete(container, 1, &auth).await.unwrap();

        let remaining: Option<String> = query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(&dataset.table_name)
        .fetch_optional(&pool)
        .await
        .unwrap();
        assert!(remaining.is_none());
    }
}
