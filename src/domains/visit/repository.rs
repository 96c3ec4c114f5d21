use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use rust_decimal::Decimal;
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::repository::FindById;
use crate::domains::visit::types::{
    normalize_sequence_num, sequence_num_to_storage, NewVisit, UpdateVisit, Visit,
    VisitRow, VisitSequenceMap,
};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::Validate;

/// Ordering of visit listings: the chronological order drives
/// reconciliation, the display order drives UI grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    Chronological,
    Display,
    Sequence,
}

impl VisitOrder {
    fn order_by(&self) -> &'static str {
        match self {
            VisitOrder::Chronological => "chronological_order, sequence_num_min",
            VisitOrder::Display => "display_order, sequence_num_min",
            VisitOrder::Sequence => "sequence_num_min",
        }
    }
}

/// Trait defining visit repository operations
#[async_trait]
pub trait VisitRepository: FindById<Visit> + Send + Sync {
    /// Define a visit. Fails when its sequence range overlaps an existing
    /// visit in the container.
    async fn create(
        &self,
        container_id: Uuid,
        new_visit: &NewVisit,
        auth: &AuthContext,
    ) -> DomainResult<Visit>;

    async fn find_all(&self, container_id: Uuid, order: VisitOrder) -> DomainResult<Vec<Visit>>;

    /// Sequence-ordered map resolving sequence numbers to covering visits.
    async fn sequence_map(&self, container_id: Uuid) -> DomainResult<VisitSequenceMap>;

    /// True when [min, max] overlaps any other visit in the container.
    async fn is_overlapping(
        &self,
        container_id: Uuid,
        sequence_num_min: Decimal,
        sequence_num_max: Decimal,
        exclude_row_id: Option<i64>,
    ) -> DomainResult<bool>;

    async fn update(
        &self,
        container_id: Uuid,
        row_id: i64,
        update: &UpdateVisit,
        auth: &AuthContext,
    ) -> DomainResult<Visit>;

    /// Delete a visit, unhooking any participant/visit rows that pointed
    /// at it.
    async fn delete(&self, container_id: Uuid, row_id: i64, auth: &AuthContext)
        -> DomainResult<()>;

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}

/// SQLite implementation for VisitRepository
#[derive(Clone)]
pub struct SqliteVisitRepository {
    pool: SqlitePool,
}

impl SqliteVisitRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FindById<Visit> for SqliteVisitRepository {
    async fn find_by_id(&self, container_id: Uuid, row_id: i64) -> DomainResult<Visit> {
        let row = query_as::<_, VisitRow>(
            "SELECT * FROM visit WHERE container_id = ? AND row_id = ?",
        )
        .bind(container_id.to_string())
        .bind(row_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::not_found("Visit", row_id))?;

        row.into_entity()
    }
}

#[async_trait]
impl VisitRepository for SqliteVisitRepository {
    async fn create(
        &self,
        container_id: Uuid,
        new_visit: &NewVisit,
        auth: &AuthContext,
    ) -> DomainResult<Visit> {
        new_visit.validate()?;

        let sequence_num_min = normalize_sequence_num(new_visit.sequence_num_min);
        let sequence_num_max = normalize_sequence_num(new_visit.sequence_num_max);

        if self
            .is_overlapping(container_id, sequence_num_min, sequence_num_max, None)
            .await?
        {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "sequence_num_min",
                &format!(
                    "Sequence range [{}, {}] overlaps an existing visit",
                    sequence_num_min, sequence_num_max
                ),
            )));
        }

        let now = Utc::now().to_rfc3339();
        let result = query(
            "INSERT INTO visit
             (container_id, label, sequence_num_min, sequence_num_max, protocol_day, type_code,
              chronological_order, display_order, show_by_default, created_at, updated_at, created_by_user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(container_id.to_string())
        .bind(&new_visit.label)
        .bind(sequence_num_to_storage(sequence_num_min))
        .bind(sequence_num_to_storage(sequence_num_max))
        .bind(new_visit.protocol_day)
        .bind(new_visit.type_code.as_ref().map(|c| c.to_uppercase()))
        .bind(new_visit.chronological_order)
        .bind(new_visit.display_order)
        .bind(new_visit.show_by_default as i64)
        .bind(&now)
        .bind(&now)
        .bind(auth.user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        debug!(
            "created visit [{}, {}] in {}",
            sequence_num_min, sequence_num_max, container_id
        );
        self.find_by_id(container_id, result.last_insert_rowid()).await
    }

    async fn find_all(&self, container_id: Uuid, order: VisitOrder) -> DomainResult<Vec<Visit>> {
        let sql = format!(
            "SELECT * FROM visit WHERE container_id = ? ORDER BY {}",
            order.order_by()
        );

        let rows = query_as::<_, VisitRow>(&sql)
            .bind(container_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(VisitRow::into_entity).collect()
    }

    async fn sequence_map(&self, container_id: Uuid) -> DomainResult<VisitSequenceMap> {
        let visits = self.find_all(container_id, VisitOrder::Sequence).await?;
        Ok(VisitSequenceMap::new(visits))
    }

    async fn is_overlapping(
        &self,
        container_id: Uuid,
        sequence_num_min: Decimal,
        sequence_num_max: Decimal,
        exclude_row_id: Option<i64>,
    ) -> DomainResult<bool> {
        // New visits pass no row id to exclude; 0 never matches
        let exclude = exclude_row_id.unwrap_or(0);

        let overlaps: i64 = query_scalar(
            "SELECT COUNT(*) FROM visit
             WHERE container_id = ?
               AND sequence_num_max >= ?
               AND sequence_num_min <= ?
               AND row_id <> ?",
        )
        .bind(container_id.to_string())
        .bind(sequence_num_to_storage(sequence_num_min))
        .bind(sequence_num_to_storage(sequence_num_max))
        .bind(exclude)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(overlaps != 0)
    }

    async fn update(
        &self,
        container_id: Uuid,
        row_id: i64,
        update: &UpdateVisit,
        auth: &AuthContext,
    ) -> DomainResult<Visit> {
        update.validate()?;
        let current = self.find_by_id(container_id, row_id).await?;

        query(
            "UPDATE visit
             SET label = ?, protocol_day = ?, type_code = ?,
                 chronological_order = ?, display_order = ?, show_by_default = ?,
                 updated_at = ?, updated_by_user_id = ?
             WHERE container_id = ? AND row_id = ?",
        )
        .bind(update.label.as_ref().or(current.label.as_ref()))
        .bind(update.protocol_day.or(current.protocol_day))
        .bind(
            update
                .type_code
                .as_ref()
                .map(|c| c.to_uppercase())
                .or_else(|| current.visit_type.map(|t| t.code().to_string())),
        )
        .bind(update.chronological_order.unwrap_or(current.chronological_order))
        .bind(update.display_order.unwrap_or(current.display_order))
        .bind(update.show_by_default.unwrap_or(current.show_by_default) as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(auth.user_id.to_string())
        .bind(container_id.to_string())
        .bind(row_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(container_id, row_id).await
    }

    async fn delete(
        &self,
        container_id: Uuid,
        row_id: i64,
        _auth: &AuthContext,
    ) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        query(
            "UPDATE participant_visit SET visit_row_id = NULL
             WHERE container_id = ? AND visit_row_id = ?",
        )
        .bind(container_id.to_string())
        .bind(row_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let result = query("DELETE FROM visit WHERE container_id = ? AND row_id = ?")
            .bind(container_id.to_string())
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("Visit", row_id));
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn delete_for_container_with_tx<'t>(
        &self,
        container_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query("DELETE FROM visit WHERE container_id = ?")
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
    use rust_decimal_macros::dec;

    fn admin() -> AuthContext {
        AuthContext::new(Uuid::new_v4(), UserRole::Admin)
    }

    #[tokio::test]
    async fn test_create_and_overlap_detection() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteVisitRepository::new(pool);
        let container = Uuid::new_v4();
        let auth = admin();

        let enrollment = repo
            .create(container, &NewVisit::at_sequence(dec!(1), Some("Enrollment")), &auth)
            .await
            .unwrap();
        assert_eq!(enrollment.sequence_num_min, dec!(1));

        let mut month_one = NewVisit::at_sequence(dec!(2), Some("Month 1"));
        month_one.sequence_num_max = dec!(2.9999);
        repo.create(container, &month_one, &auth).await.unwrap();

        // Overlapping range is rejected
        let mut overlapping = NewVisit::at_sequence(dec!(2.5), None);
        overlapping.sequence_num_max = dec!(3.5);
        assert!(repo.create(container, &overlapping, &auth).await.is_err());

        // Inverted range is rejected before touching the database
        let mut inverted = NewVisit::at_sequence(dec!(5), None);
        inverted.sequence_num_max = dec!(4);
        assert!(repo.create(container, &inverted, &auth).await.is_err());

        // Unknown type code fails fast
        let mut bad_code = NewVisit::at_sequence(dec!(10), None);
        bad_code.type_code = Some("Z".to_string());
        assert!(repo.create(container, &bad_code, &auth).await.is_err());
    }

    #[tokio::test]
    async fn test_sequence_map_resolution() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqliteVisitRepository::new(pool);
        let container = Uuid::new_v4();
        let auth = admin();

        let mut visit = NewVisit::at_sequence(dec!(1), Some("Enrollment"));
        visit.sequence_num_max = dec!(1.9999);
        repo.create(container, &visit, &auth).await.unwrap();

        let mut log_visit = NewVisit::at_sequence(dec!(9999), Some("Study Report"));
        log_visit.sequence_num_max = dec!(9999.9999);
        repo.create(container, &log_visit, &auth).await.unwrap();

        let map = repo.sequence_map(container).await.unwrap();
        assert_eq!(
            map.find_by_sequence(dec!(1.5)).unwrap().label.as_deref(),
            Some("Enrollment")
        );
        let resolved = map.find_by_sequence(dec!(9999.0042)).unwrap();
        assert!(resolved.is_log_visit());
        assert!(map.find_by_sequence(dec!(42)).is_none());
    }
}
