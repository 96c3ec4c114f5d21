use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{common, Validate, ValidationBuilder};

/// Sequence numbers carry exactly this many decimal digits of scale.
pub const SEQUENCE_NUM_SCALE: u32 = 4;

/// Sentinel sequence number for demographic datasets (one row per
/// participant, no visit axis).
pub const DEMOGRAPHICS_VISIT: Decimal = Decimal::NEGATIVE_ONE;

/// Designated sequence value for repeating/unscheduled log visits.
/// Events landing on it are disambiguated by a date-derived fraction.
pub const LOG_VISIT_SEQUENCE: Decimal = dec!(9999);

/// Divisor turning a day offset into the log-visit fractional part:
/// one day becomes 0.0001, giving 9999 days of disambiguation range.
pub const DAY_FRACTION_DIVISOR: Decimal = dec!(10000);

/// Round to canonical 4-digit scale, half-up.
pub fn normalize_sequence_num(value: Decimal) -> Decimal {
    let mut normalized =
        value.round_dp_with_strategy(SEQUENCE_NUM_SCALE, RoundingStrategy::MidpointAwayFromZero);
    normalized.rescale(SEQUENCE_NUM_SCALE);
    normalized
}

/// Parse a sequence number from its text form.
pub fn parse_sequence_num(value: &str) -> Option<Decimal> {
    value.trim().parse::<Decimal>().ok().map(normalize_sequence_num)
}

/// Display form with trailing zeros trimmed: 9999.0000 renders as "9999".
pub fn format_sequence_num(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Composite `ptid|sequencenum` key identifying one participant event.
/// The sequence number is rendered at full 4-digit scale so the key is
/// stable across numeric representations.
pub fn participant_sequence_num(participant_id: &str, sequence_num: Decimal) -> String {
    format!("{}|{}", participant_id, normalize_sequence_num(sequence_num))
}

/// Fixed-point encoding of a calendar date: yyyymmdd. Date-based studies
/// derive their event axis from this.
pub fn sequence_num_from_date(date: NaiveDate) -> Decimal {
    let encoded = date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64;
    normalize_sequence_num(Decimal::from(encoded))
}

/// Lossy-free storage form: NUMERIC columns hold sequence numbers as
/// REALs, which are exact for 4-digit-scale values in this range.
pub fn sequence_num_to_storage(value: Decimal) -> f64 {
    normalize_sequence_num(value).to_f64().unwrap_or_default()
}

pub fn sequence_num_from_storage(value: f64, field: &str) -> DomainResult<Decimal> {
    Decimal::from_f64(value)
        .map(normalize_sequence_num)
        .ok_or_else(|| {
            DomainError::Validation(ValidationError::format(
                field,
                &format!("Value {} is not a valid sequence number", value),
            ))
        })
}

/// Visit type code, one character, fixed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitType {
    Screening,
    PreBaseline,
    Baseline,
    Scheduled,
    Optional,
    RequiredByTermination,
    Termination,
}

impl VisitType {
    pub fn code(&self) -> &'static str {
        match self {
            VisitType::Screening => "X",
            VisitType::PreBaseline => "P",
            VisitType::Baseline => "B",
            VisitType::Scheduled => "S",
            VisitType::Optional => "O",
            VisitType::RequiredByTermination => "R",
            VisitType::Termination => "T",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_uppercase().as_str() {
            "X" => Some(VisitType::Screening),
            "P" => Some(VisitType::PreBaseline),
            "B" => Some(VisitType::Baseline),
            "S" => Some(VisitType::Scheduled),
            "O" => Some(VisitType::Optional),
            "R" => Some(VisitType::RequiredByTermination),
            "T" => Some(VisitType::Termination),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VisitType::Screening => "Screening",
            VisitType::PreBaseline => "Pre-baseline",
            VisitType::Baseline => "Baseline",
            VisitType::Scheduled => "Scheduled follow-up",
            VisitType::Optional => "Optional follow-up",
            VisitType::RequiredByTermination => "Required by termination",
            VisitType::Termination => "Termination",
        }
    }
}

/// Visit entity - one scheduled event in a study's timeline, covering the
/// sequence-number range [sequence_num_min, sequence_num_max].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub row_id: i64,
    pub container_id: Uuid,
    pub label: Option<String>,
    pub sequence_num_min: Decimal,
    pub sequence_num_max: Decimal,
    pub protocol_day: Option<i64>,
    pub visit_type: Option<VisitType>,
    pub chronological_order: i64,
    pub display_order: i64,
    pub show_by_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
}

impl Visit {
    pub fn contains_sequence(&self, sequence_num: Decimal) -> bool {
        self.sequence_num_min <= sequence_num && sequence_num <= self.sequence_num_max
    }

    /// Log visits collect repeating/unscheduled events at the designated
    /// sequence value.
    pub fn is_log_visit(&self) -> bool {
        self.sequence_num_min == LOG_VISIT_SEQUENCE
    }

    pub fn display_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None if self.sequence_num_min == self.sequence_num_max => {
                format_sequence_num(self.sequence_num_min)
            }
            None => format!(
                "{} - {}",
                format_sequence_num(self.sequence_num_min),
                format_sequence_num(self.sequence_num_max)
            ),
        }
    }
}

/// NewVisit DTO - used when defining a visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVisit {
    pub label: Option<String>,
    pub sequence_num_min: Decimal,
    pub sequence_num_max: Decimal,
    pub protocol_day: Option<i64>,
    pub type_code: Option<String>,
    pub chronological_order: i64,
    pub display_order: i64,
    pub show_by_default: bool,
}

impl NewVisit {
    /// Single-point visit at one sequence number.
    pub fn at_sequence(sequence_num: Decimal, label: Option<&str>) -> Self {
        Self {
            label: label.map(|s| s.to_string()),
            sequence_num_min: sequence_num,
            sequence_num_max: sequence_num,
            protocol_day: None,
            type_code: None,
            chronological_order: 0,
            display_order: 0,
            show_by_default: true,
        }
    }
}

impl Validate for NewVisit {
    fn validate(&self) -> DomainResult<()> {
        if let Some(label) = &self.label {
            ValidationBuilder::new("label", Some(label.clone()))
                .min_length(1)
                .max_length(200)
                .validate()?;
        }
        if let Some(code) = &self.type_code {
            common::validate_visit_type_code(code)?;
        }
        common::validate_sequence_range(
            normalize_sequence_num(self.sequence_num_min),
            normalize_sequence_num(self.sequence_num_max),
        )
    }
}

/// UpdateVisit DTO - used when editing a visit definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVisit {
    pub label: Option<String>,
    pub protocol_day: Option<i64>,
    pub type_code: Option<String>,
    pub chronological_order: Option<i64>,
    pub display_order: Option<i64>,
    pub show_by_default: Option<bool>,
}

impl Validate for UpdateVisit {
    fn validate(&self) -> DomainResult<()> {
        if let Some(label) = &self.label {
            ValidationBuilder::new("label", Some(label.clone()))
                .min_length(1)
                .max_length(200)
                .validate()?;
        }
        if let Some(code) = &self.type_code {
            common::validate_visit_type_code(code)?;
        }
        Ok(())
    }
}

/// VisitRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct VisitRow {
    pub row_id: i64,
    pub container_id: String,
    pub label: Option<String>,
    pub sequence_num_min: f64,
    pub sequence_num_max: f64,
    pub protocol_day: Option<i64>,
    pub type_code: Option<String>,
    pub chronological_order: i64,
    pub display_order: i64,
    pub show_by_default: i64,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
}

impl VisitRow {
    /// Convert database row to domain entity
    pub fn into_entity(self) -> DomainResult<Visit> {
        let visit_type = match &self.type_code {
            Some(code) => Some(VisitType::from_code(code).ok_or_else(|| {
                DomainError::Validation(ValidationError::invalid_value(
                    "type_code",
                    &format!("Unknown visit type code: {}", code),
                ))
            })?),
            None => None,
        };

        Ok(Visit {
            row_id: self.row_id,
            container_id: parse_uuid(&self.container_id, "container_id")?,
            label: self.label,
            sequence_num_min: sequence_num_from_storage(self.sequence_num_min, "sequence_num_min")?,
            sequence_num_max: sequence_num_from_storage(self.sequence_num_max, "sequence_num_max")?,
            protocol_day: self.protocol_day,
            visit_type,
            chronological_order: self.chronological_order,
            display_order: self.display_order,
            show_by_default: self.show_by_default != 0,
            created_at: parse_datetime(&self.created_at, "created_at")?,
            updated_at: parse_datetime(&self.updated_at, "updated_at")?,
            created_by_user_id: parse_optional_uuid(&self.created_by_user_id, "created_by_user_id")?,
            updated_by_user_id: parse_optional_uuid(&self.updated_by_user_id, "updated_by_user_id")?,
        })
    }
}

pub(crate) fn parse_uuid(value: &str, field: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field,
            &format!("Invalid UUID format: {}", value),
        ))
    })
}

pub(crate) fn parse_optional_uuid(value: &Option<String>, field: &str) -> DomainResult<Option<Uuid>> {
    match value {
        Some(s) => parse_uuid(s, field).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn parse_datetime(value: &str, field: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field,
                &format!("Invalid RFC3339 format: {}", value),
            ))
        })
}

/// Sequence-ordered map of a study's visits, keyed by each visit's
/// sequence_num_min. Resolves an arbitrary sequence number to the visit
/// whose range covers it, with negative-result memoization left to the
/// caller (lookups are cheap BTreeMap probes).
#[derive(Debug, Clone, Default)]
pub struct VisitSequenceMap {
    by_min: BTreeMap<Decimal, Visit>,
}

impl VisitSequenceMap {
    pub fn new(visits: impl IntoIterator<Item = Visit>) -> Self {
        let mut by_min = BTreeMap::new();
        for visit in visits {
            by_min.insert(visit.sequence_num_min, visit);
        }
        Self { by_min }
    }

    pub fn is_empty(&self) -> bool {
        self.by_min.is_empty()
    }

    /// Find the visit whose [min, max] range covers the sequence number.
    pub fn find_by_sequence(&self, sequence_num: Decimal) -> Option<&Visit> {
        let seq = normalize_sequence_num(sequence_num);
        if let Some(exact) = self.by_min.get(&seq) {
            return Some(exact);
        }
        let (_, candidate) = self.by_min.range(..=seq).next_back()?;
        candidate.contains_sequence(seq).then_some(candidate)
    }

    pub fn visits(&self) -> impl Iterator<Item = &Visit> {
        self.by_min.values()
    }
}
