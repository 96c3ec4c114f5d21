use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::domains::visit::types::{
    normalize_sequence_num, parse_sequence_num, sequence_num_from_date, Visit, VisitSequenceMap,
    DAY_FRACTION_DIVISOR, DEMOGRAPHICS_VISIT,
};
use crate::types::TimepointType;

/// A raw imported event identifier before translation: either already a
/// number, or text that may be a number or a visit label.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceValue {
    Number(Decimal),
    Text(String),
}

impl SequenceValue {
    pub fn text(value: &str) -> Self {
        SequenceValue::Text(value.to_string())
    }
}

/// Resolves a whole sequence number to the visit covering it. Injected
/// into the translator so log-visit disambiguation can run without the
/// translator touching the database.
pub trait VisitLookup: Send + Sync {
    fn visit_for_sequence(&self, sequence_num: Decimal) -> Option<Visit>;
}

impl VisitLookup for VisitSequenceMap {
    fn visit_for_sequence(&self, sequence_num: Decimal) -> Option<Visit> {
        self.find_by_sequence(sequence_num).cloned()
    }
}

/// Translates raw imported values (numbers, visit-label strings, dates)
/// into canonical 4-digit-scale sequence numbers for one study/dataset
/// pairing. Pure: the same inputs always produce the same output.
pub struct SequenceNumTranslator {
    timepoint_type: TimepointType,
    start_date: Option<NaiveDate>,
    default_sequence_num: Option<Decimal>,
    // Visit labels are matched case-insensitively; keys are stored folded.
    translate_map: HashMap<String, Decimal>,
    visit_lookup: Option<Arc<dyn VisitLookup>>,
}

impl SequenceNumTranslator {
    pub fn new(
        timepoint_type: TimepointType,
        start_date: Option<NaiveDate>,
        default_sequence_num: Option<Decimal>,
        name_map: HashMap<String, Decimal>,
        visit_lookup: Option<Arc<dyn VisitLookup>>,
    ) -> Self {
        let translate_map = name_map
            .into_iter()
            .map(|(label, seq)| (fold_label(&label), normalize_sequence_num(seq)))
            .collect();

        Self {
            timepoint_type,
            start_date,
            default_sequence_num: default_sequence_num.map(normalize_sequence_num),
            translate_map,
            visit_lookup,
        }
    }

    /// Translator for importing into a demographic dataset: unresolvable
    /// rows land on the demographics sentinel.
    pub fn for_demographic(
        timepoint_type: TimepointType,
        start_date: Option<NaiveDate>,
        name_map: HashMap<String, Decimal>,
        visit_lookup: Option<Arc<dyn VisitLookup>>,
    ) -> Self {
        Self::new(
            timepoint_type,
            start_date,
            Some(DEMOGRAPHICS_VISIT),
            name_map,
            visit_lookup,
        )
    }

    /// Map a raw value plus optional event date to a canonical sequence
    /// number. Returns None when nothing resolves and no fallback applies.
    pub fn translate(
        &self,
        value: Option<&SequenceValue>,
        date: Option<NaiveDate>,
    ) -> Option<Decimal> {
        let mut sequence_num = match value {
            Some(SequenceValue::Number(n)) => Some(*n),
            Some(SequenceValue::Text(s)) => parse_sequence_num(s)
                .or_else(|| self.translate_map.get(&fold_label(s)).copied()),
            None => None,
        };

        if sequence_num.is_none() {
            sequence_num = self.default_sequence_num;
        }

        if sequence_num.is_none() && self.timepoint_type != TimepointType::Visit {
            sequence_num = Some(match date {
                Some(d) => sequence_num_from_date(d),
                None => DEMOGRAPHICS_VISIT,
            });
        }

        let sequence_num = normalize_sequence_num(sequence_num?);
        Some(self.disambiguate_log_visit(sequence_num, date))
    }

    /// Events imported against a whole-number sequence that maps to a log
    /// visit get a date-derived fractional offset so entries from
    /// different days occupy distinct sequence numbers. Same-day events
    /// still collide; the offset saturates after 9999 days.
    fn disambiguate_log_visit(&self, sequence_num: Decimal, date: Option<NaiveDate>) -> Decimal {
        if !sequence_num.fract().is_zero() {
            return sequence_num;
        }
        let Some(lookup) = &self.visit_lookup else {
            return sequence_num;
        };
        let Some(visit) = lookup.visit_for_sequence(sequence_num) else {
            return sequence_num;
        };
        if !visit.is_log_visit() {
            return sequence_num;
        }
        let (Some(start), Some(event_date)) = (self.start_date, date) else {
            return sequence_num;
        };

        let days = (event_date - start).num_days().clamp(0, 9_999);
        let offset = Decimal::from(days) / DAY_FRACTION_DIVISOR;
        normalize_sequence_num(sequence_num + offset)
    }
}

fn fold_label(label: &str) -> String {
    label.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn name_map() -> HashMap<String, Decimal> {
        HashMap::from([
            ("Enrollment".to_string(), dec!(1.0)),
            ("SR".to_string(), dec!(9999.0)),
        ])
    }

    fn log_visit_lookup() -> Arc<dyn VisitLookup> {
        let log_visit = Visit {
            row_id: 1,
            container_id: Uuid::new_v4(),
            label: Some("Study Report".to_string()),
            sequence_num_min: dec!(9999.0000),
            sequence_num_max: dec!(9999.9999),
            protocol_day: None,
            visit_type: Some(crate::domains::visit::types::VisitType::Scheduled),
            chronological_order: 99,
            display_order: 99,
            show_by_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by_user_id: None,
            updated_by_user_id: None,
        };
        Arc::new(VisitSequenceMap::new(vec![log_visit]))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_numeric_string_passthrough() {
        let t = SequenceNumTranslator::new(
            TimepointType::Visit,
            None,
            None,
            HashMap::new(),
            None,
        );
        assert_eq!(
            t.translate(Some(&SequenceValue::text("9999.0000")), None),
            Some(dec!(9999.0000))
        );
        assert_eq!(
            t.translate(Some(&SequenceValue::Number(dec!(2.5))), None),
            Some(dec!(2.5000))
        );
    }

    #[test]
    fn test_visit_label_lookup() {
        let t = SequenceNumTranslator::new(
            TimepointType::Visit,
            None,
            None,
            name_map(),
            None,
        );
        assert_eq!(
            t.translate(Some(&SequenceValue::text("Enrollment")), None),
            Some(dec!(1.0))
        );
        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), None),
            Some(dec!(9999.0))
        );
        assert_eq!(
            t.translate(Some(&SequenceValue::text("enrollment")), None),
            Some(dec!(1.0))
        );
        // Nothing resolvable in a visit-based study
        assert_eq!(t.translate(Some(&SequenceValue::text("Week 52")), None), None);
    }

    #[test]
    fn test_demographic_default_wins_over_date() {
        let t = SequenceNumTranslator::new(
            TimepointType::Date,
            Some(date(2000, 1, 1)),
            Some(dec!(42.0)),
            HashMap::new(),
            None,
        );
        assert_eq!(t.translate(None, None), Some(dec!(42.0)));
        assert_eq!(t.translate(None, Some(date(2001, 6, 15))), Some(dec!(42.0)));
        assert_eq!(
            t.translate(Some(&SequenceValue::text("no-such-visit")), None),
            Some(dec!(42.0))
        );
    }

    #[test]
    fn test_log_visit_date_fraction() {
        let t = SequenceNumTranslator::new(
            TimepointType::Visit,
            Some(date(2000, 1, 1)),
            None,
            name_map(),
            Some(log_visit_lookup()),
        );

        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), Some(date(2000, 1, 2))),
            Some(dec!(9999.0001))
        );
        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), Some(date(2000, 12, 31))),
            Some(dec!(9999.0365))
        );
        // 2000 is a leap year, so 1 Jan 2001 is day 366
        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), Some(date(2001, 1, 1))),
            Some(dec!(9999.0366))
        );
        // Same day as study start keeps the whole number
        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), Some(date(2000, 1, 1))),
            Some(dec!(9999.0000))
        );
        // No date: no disambiguation possible
        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), None),
            Some(dec!(9999.0000))
        );
        // Fractional input is never re-disambiguated
        assert_eq!(
            t.translate(
                Some(&SequenceValue::Number(dec!(9999.5))),
                Some(date(2000, 1, 2))
            ),
            Some(dec!(9999.5000))
        );
    }

    #[test]
    fn test_date_based_study_resolves_from_date() {
        let t = SequenceNumTranslator::new(
            TimepointType::Date,
            Some(date(2000, 1, 1)),
            None,
            HashMap::new(),
            None,
        );
        assert_eq!(
            t.translate(None, Some(date(2013, 4, 9))),
            Some(dec!(20130409.0000))
        );
        assert_eq!(t.translate(None, None), Some(DEMOGRAPHICS_VISIT));
    }

    #[test]
    fn test_offset_saturates_within_log_visit_range() {
        let t = SequenceNumTranslator::new(
            TimepointType::Visit,
            Some(date(2000, 1, 1)),
            None,
            name_map(),
            Some(log_visit_lookup()),
        );
        // ~40 years out: past the 9999-day range, clamps at .9999
        assert_eq!(
            t.translate(Some(&SequenceValue::text("SR")), Some(date(2040, 1, 1))),
            Some(dec!(9999.9999))
        );
    }
}
