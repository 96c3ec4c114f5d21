use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::visit::types::parse_uuid;
use crate::errors::DomainResult;
use crate::validation::{Validate, ValidationBuilder};

/// Quality-control state applied to imported dataset rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QCState {
    pub row_id: i64,
    pub container_id: Uuid,
    pub label: String,
    pub description: Option<String>,
    pub public_data: bool,
}

/// NewQCState DTO
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQCState {
    pub label: String,
    pub description: Option<String>,
    pub public_data: bool,
}

impl Validate for NewQCState {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("label", Some(self.label.clone()))
            .required()
            .min_length(1)
            .max_length(64)
            .validate()
    }
}

/// QCStateRow - SQLite row representation
#[derive(Debug, Clone, FromRow)]
pub struct QCStateRow {
    pub row_id: i64,
    pub container_id: String,
    pub label: String,
    pub description: Option<String>,
    pub public_data: i64,
}

impl QCStateRow {
    pub fn into_entity(self) -> DomainResult<QCState> {
        Ok(QCState {
            row_id: self.row_id,
            container_id: parse_uuid(&self.container_id, "container_id")?,
            label: self.label,
            description: self.description,
            public_data: self.public_data != 0,
        })
    }
}

/// A named grouping of QC states used to filter dataset rows: the public
/// states, the private states, all states, or a single state.
///
/// Equality is set-equality of the member state ids plus the
/// include-unmarked flag; labels play no part in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QCStateSet {
    label: String,
    state_ids: BTreeSet<i64>,
    include_unmarked: bool,
}

impl PartialEq for QCStateSet {
    fn eq(&self, other: &Self) -> bool {
        self.state_ids == other.state_ids && self.include_unmarked == other.include_unmarked
    }
}

impl Eq for QCStateSet {}

impl QCStateSet {
    pub fn new(label: &str, states: &[QCState], include_unmarked: bool) -> Self {
        Self {
            label: label.to_string(),
            state_ids: states.iter().map(|s| s.row_id).collect(),
            include_unmarked,
        }
    }

    /// States flagged as public/approved. Rows never assigned a QC state
    /// count as public when `blank_is_public` is set for the study.
    pub fn public_states(states: &[QCState], blank_is_public: bool) -> Self {
        let members: Vec<QCState> = states.iter().filter(|s| s.public_data).cloned().collect();
        Self::new("Public/approved data", &members, blank_is_public)
    }

    /// States flagged as private/non-approved.
    pub fn private_states(states: &[QCState], blank_is_public: bool) -> Self {
        let members: Vec<QCState> = states.iter().filter(|s| !s.public_data).cloned().collect();
        Self::new("Private/non-approved data", &members, !blank_is_public)
    }

    /// Every state, marked or not.
    pub fn all_states(states: &[QCState]) -> Self {
        Self::new("All data", states, true)
    }

    pub fn singleton(state: &QCState) -> Self {
        Self::new(&state.label, std::slice::from_ref(state), false)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state_ids(&self) -> &BTreeSet<i64> {
        &self.state_ids
    }

    pub fn include_unmarked(&self) -> bool {
        self.include_unmarked
    }

    pub fn is_empty(&self) -> bool {
        self.state_ids.is_empty() && !self.include_unmarked
    }

    /// SQL predicate selecting rows whose QC state column falls in this
    /// set. The empty, exclude-unmarked set matches nothing.
    pub fn state_in_clause(&self, column: &str) -> String {
        if self.is_empty() {
            return "0 = 1".to_string();
        }

        if self.state_ids.is_empty() {
            return format!("({} IS NULL)", column);
        }

        let ids = self
            .state_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        if self.include_unmarked {
            format!("({} IN ({}) OR {} IS NULL)", column, ids, column)
        } else {
            format!("({} IN ({}))", column, ids)
        }
    }

    /// Stable URL form: sorted ids, with a trailing marker when unmarked
    /// rows are included. Round-trips through `from_form_value`.
    pub fn form_value(&self) -> String {
        let mut parts: Vec<String> = self.state_ids.iter().map(|id| id.to_string()).collect();
        if self.include_unmarked {
            parts.push("unmarked".to_string());
        }
        parts.join(",")
    }

    pub fn from_form_value(label: &str, value: &str, states: &[QCState]) -> Self {
        let mut include_unmarked = false;
        let mut state_ids = BTreeSet::new();

        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("unmarked") {
                include_unmarked = true;
            } else if let Ok(id) = part.parse::<i64>() {
                if states.iter().any(|s| s.row_id == id) {
                    state_ids.insert(id);
                }
            }
        }

        Self {
            label: label.to_string(),
            state_ids,
            include_unmarked,
        }
    }

    /// The filter choices offered for a study's states: the public set
    /// (when it has more than one member or includes unmarked rows), the
    /// private set (when it has more than one member), all states, then a
    /// singleton per state.
    pub fn selectable_sets(states: &[QCState], blank_is_public: bool) -> Vec<QCStateSet> {
        let mut sets = Vec::new();

        let public = Self::public_states(states, blank_is_public);
        if public.state_ids.len() > 1 || public.include_unmarked {
            sets.push(public);
        }

        let private = Self::private_states(states, blank_is_public);
        if private.state_ids.len() > 1 {
            sets.push(private);
        }

        sets.push(Self::all_states(states));

        for state in states {
            sets.push(Self::singleton(state));
        }

        sets
    }
}

impl std::fmt::Display for QCStateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(row_id: i64, label: &str, public_data: bool) -> QCState {
        QCState {
            row_id,
            container_id: Uuid::nil(),
            label: label.to_string(),
            description: None,
            public_data,
        }
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let set = QCStateSet::new("Nothing", &[], false);
        assert_eq!(set.state_in_clause("QCState"), "0 = 1");
    }

    #[test]
    fn test_in_clause_shapes() {
        let states = [state(1, "Approved", true), state(3, "Pending", false)];

        let marked = QCStateSet::new("Marked", &states, false);
        assert_eq!(marked.state_in_clause("QCState"), "(QCState IN (1, 3))");

        let with_unmarked = QCStateSet::new("Any", &states, true);
        assert_eq!(
            with_unmarked.state_in_clause("QCState"),
            "(QCState IN (1, 3) OR QCState IS NULL)"
        );

        let only_unmarked = QCStateSet::new("Unmarked", &[], true);
        assert_eq!(only_unmarked.state_in_clause("QCState"), "(QCState IS NULL)");
    }

    #[test]
    fn test_equality_ignores_label() {
        let states = [state(1, "Approved", true), state(2, "Rejected", false)];
        let a = QCStateSet::new("A", &states, true);
        let b = QCStateSet::new("B", &states, true);
        let c = QCStateSet::new("A", &states, false);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, QCStateSet::new("A", &states[..1], true));
    }

    #[test]
    fn test_selectable_sets_enumeration() {
        let states = [
            state(1, "Approved", true),
            state(2, "Verified", true),
            state(3, "Pending", false),
            state(4, "Rejected", false),
        ];

        let sets = QCStateSet::selectable_sets(&states, false);
        let labels: Vec<&str> = sets.iter().map(|s| s.label()).collect();
        assert_eq!(
            labels,
            vec![
                "Public/approved data",
                "Private/non-approved data",
                "All data",
                "Approved",
                "Verified",
                "Pending",
                "Rejected",
            ]
        );

        // A single public state with no unmarked rows offers no public set
        let one_public = [state(1, "Approved", true), state(3, "Pending", false)];
        let sets = QCStateSet::selectable_sets(&one_public, false);
        assert!(!sets.iter().any(|s| s.label() == "Public/approved data"));
        // ...but blank-is-public brings it back via include_unmarked
        let sets = QCStateSet::selectable_sets(&one_public, true);
        assert!(sets.iter().any(|s| s.label() == "Public/approved data"));
    }

    #[test]
    fn test_form_value_round_trip() {
        let states = [state(1, "Approved", true), state(3, "Pending", false)];
        let set = QCStateSet::new("Custom", &states, true);
        let parsed = QCStateSet::from_form_value("Custom", &set.form_value(), &states);
        assert_eq!(set, parsed);

        // Unknown ids are dropped on parse
        let parsed = QCStateSet::from_form_value("Custom", "1,999", &states);
        assert_eq!(parsed.state_ids().len(), 1);
    }
}
