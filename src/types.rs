use serde::{Deserialize, Serialize};

/// Time axis style of a study.
///
/// Visit-based studies key events by numbered visits; date-based studies
/// derive the event axis from calendar dates; continuous studies have no
/// fixed visit schedule and never populate the participant/visit mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimepointType {
    Visit,
    Date,
    Continuous,
}

impl TimepointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimepointType::Visit => "VISIT",
            TimepointType::Date => "DATE",
            TimepointType::Continuous => "CONTINUOUS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "VISIT" => Some(TimepointType::Visit),
            "DATE" => Some(TimepointType::Date),
            "CONTINUOUS" => Some(TimepointType::Continuous),
            _ => None,
        }
    }

    /// True when the study derives sequence numbers from calendar dates.
    pub fn is_date_based(&self) -> bool {
        matches!(self, TimepointType::Date | TimepointType::Continuous)
    }

    /// True when the study maintains per-event visit rows. Continuous
    /// studies have no visit axis.
    pub fn has_visit_axis(&self) -> bool {
        !matches!(self, TimepointType::Continuous)
    }
}

impl std::fmt::Display for TimepointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pagination parameters for list queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaginationParams {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl PaginationParams {
    pub fn offset(&self) -> i64 {
        ((self.page.saturating_sub(1)) * self.per_page) as i64
    }

    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }
}

/// Paginated result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, total: u64, params: PaginationParams) -> Self {
        let total_pages = (total as f64 / params.per_page as f64).ceil() as u32;
        Self {
            items,
            total,
            page: params.page,
            per_page: params.per_page,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timepoint_type_round_trip() {
        for tp in [TimepointType::Visit, TimepointType::Date, TimepointType::Continuous] {
            assert_eq!(TimepointType::from_str(tp.as_str()), Some(tp));
        }
        assert_eq!(TimepointType::from_str("date"), Some(TimepointType::Date));
        assert_eq!(TimepointType::from_str("bogus"), None);
    }

    #[test]
    fn test_visit_axis() {
        assert!(TimepointType::Visit.has_visit_axis());
        assert!(TimepointType::Date.has_visit_axis());
        assert!(!TimepointType::Continuous.has_visit_axis());
        assert!(!TimepointType::Visit.is_date_based());
        assert!(TimepointType::Date.is_date_based());
    }

    #[test]
    fn test_pagination_offset() {
        let params = PaginationParams { page: 3, per_page: 25 };
        assert_eq!(params.offset(), 50);
        assert_eq!(params.limit(), 25);
        assert_eq!(PaginationParams::default().offset(), 0);
    }
}
