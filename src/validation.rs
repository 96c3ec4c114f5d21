use crate::errors::{DomainError, DomainResult, ValidationError};
use regex::Regex;
use std::sync::OnceLock;

/// A trait that entities should implement for validation.
pub trait Validate {
    /// Validates the entity and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

// Participant identifiers come in from external data files; allow the
// usual alphanumeric/dash/underscore/dot forms but nothing that could
// break the ptid|sequencenum composite key.
fn participant_id_regex() -> &'static Regex {
    static PARTICIPANT_ID_REGEX: OnceLock<Regex> = OnceLock::new();
    PARTICIPANT_ID_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,31}$").unwrap())
}

/// Struct for configuring validations in a fluent style
#[derive(Default)]
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

/// Generic validation implementations
impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self
    where T: Default + PartialEq {
        if self.value.is_none() || self.value == Some(T::default()) {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where F: FnOnce(&T) -> Result<(), ValidationError> {
        if let Some(value) = &self.value {
            if let Err(err) = validator(value) {
                self.errors.push(err);
            }
        }
        self
    }

    /// Complete validation and return result
    pub fn validate(self) -> DomainResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            // Return the first error for simplicity
            Err(DomainError::Validation(self.errors[0].clone()))
        }
    }
}

/// String-specific validations
impl ValidationBuilder<String> {
    pub fn min_length(mut self, min: usize) -> Self {
        if let Some(value) = &self.value {
            if value.len() < min {
                self.errors.push(ValidationError::min_length(&self.field_name, min));
            }
        }
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.len() > max {
                self.errors.push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn matches_pattern(mut self, pattern: &Regex, message: &str) -> Self {
        if let Some(value) = &self.value {
            if !pattern.is_match(value) {
                self.errors.push(ValidationError::format(&self.field_name, message));
            }
        }
        self
    }

    pub fn one_of(mut self, allowed_values: &[&str], message: Option<&str>) -> Self {
        if let Some(value) = &self.value {
            if !allowed_values.contains(&value.as_str()) {
                let reason = message
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("must be one of: {}", allowed_values.join(", ")));
                self.errors.push(ValidationError::invalid_value(&self.field_name, &reason));
            }
        }
        self
    }

    pub fn participant_id(self) -> Self {
        self.matches_pattern(participant_id_regex(), "must be a valid participant identifier")
    }
}

/// Numeric validations shared by row ids and day offsets
impl ValidationBuilder<i64> {
    pub fn min(mut self, min: i64) -> Self {
        if let Some(value) = &self.value {
            if *value < min {
                self.errors.push(ValidationError::range(&self.field_name, min, i64::MAX));
            }
        }
        self
    }
}

/// Common validators for the study vocabulary
pub mod common {
    use super::*;
    use crate::types::TimepointType;
    use rust_decimal::Decimal;

    pub fn validate_timepoint_type(value: &str) -> DomainResult<()> {
        if TimepointType::from_str(value).is_none() {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "timepoint_type",
                &format!("'{}' is not one of VISIT, DATE, CONTINUOUS", value),
            )));
        }
        Ok(())
    }

    /// Visit type codes are single characters from the fixed code set.
    pub fn validate_visit_type_code(value: &str) -> DomainResult<()> {
        if crate::domains::visit::types::VisitType::from_code(value).is_none() {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "type_code",
                &format!("'{}' is not a recognized visit type code", value),
            )));
        }
        Ok(())
    }

    pub fn validate_participant_id(value: &str) -> DomainResult<()> {
        ValidationBuilder::new("participant_id", Some(value.to_string()))
            .required()
            .participant_id()
            .validate()
    }

    /// A visit's sequence range must be ordered.
    pub fn validate_sequence_range(min: Decimal, max: Decimal) -> DomainResult<()> {
        if min > max {
            return Err(DomainError::Validation(ValidationError::range(
                "sequence_num_min",
                min.to_string(),
                max.to_string(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_participant_id_validation() {
        assert!(common::validate_participant_id("PT-1001").is_ok());
        assert!(common::validate_participant_id("999320016").is_ok());
        assert!(common::validate_participant_id("").is_err());
        assert!(common::validate_participant_id("a|b").is_err());
    }

    #[test]
    fn test_timepoint_type_validation() {
        assert!(common::validate_timepoint_type("VISIT").is_ok());
        assert!(common::validate_timepoint_type("date").is_ok());
        assert!(common::validate_timepoint_type("WEEKLY").is_err());
    }

    #[test]
    fn test_sequence_range_validation() {
        assert!(common::validate_sequence_range(dec!(1), dec!(1.9999)).is_ok());
        assert!(common::validate_sequence_range(dec!(2), dec!(1)).is_err());
    }

    #[test]
    fn test_builder_required_and_length() {
        let ok = ValidationBuilder::new("label", Some("Enrollment".to_string()))
            .required()
            .min_length(2)
            .max_length(200)
            .validate();
        assert!(ok.is_ok());

        let err = ValidationBuilder::new("label", Some("".to_string()))
            .required()
            .validate();
        assert!(err.is_err());
    }
}
