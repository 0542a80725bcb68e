//! Payload validation for enqueued items.
//!
//! A channel's queue config carries a `map` describing the fields every
//! item's `data` must have. [`compile`] turns that map into a [`Validator`];
//! hosts with a richer schema language can plug in their own implementation
//! (any `Fn(&Value) -> Vec<ValidationError>` works).

use crate::config::{FieldKind, FieldRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub value: Value,
    pub error: String,
    /// Element position when `data` is an array of records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, value: Value, error: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value,
            error: error.into(),
            index: None,
        }
    }

    fn at(mut self, index: Option<usize>) -> Self {
        self.index = index;
        self
    }
}

/// Non-empty list of validation failures returned by `add_in_queue`.
#[derive(Debug, Clone, PartialEq, Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<ValidationError> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for (position, error) in self.0.iter().enumerate() {
            let sep = if position == 0 { ": " } else { "; " };
            match error.index {
                Some(index) => write!(f, "{sep}[{index}].{} {}", error.field, error.error)?,
                None => write!(f, "{sep}{} {}", error.field, error.error)?,
            }
        }
        Ok(())
    }
}

/// Checks an item's `data` before it is enqueued. An empty result means valid.
pub trait Validator: Send + Sync {
    fn validate(&self, data: &Value) -> Vec<ValidationError>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Vec<ValidationError> + Send + Sync,
{
    fn validate(&self, data: &Value) -> Vec<ValidationError> {
        self(data)
    }
}

/// Accepts any payload. Used when a channel declares no field map.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _data: &Value) -> Vec<ValidationError> {
        Vec::new()
    }
}

/// Validator compiled from a field map.
#[derive(Debug, Clone)]
pub struct FieldMapValidator {
    fields: Vec<(String, FieldRule)>,
}

impl FieldMapValidator {
    pub fn new(map: &BTreeMap<String, FieldRule>) -> Self {
        Self {
            fields: map
                .iter()
                .map(|(name, rule)| (name.clone(), rule.clone()))
                .collect(),
        }
    }

    fn check_record(&self, record: &Value, index: Option<usize>, out: &mut Vec<ValidationError>) {
        let Some(object) = record.as_object() else {
            out.push(
                ValidationError::new("", record.clone(), "must be an object").at(index),
            );
            return;
        };

        for (name, rule) in &self.fields {
            match object.get(name) {
                None | Some(Value::Null) => {
                    if rule.required {
                        out.push(
                            ValidationError::new(name.as_str(), Value::Null, "is required")
                                .at(index),
                        );
                    }
                }
                Some(value) if !kind_matches(rule.kind, value) => {
                    out.push(
                        ValidationError::new(
                            name.as_str(),
                            value.clone(),
                            format!("must be of type {}", rule.kind),
                        )
                        .at(index),
                    );
                }
                Some(_) => {}
            }
        }
    }
}

impl Validator for FieldMapValidator {
    fn validate(&self, data: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        match data {
            Value::Array(records) => {
                for (index, record) in records.iter().enumerate() {
                    self.check_record(record, Some(index), &mut errors);
                }
            }
            record => self.check_record(record, None, &mut errors),
        }
        errors
    }
}

fn kind_matches(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::Any => true,
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Object => value.is_object(),
        FieldKind::Array => value.is_array(),
    }
}

/// Compile a channel field map into a validator.
pub fn compile(map: &BTreeMap<String, FieldRule>) -> Box<dyn Validator> {
    if map.is_empty() {
        Box::new(AcceptAll)
    } else {
        Box::new(FieldMapValidator::new(map))
    }
}
