//! Test specification validator
//!
//! Checks test specification documents against a JSON schema before they are
//! stored. Callers get one representative failure, not the full list.

use jsonschema::error::ValidationErrorKind;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{AutotestError, Result};

/// Schema shipped with the crate; also served to UI form builders.
pub const DEFAULT_SPECS_SCHEMA: &str = include_str!("../schema/test_specs.schema.json");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// JSON pointer into the document, empty for the root
    pub path: String,
    pub message: String,
    depth: usize,
    weak: bool,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (at {})", self.message, self.path)
        }
    }
}

/// Pick the most actionable failure.
///
/// Failures closer to the document root win; among equally deep ones,
/// combinator failures (`anyOf`/`oneOf`) lose to concrete ones. Ties keep
/// the first reported failure.
pub fn best_match(failures: &[ValidationFailure]) -> Option<&ValidationFailure> {
    failures.iter().min_by_key(|f| (f.depth, f.weak))
}

pub struct SpecValidator {
    schema: Value,
    compiled: JSONSchema,
}

impl SpecValidator {
    pub fn new(schema: Value) -> Result<Self> {
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| AutotestError::Config(format!("invalid test specification schema: {}", e)))?;
        Ok(Self { schema, compiled })
    }

    pub fn with_default_schema() -> Result<Self> {
        Self::new(serde_json::from_str(DEFAULT_SPECS_SCHEMA)?)
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Every schema violation in `document`; empty when it is valid.
    pub fn validate(&self, document: &Value) -> Vec<ValidationFailure> {
        match self.compiled.validate(document) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    let weak = matches!(
                        error.kind,
                        ValidationErrorKind::AnyOf
                            | ValidationErrorKind::OneOfNotValid
                            | ValidationErrorKind::OneOfMultipleValid
                    );
                    let segments = error.instance_path.clone().into_vec();
                    let path = segments
                        .iter()
                        .map(|s| format!("/{}", s))
                        .collect::<String>();
                    ValidationFailure {
                        path,
                        message: error.to_string(),
                        depth: segments.len(),
                        weak,
                    }
                })
                .collect(),
        }
    }

    /// Fail with the best-matching violation, if any.
    pub fn check(&self, document: &Value) -> Result<()> {
        let failures = self.validate(document);
        match best_match(&failures) {
            None => Ok(()),
            Some(failure) => Err(AutotestError::InvalidSpec(failure.to_string())),
        }
    }
}
