//! Problems found while assembling an argument schema.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// One problem with one argument key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub severity: Severity,
    /// Prefixed key of the offending argument.
    pub key: String,
    pub message: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Collected schema problems. Errors make a schema unusable; warnings are
/// logged when the schema is accepted.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    problems: Vec<Problem>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn error(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Error, key.into(), message.into());
    }

    pub fn warn(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Warning, key.into(), message.into());
    }

    fn push(&mut self, severity: Severity, key: String, message: String) {
        self.problems.push(Problem {
            severity,
            key,
            message,
        });
    }

    pub fn errors(&self) -> impl Iterator<Item = &Problem> {
        self.problems
            .iter()
            .filter(|p| p.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Problem> {
        self.problems
            .iter()
            .filter(|p| p.severity == Severity::Warning)
    }

    /// Every problem reported for `key`.
    pub fn for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Problem> + 'a {
        self.problems.iter().filter(move |p| p.key == key)
    }

    /// Appends the problems of another schema.
    pub fn extend(&mut self, other: ValidationResult) {
        self.problems.extend(other.problems);
    }

    /// Accepts the schema, logging its warnings, or fails with [`Error::Config`]
    /// listing every error.
    pub fn into_result(self) -> Result<Vec<Problem>> {
        if !self.is_valid() {
            let errors: Vec<String> = self.errors().map(Problem::to_string).collect();
            return Err(Error::Config(format!(
                "invalid argument schema: {}",
                errors.join("; ")
            )));
        }
        for warning in &self.problems {
            tracing::warn!(key = %warning.key, "{}", warning.message);
        }
        Ok(self.problems)
    }
}
