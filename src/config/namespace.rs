//! The resolved, flattened configuration view handed to a fixture.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

use super::arguments::qualify;
use super::value::ArgValue;

/// Where a resolved value came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueSource {
    Default,
    System,
    User,
    Project,
    OverrideFile,
    Environment,
    CallTime,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueSource::Default => "default",
            ValueSource::System => "system",
            ValueSource::User => "user",
            ValueSource::Project => "project",
            ValueSource::OverrideFile => "override file",
            ValueSource::Environment => "environment",
            ValueSource::CallTime => "call-time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    value: ArgValue,
    source: ValueSource,
}

/// Resolved arguments for one fixture invocation.
///
/// Keys are stored prefixed; getters accept either the prefixed key or the
/// bare option name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    prefix: String,
    entries: BTreeMap<String, Entry>,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: String, value: ArgValue, source: ValueSource) {
        self.entries.insert(key, Entry { value, source });
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        let name = name.to_lowercase();
        self.entries
            .get(&qualify(&self.prefix, &name))
            .or_else(|| self.entries.get(&name))
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.entry(name).map(|e| &e.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Like [`get`](Self::get), but a missing option is a configuration error.
    pub fn require(&self, name: &str) -> Result<&ArgValue> {
        self.get(name).ok_or_else(|| {
            Error::Config(format!(
                "option '{}' has no value",
                qualify(&self.prefix, name)
            ))
        })
    }

    pub fn source(&self, name: &str) -> Option<ValueSource> {
        self.entry(name).map(|e| e.source)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ArgValue::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ArgValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ArgValue::as_f64)
    }

    /// Missing booleans read as false.
    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).and_then(ArgValue::as_bool).unwrap_or(false)
    }

    pub fn get_list(&self, name: &str) -> &[String] {
        self.get(name).and_then(ArgValue::as_list).unwrap_or(&[])
    }

    /// A float option interpreted as seconds. Missing or non-positive values read as `None`.
    ///
    /// Fails with [`Error::Config`] if the value is not finite or does not fit a `Duration`.
    pub fn get_duration(&self, name: &str) -> Result<Option<Duration>> {
        let Some(secs) = self.get_f64(name) else {
            return Ok(None);
        };
        if secs.is_finite() && secs <= 0.0 {
            return Ok(None);
        }
        Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            Error::Config(format!(
                "option '{}' is not a usable number of seconds: {}",
                qualify(&self.prefix, name),
                secs
            ))
        })
    }

    /// A string option that must be present and non-empty.
    pub fn require_str(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            ArgValue::Str(s) if !s.is_empty() => Ok(s),
            other => Err(Error::Config(format!(
                "option '{}' must be a non-empty string, got '{}'",
                qualify(&self.prefix, name),
                other
            ))),
        }
    }

    /// Iterates `(prefixed key, value, source)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue, ValueSource)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.as_str(), &e.value, e.source))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
