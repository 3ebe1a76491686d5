//! Typed result bag produced by every gather.
//!
//! Fixtures assemble results through an [`ArtifactsBuilder`] and seal them
//! with a result code. Once built, [`Artifacts`] exposes only read access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Result codes with a reserved meaning.
pub mod result_code {
    /// The fixture succeeded.
    pub const SUCCESS: i32 = 0;
    /// Generic failure.
    pub const FAILURE: i32 = 1;
    /// A deadline expired before the fixture (or one of its children) finished.
    pub const TIMEOUT: i32 = 124;
    /// A subprocess was terminated by a signal and has no exit code.
    pub const TERMINATED: i32 = -1;
}

/// A deferred action stored as an artifact (e.g. the "eat" action of the bar fixture).
#[derive(Clone)]
pub struct DeferredAction(Arc<dyn Fn() + Send + Sync>);

impl DeferredAction {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(action))
    }

    /// Runs the action.
    pub fn invoke(&self) {
        (self.0)()
    }
}

impl fmt::Debug for DeferredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeferredAction")
    }
}

/// A single named artifact.
#[derive(Debug, Clone)]
pub enum ArtifactValue {
    /// Structured data.
    Data(Value),
    /// A callable for deferred work.
    Action(DeferredAction),
}

impl ArtifactValue {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            ArtifactValue::Data(value) => Some(value),
            ArtifactValue::Action(_) => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ArtifactValue::Data(value) => value.clone(),
            ArtifactValue::Action(_) => Value::String("<action>".to_string()),
        }
    }
}

/// The artifacts of one invocation inside a concurrent gather.
#[derive(Debug, Clone)]
pub struct ChildArtifacts {
    /// Name of the fixture that produced the invocation.
    pub name: String,
    /// `None` if the invocation was cancelled before it completed.
    pub artifacts: Option<Artifacts>,
}

impl ChildArtifacts {
    /// Returns true if the invocation was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.artifacts.is_none()
    }

    /// Result code of the child, if it completed.
    pub fn result_code(&self) -> Option<i32> {
        self.artifacts.as_ref().and_then(Artifacts::result_code)
    }
}

/// Mutable artifact set used while a fixture is still running.
///
/// The result code is `None` until [`build`](Self::build) seals the artifacts.
#[derive(Debug, Default)]
pub struct ArtifactsBuilder {
    values: BTreeMap<String, ArtifactValue>,
}

impl ArtifactsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a data artifact.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values
            .insert(name.into(), ArtifactValue::Data(value.into()));
        self
    }

    /// Adds a data artifact from any serializable value.
    pub fn insert_serialized<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self> {
        let value = serde_json::to_value(value)?;
        self.values.insert(name.into(), ArtifactValue::Data(value));
        Ok(self)
    }

    /// Adds a deferred action.
    pub fn action(
        &mut self,
        name: impl Into<String>,
        action: impl Fn() + Send + Sync + 'static,
    ) -> &mut Self {
        self.values.insert(
            name.into(),
            ArtifactValue::Action(DeferredAction::new(action)),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Always `None`: a builder has not completed yet.
    pub fn result_code(&self) -> Option<i32> {
        None
    }

    /// Seals the artifacts with their one and only result code.
    pub fn build(self, result_code: i32) -> Artifacts {
        Artifacts {
            result_code: Some(result_code),
            values: self.values,
            children: Vec::new(),
        }
    }
}

/// Structured result of a gather: a result code plus named values.
#[derive(Debug, Clone)]
pub struct Artifacts {
    result_code: Option<i32>,
    values: BTreeMap<String, ArtifactValue>,
    children: Vec<ChildArtifacts>,
}

impl Artifacts {
    pub fn builder() -> ArtifactsBuilder {
        ArtifactsBuilder::new()
    }

    /// Empty, successful artifacts.
    pub fn success() -> Self {
        ArtifactsBuilder::new().build(result_code::SUCCESS)
    }

    /// Empty artifacts carrying a failure code.
    pub fn failure(code: i32) -> Self {
        ArtifactsBuilder::new().build(code)
    }

    /// Captures an instrument failure as failing artifacts with diagnostics.
    pub fn from_error(err: &Error) -> Self {
        let mut builder = ArtifactsBuilder::new();
        builder
            .insert("error", err.to_string())
            .insert("error_kind", err.kind());
        builder.build(err.result_code())
    }

    /// Merges the artifacts of concurrent invocations.
    ///
    /// Children are kept in invocation order, namespaced by fixture name.
    /// Their data values are also flattened into the merged set; the first
    /// child to define a name wins.
    pub fn combine(result_code: i32, children: Vec<ChildArtifacts>) -> Self {
        let mut values = BTreeMap::new();
        for artifacts in children.iter().filter_map(|c| c.artifacts.as_ref()) {
            for (name, value) in &artifacts.values {
                values
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        Self {
            result_code: Some(result_code),
            values,
            children,
        }
    }

    pub fn result_code(&self) -> Option<i32> {
        self.result_code
    }

    /// True if the result code is zero.
    pub fn is_success(&self) -> bool {
        self.result_code == Some(result_code::SUCCESS)
    }

    pub fn is_timeout(&self) -> bool {
        self.result_code == Some(result_code::TIMEOUT)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ArtifactValue> {
        self.values.get(name)
    }

    pub fn data(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(ArtifactValue::as_data)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.data(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.data(name).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.data(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.data(name).and_then(Value::as_bool)
    }

    /// Runs the deferred action stored under `name`.
    ///
    /// Returns false if there is no action by that name.
    pub fn invoke(&self, name: &str) -> bool {
        match self.values.get(name) {
            Some(ArtifactValue::Action(action)) => {
                action.invoke();
                true
            }
            _ => false,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.children.is_empty()
    }

    pub fn children(&self) -> &[ChildArtifacts] {
        &self.children
    }

    /// The child invocation namespaced as `name`.
    pub fn child(&self, name: &str) -> Option<&ChildArtifacts> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Human-readable description of what failed, including nested children.
    pub fn failure_report(&self) -> String {
        let mut lines = Vec::new();
        self.collect_failures("", &mut lines);
        if lines.is_empty() {
            format!("result code {:?}", self.result_code)
        } else {
            lines.join("; ")
        }
    }

    fn collect_failures(&self, path: &str, lines: &mut Vec<String>) {
        if self.children.is_empty() {
            if !self.is_success() {
                let mut line = format!("{}result code {:?}", label(path), self.result_code);
                if let Some(error) = self.get_str("error") {
                    line.push_str(&format!(" ({})", error));
                }
                lines.push(line);
            }
            return;
        }
        for child in &self.children {
            let child_path = if path.is_empty() {
                child.name.clone()
            } else {
                format!("{}/{}", path, child.name)
            };
            match &child.artifacts {
                None => lines.push(format!("{}cancelled before completion", label(&child_path))),
                Some(artifacts) => artifacts.collect_failures(&child_path, lines),
            }
        }
    }

    /// JSON rendering for reports; actions render as `"<action>"`.
    pub fn to_json(&self) -> Value {
        let values: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        let children: Vec<Value> = self
            .children
            .iter()
            .map(|child| {
                json!({
                    "name": child.name,
                    "artifacts": child.artifacts.as_ref().map(Artifacts::to_json),
                })
            })
            .collect();
        json!({
            "result_code": self.result_code,
            "values": values,
            "children": children,
        })
    }
}

fn label(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{}: ", path)
    }
}

impl Serialize for Artifacts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Returns the artifacts unchanged if they succeeded, otherwise fails.
///
/// Allows fluent use: `assert_success(fixture.gather(overrides).await?)?.get("x")`.
pub fn assert_success(artifacts: Artifacts) -> Result<Artifacts> {
    if artifacts.is_success() {
        Ok(artifacts)
    } else {
        Err(Error::AssertionFailed {
            result_code: artifacts.result_code(),
            report: artifacts.failure_report(),
            artifacts: Box::new(artifacts),
        })
    }
}

/// Like [`assert_success`], but also requires `condition` to hold.
///
/// The condition is only evaluated for successful artifacts.
pub fn assert_success_if(
    artifacts: Artifacts,
    condition: impl FnOnce(&Artifacts) -> bool,
) -> Result<Artifacts> {
    let artifacts = assert_success(artifacts)?;
    if condition(&artifacts) {
        Ok(artifacts)
    } else {
        Err(Error::AssertionFailed {
            result_code: artifacts.result_code(),
            report: "artifacts did not satisfy the condition".to_string(),
            artifacts: Box::new(artifacts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builder_has_no_result_code() {
        let builder = Artifacts::builder();
        assert_eq!(builder.result_code(), None);
    }

    #[test]
    fn build_seals_result_code() {
        let mut builder = Artifacts::builder();
        builder.insert("port", "/dev/ttyUSB0");
        let artifacts = builder.build(3);
        assert_eq!(artifacts.result_code(), Some(3));
        assert!(!artifacts.is_success());
        assert_eq!(artifacts.get_str("port"), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn missing_artifact_is_none() {
        let artifacts = Artifacts::success();
        assert!(!artifacts.contains("foo"));
        assert!(artifacts.get("foo").is_none());
    }

    #[test]
    fn deferred_action_runs_on_invoke() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let mut builder = Artifacts::builder();
        builder.action("eat", move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let artifacts = builder.build(0);

        assert!(artifacts.invoke("eat"));
        assert!(artifacts.invoke("eat"));
        assert!(!artifacts.invoke("nothing"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn assert_success_returns_input_unchanged() {
        let mut builder = Artifacts::builder();
        builder.insert("answer", 42);
        let artifacts = assert_success(builder.build(0)).unwrap();
        assert_eq!(artifacts.get_i64("answer"), Some(42));
        assert_eq!(artifacts.result_code(), Some(0));
    }

    #[test]
    fn assert_success_fails_for_every_nonzero_code() {
        for code in [-1, 1, 2, 124, 255] {
            let err = assert_success(Artifacts::failure(code)).unwrap_err();
            match err {
                Error::AssertionFailed {
                    result_code,
                    artifacts,
                    ..
                } => {
                    assert_eq!(result_code, Some(code));
                    assert_eq!(artifacts.result_code(), Some(code));
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn assert_success_if_checks_condition() {
        let mut builder = Artifacts::builder();
        builder.insert("foo", "bar");
        let artifacts = builder.build(0);

        assert!(assert_success_if(artifacts.clone(), |a| a.contains("foo")).is_ok());
        assert!(assert_success_if(artifacts, |_| false).is_err());
    }

    #[test]
    fn from_error_carries_diagnostics() {
        let artifacts = Artifacts::from_error(&Error::Instrument("no debugger".into()));
        assert_eq!(artifacts.result_code(), Some(result_code::FAILURE));
        assert_eq!(artifacts.get_str("error_kind"), Some("instrument"));
        assert!(artifacts.get_str("error").unwrap().contains("no debugger"));
    }

    #[test]
    fn combine_flattens_first_writer_wins() {
        let mut first = Artifacts::builder();
        first.insert("shared", 1).insert("bar_1", 1.5);
        let mut second = Artifacts::builder();
        second.insert("shared", 2).insert("bar_2", 2.5);

        let merged = Artifacts::combine(
            0,
            vec![
                ChildArtifacts {
                    name: "bar".into(),
                    artifacts: Some(first.build(0)),
                },
                ChildArtifacts {
                    name: "bar#2".into(),
                    artifacts: Some(second.build(0)),
                },
            ],
        );

        assert_eq!(merged.get_i64("shared"), Some(1));
        assert!(merged.contains("bar_1"));
        assert!(merged.contains("bar_2"));
        assert_eq!(merged.children().len(), 2);
        assert_eq!(merged.child("bar#2").unwrap().result_code(), Some(0));
    }

    #[test]
    fn failure_report_names_failing_children() {
        let merged = Artifacts::combine(
            result_code::TIMEOUT,
            vec![
                ChildArtifacts {
                    name: "power".into(),
                    artifacts: Some(Artifacts::success()),
                },
                ChildArtifacts {
                    name: "upload".into(),
                    artifacts: Some(Artifacts::failure(3)),
                },
                ChildArtifacts {
                    name: "serial".into(),
                    artifacts: None,
                },
            ],
        );

        let report = merged.failure_report();
        assert!(report.contains("upload: result code Some(3)"));
        assert!(report.contains("serial: cancelled"));
        assert!(!report.contains("power"));
    }

    #[test]
    fn to_json_renders_actions_and_children() {
        let mut builder = Artifacts::builder();
        builder.action("eat", || {}).insert("n", 1);
        let merged = Artifacts::combine(
            0,
            vec![ChildArtifacts {
                name: "bar".into(),
                artifacts: Some(builder.build(0)),
            }],
        );
        let json = merged.to_json();
        assert_eq!(json["result_code"], 0);
        assert_eq!(json["values"]["eat"], "<action>");
        assert_eq!(json["children"][0]["name"], "bar");
    }
}
