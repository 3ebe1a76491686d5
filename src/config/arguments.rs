//! Declarative argument schemas.
//!
//! A fixture declares its options unprefixed through
//! [`Fixture::on_visit_test_arguments`](crate::Fixture::on_visit_test_arguments).
//! The schema applies the prefix of whoever is being visited, so a component
//! visited from inside an aggregate registers under the aggregate's prefix.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::fixture::Fixture;

use super::validate::ValidationResult;
use super::value::ArgValue;

/// Prefix of every derived environment variable.
pub const ENV_PREFIX: &str = "HIL";

/// The type of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
    Float,
    Bool,
    /// Comma or whitespace separated list of strings.
    List,
}

impl ArgKind {
    /// Parses configuration text into a value of this kind.
    pub fn parse(self, text: &str) -> std::result::Result<ArgValue, String> {
        let trimmed = text.trim();
        match self {
            ArgKind::Str => Ok(ArgValue::Str(trimmed.to_string())),
            ArgKind::Int => trimmed
                .parse::<i64>()
                .map(ArgValue::Int)
                .map_err(|_| format!("'{}' is not an integer", trimmed)),
            ArgKind::Float => trimmed
                .parse::<f64>()
                .map(ArgValue::Float)
                .map_err(|_| format!("'{}' is not a number", trimmed)),
            ArgKind::Bool => match trimmed.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(ArgValue::Bool(true)),
                "0" | "false" | "no" | "off" => Ok(ArgValue::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", trimmed)),
            },
            ArgKind::List => Ok(ArgValue::List(
                trimmed
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }

    /// Converts an already-typed value to this kind.
    ///
    /// Strings are parsed, integers widen to floats, anything else must match.
    pub fn coerce(self, value: ArgValue) -> std::result::Result<ArgValue, String> {
        match (self, value) {
            (_, ArgValue::Str(text)) => self.parse(&text),
            (ArgKind::Int, v @ ArgValue::Int(_))
            | (ArgKind::Float, v @ ArgValue::Float(_))
            | (ArgKind::Bool, v @ ArgValue::Bool(_))
            | (ArgKind::List, v @ ArgValue::List(_)) => Ok(v),
            (ArgKind::Float, ArgValue::Int(i)) => Ok(ArgValue::Float(i as f64)),
            (kind, other) => Err(format!(
                "expected {:?} but got {} '{}'",
                kind,
                other.type_name(),
                other
            )),
        }
    }
}

/// One option as declared by a fixture, without its prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSpec {
    pub name: String,
    pub kind: ArgKind,
    pub default: Option<ArgValue>,
    pub help: String,
    pub required: bool,
    /// Whether an environment variable may override this option.
    pub environment: bool,
}

impl ArgumentSpec {
    /// A string option with no default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            kind: ArgKind::Str,
            default: None,
            help: String::new(),
            required: false,
            environment: true,
        }
    }

    pub fn kind(mut self, kind: ArgKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn default(mut self, value: impl Into<ArgValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn no_environment(mut self) -> Self {
        self.environment = false;
        self
    }
}

/// An option after the prefix has been applied.
#[derive(Debug, Clone)]
pub struct ArgumentDef {
    /// Fully prefixed key, e.g. `fwr_port`.
    pub key: String,
    pub prefix: String,
    /// Canonical name of the fixture whose visit declared it.
    pub owner: String,
    pub spec: ArgumentSpec,
    /// Derived environment variable, unless the option opted out.
    pub env_var: Option<String>,
}

/// Joins a prefix and an unprefixed option name.
pub fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

/// Environment variable name for a prefixed key: `fwr_port` -> `HIL_FWR_PORT`.
pub fn env_var_name(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.replace('-', "_").to_uppercase())
}

/// The union of argument declarations for one or more fixtures.
#[derive(Debug, Clone, Default)]
pub struct ArgumentSchema {
    args: BTreeMap<String, ArgumentDef>,
    problems: ValidationResult,
}

impl ArgumentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and validates the schema of a single fixture type.
    pub fn for_fixture<T: Fixture>() -> Result<Self> {
        let mut schema = Self::new();
        schema.visit::<T>();
        schema.validate().into_result()?;
        Ok(schema)
    }

    /// Visits `T` under its own prefix.
    pub fn visit<T: Fixture>(&mut self) {
        let info = T::info();
        let mut arguments = self.scoped(&info.name, &info.argument_prefix);
        T::on_visit_test_arguments(&mut arguments);
    }

    /// A view that declares options for `owner` under `prefix`.
    pub fn scoped(&mut self, owner: &str, prefix: &str) -> Arguments<'_> {
        Arguments {
            schema: self,
            owner: owner.to_string(),
            prefix: prefix.to_lowercase(),
        }
    }

    fn insert(&mut self, def: ArgumentDef) {
        if let Some(existing) = self.args.get(&def.key) {
            if existing.spec.kind == def.spec.kind && existing.spec.default == def.spec.default {
                if existing.owner != def.owner {
                    self.problems.warn(
                        &def.key,
                        format!("shared by '{}' and '{}'", existing.owner, def.owner),
                    );
                }
            } else {
                self.problems.error(
                    &def.key,
                    format!(
                        "declaration by '{}' conflicts with the one by '{}'",
                        def.owner, existing.owner
                    ),
                );
            }
            return;
        }
        self.args.insert(def.key.clone(), def);
    }

    /// Adds every declaration of `other` to this schema.
    pub fn union(&mut self, other: ArgumentSchema) {
        self.problems.extend(other.problems);
        for (_, def) in other.args {
            self.insert(def);
        }
    }

    pub fn get(&self, key: &str) -> Option<&ArgumentDef> {
        self.args.get(key)
    }

    /// Finds an option by its prefixed key or by its name under `prefix`.
    pub fn lookup(&self, prefix: &str, name: &str) -> Option<&ArgumentDef> {
        let name = name.to_lowercase();
        self.args
            .get(&name)
            .or_else(|| self.args.get(&qualify(prefix, &name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArgumentDef> {
        self.args.values()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Checks for collisions, ill-typed defaults and clashing environment variables.
    pub fn validate(&self) -> ValidationResult {
        let mut result = self.problems.clone();
        let mut env_names: BTreeMap<&str, &str> = BTreeMap::new();

        for def in self.args.values() {
            if let Some(default) = &def.spec.default {
                if let Err(msg) = def.spec.kind.coerce(default.clone()) {
                    result.error(&def.key, format!("bad default: {}", msg));
                }
            }
            if def.spec.required && def.spec.default.is_some() {
                result.warn(&def.key, "required but has a default");
            }
            if let Some(env) = &def.env_var {
                if let Some(other) = env_names.insert(env, &def.key) {
                    result.error(
                        &def.key,
                        format!("environment variable '{}' is also used by '{}'", env, other),
                    );
                }
            }
        }

        result
    }
}

/// Prefix-scoped view of an [`ArgumentSchema`] handed to argument visitors.
pub struct Arguments<'a> {
    schema: &'a mut ArgumentSchema,
    owner: String,
    prefix: String,
}

impl Arguments<'_> {
    /// The prefix applied to every option declared through this view.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Declares an option; `spec.name` must not include the prefix.
    pub fn add_argument(&mut self, spec: ArgumentSpec) -> &mut Self {
        let key = qualify(&self.prefix, &spec.name);
        let env_var = spec.environment.then(|| env_var_name(&key));
        self.schema.insert(ArgumentDef {
            key,
            prefix: self.prefix.clone(),
            owner: self.owner.clone(),
            spec,
            env_var,
        });
        self
    }
}
