//! Layered, prefix-scoped configuration.
//!
//! A [`ConfigContext`] owns every configuration source of a run and turns an
//! [`ArgumentSchema`] plus call-time [`Overrides`] into a [`Namespace`].
//! Precedence, lowest first: schema defaults, system file, user files,
//! project files, override file, environment, call-time overrides.

mod arguments;
mod layers;
mod namespace;
mod validate;
mod value;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use arguments::{
    env_var_name, qualify, ArgKind, ArgumentDef, ArgumentSchema, ArgumentSpec, Arguments,
    ENV_PREFIX,
};
pub use layers::{load_file, parse_str, FlatEntry, Layer, LayeredConfig, Sections, ROOT_SECTION};
pub use namespace::{Namespace, ValueSource};
pub use validate::{Problem, Severity, ValidationResult};
pub use value::{ArgValue, Overrides};

use crate::error::{Error, Result};

/// Well-known system configuration file.
pub const SYSTEM_CONFIG: &str = "/etc/hil.cfg";

/// Project files searched in the project directory, in order.
pub const PROJECT_CONFIG_FILES: &[&str] = &["hil.cfg", "setup.cfg", "tox.ini"];

/// Where environment overrides are read from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// The process environment, read at resolution time.
    #[default]
    Process,
    /// A fixed set of variables.
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    pub fn get(&self, name: &str) -> Option<String> {
        match self {
            EnvSource::Process => std::env::var(name).ok(),
            EnvSource::Fixed(vars) => vars.get(name).cloned(),
        }
    }
}

enum SourceSpec {
    File(PathBuf),
    Text { origin: String, text: String },
}

/// Builder for [`ConfigContext`].
#[derive(Default)]
pub struct ConfigContextBuilder {
    sources: Vec<(Layer, SourceSpec)>,
    env: EnvSource,
}

impl ConfigContextBuilder {
    /// Adds an INI file to a layer; missing files are skipped.
    pub fn with_file(mut self, layer: Layer, path: impl Into<PathBuf>) -> Self {
        self.sources.push((layer, SourceSpec::File(path.into())));
        self
    }

    /// Adds INI text to a layer.
    pub fn with_source_str(
        mut self,
        layer: Layer,
        origin: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.sources.push((
            layer,
            SourceSpec::Text {
                origin: origin.into(),
                text: text.into(),
            },
        ));
        self
    }

    /// Uses a fixed set of environment variables instead of the process environment.
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = EnvSource::Fixed(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_env_source(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    /// Loads every source and merges them in layer order.
    pub fn build(self) -> Result<ConfigContext> {
        let mut sources = self.sources;
        // stable: sources within one layer keep insertion order
        sources.sort_by_key(|(layer, _)| *layer);

        let mut layered = LayeredConfig::new();
        let mut loaded = Vec::new();
        for (layer, source) in sources {
            match source {
                SourceSpec::File(path) => match load_file(&path)? {
                    Some(sections) => {
                        tracing::debug!(path = %path.display(), ?layer, "loaded configuration file");
                        layered.push(layer, &path.display().to_string(), sections);
                        loaded.push(path);
                    }
                    None => {
                        tracing::trace!(path = %path.display(), ?layer, "configuration file not found");
                    }
                },
                SourceSpec::Text { origin, text } => {
                    let sections = parse_str(&origin, &text)?;
                    layered.push(layer, &origin, sections);
                }
            }
        }

        Ok(ConfigContext {
            layered,
            env: self.env,
            loaded,
        })
    }
}

/// The configuration-resolution context of a run.
#[derive(Debug, Clone, Default)]
pub struct ConfigContext {
    layered: LayeredConfig,
    env: EnvSource,
    loaded: Vec<PathBuf>,
}

impl ConfigContext {
    pub fn builder() -> ConfigContextBuilder {
        ConfigContextBuilder::default()
    }

    /// No files, process environment only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Searches the well-known locations.
    ///
    /// System: `/etc/hil.cfg`. User: `~/.hil.cfg` then `<config dir>/hil/hil.cfg`.
    /// Project: `hil.cfg`, `setup.cfg`, `tox.ini` in `project_dir`.
    /// Finally the caller's `rcfile`, which overrides all of them.
    pub fn discover(project_dir: Option<&Path>, rcfile: Option<&Path>) -> Result<Self> {
        let mut builder = Self::builder().with_file(Layer::System, SYSTEM_CONFIG);
        if let Some(home) = dirs::home_dir() {
            builder = builder.with_file(Layer::User, home.join(".hil.cfg"));
        }
        if let Some(config_dir) = dirs::config_dir() {
            builder = builder.with_file(Layer::User, config_dir.join("hil").join("hil.cfg"));
        }
        if let Some(dir) = project_dir {
            for name in PROJECT_CONFIG_FILES {
                builder = builder.with_file(Layer::Project, dir.join(name));
            }
        }
        if let Some(rcfile) = rcfile {
            if !rcfile.is_file() {
                return Err(Error::Config(format!(
                    "override file '{}' does not exist",
                    rcfile.display()
                )));
            }
            builder = builder.with_file(Layer::OverrideFile, rcfile);
        }
        builder.build()
    }

    /// Files that were found and loaded, in precedence order.
    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded
    }

    pub fn env(&self) -> &EnvSource {
        &self.env
    }

    /// The interpolated file value of a flat key, ignoring schema and environment.
    pub fn lookup(&self, flat_key: &str) -> Result<Option<String>> {
        Ok(self
            .layered
            .get(&flat_key.to_lowercase())?
            .map(|(value, _)| value))
    }

    /// Resolves the options of `schema` declared under `prefix`.
    ///
    /// Fails with [`Error::Config`] for unknown override keys, unparsable
    /// values, broken interpolation, and required options with no value.
    pub fn resolve(
        &self,
        prefix: &str,
        schema: &ArgumentSchema,
        overrides: &Overrides,
    ) -> Result<Namespace> {
        let mut call_time: HashMap<&str, &ArgValue> = HashMap::new();
        for (key, value) in overrides.iter() {
            let def = schema.lookup(prefix, key).ok_or_else(|| {
                Error::Config(format!(
                    "unknown option '{}' for prefix '{}'",
                    key, prefix
                ))
            })?;
            call_time.insert(def.key.as_str(), value);
        }

        let mut namespace = Namespace::new(prefix);
        for def in schema.iter() {
            match self.resolve_one(def, call_time.get(def.key.as_str()).copied())? {
                Some((value, source)) => {
                    tracing::trace!(key = %def.key, %source, "resolved option");
                    namespace.insert(def.key.clone(), value, source);
                }
                None if def.spec.required => {
                    return Err(Error::Config(format!(
                        "required option '{}' has no value (set it in a configuration file, \
                         with {}, or as an override)",
                        def.key,
                        def.env_var.as_deref().unwrap_or("an override file"),
                    )));
                }
                None => {}
            }
        }
        Ok(namespace)
    }

    fn resolve_one(
        &self,
        def: &ArgumentDef,
        call_time: Option<&ArgValue>,
    ) -> Result<Option<(ArgValue, ValueSource)>> {
        let kind = def.spec.kind;
        let invalid = |origin: &str, msg: String| {
            Error::Config(format!("option '{}' from {}: {}", def.key, origin, msg))
        };

        if let Some(value) = call_time {
            let value = kind
                .coerce(value.clone())
                .map_err(|msg| invalid("call-time override", msg))?;
            return Ok(Some((value, ValueSource::CallTime)));
        }

        if let Some(var) = &def.env_var {
            if let Some(text) = self.env.get(var) {
                let value = kind.parse(&text).map_err(|msg| invalid(var.as_str(), msg))?;
                return Ok(Some((value, ValueSource::Environment)));
            }
        }

        if let Some((text, layer)) = self.layered.get(&def.key)? {
            let origin = format!("{} configuration", layer.source());
            let value = kind.parse(&text).map_err(|msg| invalid(origin.as_str(), msg))?;
            return Ok(Some((value, layer.source())));
        }

        match &def.spec.default {
            Some(default) => {
                let value = kind
                    .coerce(default.clone())
                    .map_err(|msg| invalid("default", msg))?;
                Ok(Some((value, ValueSource::Default)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ArgumentSchema {
        let mut schema = ArgumentSchema::new();
        schema
            .scoped("firmware_update", "fwr")
            .add_argument(ArgumentSpec::new("port").required())
            .add_argument(ArgumentSpec::new("force").kind(ArgKind::Bool).default(false))
            .add_argument(ArgumentSpec::new("retries").kind(ArgKind::Int).default(3))
            .add_argument(ArgumentSpec::new("token").no_environment());
        schema
    }

    fn context(env: &[(&str, &str)], layers: &[(Layer, &str)]) -> ConfigContext {
        let mut builder = ConfigContext::builder().with_env(env.iter().copied());
        for (layer, text) in layers {
            builder = builder.with_source_str(*layer, format!("{:?}", layer), *text);
        }
        builder.build().unwrap()
    }

    #[test]
    fn defaults_fill_unset_options() {
        let ctx = context(&[], &[(Layer::Project, "[fwr]\nport = /dev/ttyACM0\n")]);
        let ns = ctx.resolve("fwr", &schema(), &Overrides::new()).unwrap();

        assert_eq!(ns.get_str("port"), Some("/dev/ttyACM0"));
        assert_eq!(ns.source("port"), Some(ValueSource::Project));
        assert_eq!(ns.get_i64("retries"), Some(3));
        assert_eq!(ns.source("retries"), Some(ValueSource::Default));
        assert!(!ns.contains("token"));
    }

    #[test]
    fn precedence_is_layer_then_env_then_call_time() {
        let layers = [
            (Layer::System, "[fwr]\nport = system\nretries = 1\n"),
            (Layer::User, "[fwr]\nport = user\n"),
            (Layer::Project, "[fwr]\nport = project\n"),
        ];

        let ctx = context(&[], &layers);
        let ns = ctx.resolve("fwr", &schema(), &Overrides::new()).unwrap();
        assert_eq!(ns.get_str("port"), Some("project"));
        assert_eq!(ns.get_i64("retries"), Some(1));

        let ctx = context(&[("HIL_FWR_PORT", "env")], &layers);
        let ns = ctx.resolve("fwr", &schema(), &Overrides::new()).unwrap();
        assert_eq!(ns.get_str("port"), Some("env"));
        assert_eq!(ns.source("port"), Some(ValueSource::Environment));

        let overrides = Overrides::new().with("port", "call");
        let ns = ctx.resolve("fwr", &schema(), &overrides).unwrap();
        assert_eq!(ns.get_str("port"), Some("call"));
        assert_eq!(ns.source("port"), Some(ValueSource::CallTime));
    }

    #[test]
    fn opted_out_option_ignores_environment() {
        let ctx = context(&[("HIL_FWR_TOKEN", "leak"), ("HIL_FWR_PORT", "p")], &[]);
        let ns = ctx.resolve("fwr", &schema(), &Overrides::new()).unwrap();
        assert!(!ns.contains("token"));
    }

    #[test]
    fn required_option_without_value_fails() {
        let ctx = context(&[], &[]);
        match ctx.resolve("fwr", &schema(), &Overrides::new()) {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("fwr_port"));
                assert!(msg.contains("HIL_FWR_PORT"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_override_fails() {
        let ctx = context(&[("HIL_FWR_PORT", "p")], &[]);
        let overrides = Overrides::new().with("baud", 9600);
        assert!(matches!(
            ctx.resolve("fwr", &schema(), &overrides),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn prefixed_override_keys_are_accepted() {
        let ctx = context(&[("HIL_FWR_PORT", "p")], &[]);
        let overrides = Overrides::new().with("fwr_force", "yes");
        let ns = ctx.resolve("fwr", &schema(), &overrides).unwrap();
        assert!(ns.get_bool("force"));
    }

    #[test]
    fn unparsable_value_names_its_source() {
        let ctx = context(&[("HIL_FWR_PORT", "p"), ("HIL_FWR_RETRIES", "lots")], &[]);
        match ctx.resolve("fwr", &schema(), &Overrides::new()) {
            Err(Error::Config(msg)) => assert!(msg.contains("HIL_FWR_RETRIES")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_rcfile_is_an_error() {
        let result = ConfigContext::discover(None, Some(Path::new("/no/such/hil.cfg")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
