//! INI configuration layers.
//!
//! Each file is parsed into a `section -> key -> value` table. Tables are
//! merged per key in layer order, then flattened into underscore-joined keys:
//! `[hil]` holds flat keys, while `[hil:group]` and `[group]` contribute
//! `group_<key>`. Values are interpolated on demand with `${key}`,
//! `${section:key}` and `$$`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ::config::{Config, File, FileFormat};

use crate::error::{Error, Result};

use super::namespace::ValueSource;

/// Name of the root section.
pub const ROOT_SECTION: &str = "hil";

/// File-backed configuration layers, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    System,
    User,
    Project,
    OverrideFile,
}

impl Layer {
    pub fn source(self) -> ValueSource {
        match self {
            Layer::System => ValueSource::System,
            Layer::User => ValueSource::User,
            Layer::Project => ValueSource::Project,
            Layer::OverrideFile => ValueSource::OverrideFile,
        }
    }
}

/// `section -> key -> raw value`, all names lower-cased.
pub type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Loads an INI file. Returns `None` if the file does not exist.
pub fn load_file(path: &Path) -> Result<Option<Sections>> {
    if !path.is_file() {
        return Ok(None);
    }
    let config = Config::builder()
        .add_source(File::from(path).format(FileFormat::Ini).required(false))
        .build()?;
    into_sections(config, &path.display().to_string()).map(Some)
}

/// Parses INI text; `origin` names the source in error messages.
pub fn parse_str(origin: &str, text: &str) -> Result<Sections> {
    let config = Config::builder()
        .add_source(File::from_str(text, FileFormat::Ini))
        .build()?;
    into_sections(config, origin)
}

fn into_sections(config: Config, origin: &str) -> Result<Sections> {
    let raw: HashMap<String, ::config::Value> = config.try_deserialize()?;
    let mut sections = Sections::new();
    for (section, value) in raw {
        let table = match value.into_table() {
            Ok(table) => table,
            Err(_) => {
                tracing::warn!(origin, key = %section, "ignoring option outside of any section");
                continue;
            }
        };
        let entries = sections.entry(section.to_lowercase()).or_default();
        for (key, value) in table {
            let text = value.into_string().map_err(|e| {
                Error::Config(format!("{}: [{}] {}: {}", origin, section, key, e))
            })?;
            entries.insert(key.to_lowercase(), text);
        }
    }
    Ok(sections)
}

#[derive(Debug, Clone)]
struct RawEntry {
    value: String,
    layer: Layer,
    origin: String,
}

/// Where a flat key is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub section: String,
    pub key: String,
    pub layer: Layer,
}

/// File layers merged per key, with flattening and interpolation.
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    merged: BTreeMap<String, BTreeMap<String, RawEntry>>,
    flat: BTreeMap<String, (FlatEntry, (Layer, u8, usize))>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers `sections` on top of what has been merged so far.
    ///
    /// Layers must be pushed in increasing precedence; within a layer later
    /// pushes win.
    pub fn push(&mut self, layer: Layer, origin: &str, sections: Sections) {
        for (section, entries) in sections {
            for (key, value) in entries {
                self.merged.entry(section.clone()).or_default().insert(
                    key.clone(),
                    RawEntry {
                        value,
                        layer,
                        origin: origin.to_string(),
                    },
                );
                self.flatten(&section, &key, layer);
            }
        }
    }

    fn flatten(&mut self, section: &str, key: &str, layer: Layer) {
        let (flat_key, rank) = if section == ROOT_SECTION {
            (key.to_string(), 0)
        } else if let Some(group) = section.strip_prefix("hil:") {
            (format!("{}_{}", group, key), 2)
        } else {
            (format!("{}_{}", section, key), 1)
        };
        let priority = (layer, rank, section.len());
        let entry = FlatEntry {
            section: section.to_string(),
            key: key.to_string(),
            layer,
        };
        match self.flat.get(&flat_key) {
            Some((_, existing)) if *existing > priority => {}
            _ => {
                self.flat.insert(flat_key, (entry, priority));
            }
        }
    }

    /// The `(section, key)` a flat key resolves to.
    pub fn lookup(&self, flat_key: &str) -> Option<&FlatEntry> {
        self.flat.get(flat_key).map(|(entry, _)| entry)
    }

    /// Resolves a flat key to its interpolated value and layer.
    pub fn get(&self, flat_key: &str) -> Result<Option<(String, Layer)>> {
        match self.lookup(flat_key) {
            None => Ok(None),
            Some(entry) => {
                let value = self.interpolated(&entry.section, &entry.key)?;
                Ok(Some((value, entry.layer)))
            }
        }
    }

    /// The interpolated value of `key` in `section`.
    pub fn interpolated(&self, section: &str, key: &str) -> Result<String> {
        let mut stack = Vec::new();
        self.resolve(section, key, &mut stack)
    }

    fn raw(&self, section: &str, key: &str) -> Option<&RawEntry> {
        self.merged.get(section).and_then(|s| s.get(key))
    }

    fn resolve(
        &self,
        section: &str,
        key: &str,
        stack: &mut Vec<(String, String)>,
    ) -> Result<String> {
        let node = (section.to_string(), key.to_string());
        if stack.contains(&node) {
            let chain: Vec<String> = stack
                .iter()
                .chain(std::iter::once(&node))
                .map(|(s, k)| format!("{}:{}", s, k))
                .collect();
            return Err(Error::Config(format!(
                "interpolation cycle: {}",
                chain.join(" -> ")
            )));
        }
        let entry = self.raw(section, key).ok_or_else(|| {
            Error::Config(format!("no option '{}' in section '{}'", key, section))
        })?;

        stack.push(node);
        let expanded = self.expand(&entry.value, section, &entry.origin, stack);
        stack.pop();
        expanded
    }

    fn expand(
        &self,
        raw: &str,
        section: &str,
        origin: &str,
        stack: &mut Vec<(String, String)>,
    ) -> Result<String> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            if let Some(tail) = after.strip_prefix('$') {
                out.push('$');
                rest = tail;
            } else if let Some(tail) = after.strip_prefix('{') {
                let end = tail.find('}').ok_or_else(|| {
                    Error::Config(format!(
                        "{}: unterminated reference in '[{}]' value '{}'",
                        origin, section, raw
                    ))
                })?;
                let reference = tail[..end].trim().to_lowercase();
                out.push_str(&self.reference(&reference, section, origin, stack)?);
                rest = &tail[end + 1..];
            } else {
                out.push('$');
                rest = after;
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn reference(
        &self,
        reference: &str,
        section: &str,
        origin: &str,
        stack: &mut Vec<(String, String)>,
    ) -> Result<String> {
        let (target_section, target_key) = match reference.split_once(':') {
            // `hil:group:key` style references name a qualified section
            Some((sec, key)) if key.contains(':') => match key.rsplit_once(':') {
                Some((group, key)) => (format!("{}:{}", sec, group), key.to_string()),
                None => (sec.to_string(), key.to_string()),
            },
            Some((sec, key)) => (sec.to_string(), key.to_string()),
            None if self.raw(section, reference).is_some() => {
                (section.to_string(), reference.to_string())
            }
            None => (ROOT_SECTION.to_string(), reference.to_string()),
        };
        if self.raw(&target_section, &target_key).is_none() {
            return Err(Error::Config(format!(
                "{}: cannot resolve '${{{}}}' referenced from section '{}'",
                origin, reference, section
            )));
        }
        self.resolve(&target_section, &target_key, stack)
    }
}
