//! Layered configuration merged once into a flat, read-only store.
//!
//! Layers are applied in order; a later layer replaces an earlier layer's
//! value for the same top-level key. Nested tables are replaced whole, never
//! deep-merged.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Which kind of layer supplied a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerOrigin {
    Default,
    File,
    Override,
}

impl std::fmt::Display for LayerOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LayerOrigin::Default => "default",
            LayerOrigin::File => "file",
            LayerOrigin::Override => "override",
        };
        f.write_str(s)
    }
}

/// One source of key/value settings.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub origin: LayerOrigin,
    /// Human-readable source, e.g. a file path.
    pub source: String,
    pub values: Map<String, Value>,
}

impl ConfigLayer {
    pub fn new(origin: LayerOrigin, source: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            origin,
            source: source.into(),
            values,
        }
    }

    /// Built-in defaults applied beneath every other layer.
    pub fn defaults() -> Self {
        let values = json!({
            "noop": false,
            "work_dir": "build",
            "default_timeout_secs": 3600,
            "log_level": "info",
        });
        let values = match values {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(LayerOrigin::Default, "defaults", values)
    }

    /// Load a `.json` or `.toml` file whose top level is a table.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let source = path.display().to_string();
        let value: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            _ => {
                return Err(HarnessError::InvalidConfiguration {
                    key: source,
                    reason: "config files must end in .json or .toml".to_string(),
                })
            }
        };
        match value {
            Value::Object(values) => {
                debug!(source = %source, keys = values.len(), "Loaded config file");
                Ok(Self::new(LayerOrigin::File, source, values))
            }
            _ => Err(HarnessError::InvalidConfiguration {
                key: source,
                reason: "top level must be a table".to_string(),
            }),
        }
    }

    /// Parse `key=value` pairs. Values are read as JSON when they parse,
    /// otherwise kept as plain strings.
    pub fn from_overrides<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = Map::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, raw) = pair.split_once('=').ok_or_else(|| {
                HarnessError::InvalidConfiguration {
                    key: pair.to_string(),
                    reason: "override must look like key=value".to_string(),
                }
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(HarnessError::InvalidConfiguration {
                    key: pair.to_string(),
                    reason: "override key is empty".to_string(),
                });
            }
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            values.insert(key.to_string(), value);
        }
        Ok(Self::new(LayerOrigin::Override, "command line", values))
    }
}

/// A resolved key with the layer that won it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: Value,
    pub origin: LayerOrigin,
}

/// Merged configuration. There are no mutating methods after [`ConfigStore::load`].
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    entries: BTreeMap<String, ConfigEntry>,
}

impl ConfigStore {
    /// Merge layers in order, last layer wins per key.
    pub fn load(layers: impl IntoIterator<Item = ConfigLayer>) -> Self {
        let mut entries = BTreeMap::new();
        for layer in layers {
            for (key, value) in layer.values {
                entries.insert(
                    key.clone(),
                    ConfigEntry {
                        key,
                        value,
                        origin: layer.origin,
                    },
                );
            }
        }
        Self { entries }
    }

    /// Substitute `%(key)s` placeholders in every string value, including
    /// strings nested in lists and tables. `%%` stands for a literal `%`.
    ///
    /// A placeholder must name a top-level key holding a string, number or
    /// boolean; referenced strings are substituted first. Unknown keys,
    /// non-scalar targets and reference cycles are `InvalidConfiguration`.
    pub fn interpolate(mut self) -> Result<Self> {
        let pattern = Regex::new(r"%\((\w+)\)s|%%").map_err(|e| {
            HarnessError::InvalidConfiguration {
                key: "placeholder".to_string(),
                reason: e.to_string(),
            }
        })?;
        let mut interpolator = Interpolator {
            entries: &self.entries,
            pattern: &pattern,
            resolved: BTreeMap::new(),
            stack: Vec::new(),
        };
        for key in self.entries.keys() {
            interpolator.resolve(key)?;
        }
        let resolved = interpolator.resolved;
        for (key, value) in resolved {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.value = value;
            }
        }
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Typed lookup; `Ok(None)` when absent, an error when present but mistyped.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => decode(key, value).map(Some),
        }
    }

    pub fn get_as_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn require(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| HarnessError::MissingConfiguration {
                key: key.to_string(),
            })
    }

    pub fn require_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        decode(key, self.require(key)?)
    }

    pub fn origin(&self, key: &str) -> Option<LayerOrigin> {
        self.entries.get(key).map(|e| e.origin)
    }

    /// Entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Interpolator<'a> {
    entries: &'a BTreeMap<String, ConfigEntry>,
    pattern: &'a Regex,
    resolved: BTreeMap<String, Value>,
    /// Keys currently being resolved, for cycle detection.
    stack: Vec<String>,
}

impl Interpolator<'_> {
    fn resolve(&mut self, key: &str) -> Result<Value> {
        if let Some(value) = self.resolved.get(key) {
            return Ok(value.clone());
        }
        if self.stack.iter().any(|k| k == key) {
            return Err(HarnessError::InvalidConfiguration {
                key: key.to_string(),
                reason: format!(
                    "placeholder cycle: {} -> {key}",
                    self.stack.join(" -> ")
                ),
            });
        }
        let raw = match self.entries.get(key) {
            Some(entry) => entry.value.clone(),
            None => {
                return Err(HarnessError::MissingConfiguration {
                    key: key.to_string(),
                })
            }
        };

        self.stack.push(key.to_string());
        let value = self.substitute(key, &raw)?;
        self.stack.pop();

        self.resolved.insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn substitute(&mut self, owner: &str, value: &Value) -> Result<Value> {
        match value {
            Value::String(text) if text.contains('%') => {
                self.substitute_str(owner, text).map(Value::String)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(owner, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute(owner, v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn substitute_str(&mut self, owner: &str, text: &str) -> Result<String> {
        let pattern = self.pattern;
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in pattern.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                out.push('%');
                continue;
            };
            if !self.entries.contains_key(name) {
                return Err(HarnessError::InvalidConfiguration {
                    key: owner.to_string(),
                    reason: format!("unknown placeholder %({name})s"),
                });
            }
            match self.resolve(name)? {
                Value::String(s) => out.push_str(&s),
                Value::Number(n) => out.push_str(&n.to_string()),
                Value::Bool(b) => out.push_str(&b.to_string()),
                _ => {
                    return Err(HarnessError::InvalidConfiguration {
                        key: owner.to_string(),
                        reason: format!("placeholder %({name})s does not name a scalar"),
                    })
                }
            }
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    T::deserialize(value).map_err(|e| HarnessError::InvalidConfiguration {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
