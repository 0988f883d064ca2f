//! YAML experiment configuration.
//!
//! A run is described by one nested mapping with `solver`, `model`, `optim`
//! (or `g_optim` / `d_optim`) and `data` sections. Keys are addressed with
//! dotted paths such as `solver.batch_size`. Every trainer reads the keys it
//! needs when it is constructed, so a missing key aborts the run before any
//! data is touched.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    root: Value,
    /// Dotted path of this mapping inside the file it came from, used in
    /// error messages (`model.gen.` for a `section("model.gen")`).
    prefix: String,
}

impl Config {
    pub fn from_value(root: Value) -> Config {
        Config { root, prefix: String::new() }
    }

    pub fn from_yaml_str(text: &str) -> Result<Config> {
        let root: Value = serde_yaml::from_str(text)?;
        match root {
            Value::Mapping(_) => Ok(Config { root, prefix: String::new() }),
            Value::Null => Ok(Config { root: Value::Mapping(Mapping::new()), prefix: String::new() }),
            _ => Err(Error::Config("top level of a config file must be a mapping".into())),
        }
    }

    /// Reads the experiment config and, when given, merges every entry of the
    /// machine-local path file into the `data` section (corpus roots live
    /// there so that experiment files stay portable).
    pub fn load(path: &Path, local_paths: Option<&Path>) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        let mut config = Config::from_yaml_str(&text)?;

        if let Some(local) = local_paths {
            let text = fs::read_to_string(local)?;
            let paths = Config::from_yaml_str(&text)?;
            if let Value::Mapping(entries) = paths.root {
                for (key, value) in entries {
                    let key = key.as_str()
                        .ok_or_else(|| Error::Config("path file keys must be strings".into()))?
                        .to_string();
                    config.set(&format!("data.{key}"), value);
                }
            }
        }
        Ok(config)
    }

    pub fn value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.root, |node, part| node.get(part))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_null())
    }

    /// Required key; absence is a fatal configuration error.
    pub fn req<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        match self.get(key) {
            Some(v) if !v.is_null() => decode(&self.full_key(key), v),
            _ => Err(Error::MissingConfig(self.full_key(key))),
        }
    }

    pub fn opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(v) if !v.is_null() => decode(&self.full_key(key), v).map(Some),
            _ => Ok(None),
        }
    }

    pub fn or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.opt(key)?.unwrap_or(default))
    }

    /// Required nested mapping, returned as its own `Config`.
    pub fn section(&self, key: &str) -> Result<Config> {
        match self.get(key) {
            Some(v @ Value::Mapping(_)) => Ok(Config {
                root: v.clone(),
                prefix: format!("{}.", self.full_key(key)),
            }),
            Some(_) => Err(Error::Config(format!("`{}` must be a mapping", self.full_key(key)))),
            None => Err(Error::MissingConfig(self.full_key(key))),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Inserts `value` at a dotted path, creating intermediate mappings.
    pub fn set<V: Serialize>(&mut self, key: &str, value: V) {
        let value = serde_yaml::to_value(value).unwrap_or(Value::Null);
        let mut parts: Vec<&str> = key.split('.').collect();
        let last = parts.pop().unwrap_or_default();
        let mut node = &mut self.root;
        for part in parts {
            let current = node;
            if !current.is_mapping() {
                *current = Value::Mapping(Mapping::new());
            }
            node = match current {
                Value::Mapping(map) => map
                    .entry(Value::String(part.to_string()))
                    .or_insert(Value::Mapping(Mapping::new())),
                _ => unreachable!(),
            };
        }
        if !node.is_mapping() {
            *node = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(map) = node {
            map.insert(Value::String(last.to_string()), value);
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(&self.root)?;
        fs::write(path, text)?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(key: &str, v: &Value) -> Result<T> {
    serde_yaml::from_value(v.clone())
        .map_err(|e| Error::Config(format!("`{key}`: {e}")))
}
