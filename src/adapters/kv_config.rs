//! Key-value device configuration adapter.
//!
//! Implements [`ConfigPort`] over an in-memory map. Entries are stored
//! under a `section::key` composite name, so `sysInfo.w_mode` lives at
//! `sysInfo::w_mode`; the port API always speaks full dotted names.
//!
//! # Validation
//!
//! Keys known to be numeric reject text that does not parse as an
//! integer. Everything else is accepted as given.
//!
//! # Persistence
//!
//! With a backing file, every successful `set` rewrites the file as a
//! flat JSON object (`{"sysInfo.w_mode": 2, ...}`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::{Map, Value};

use crate::app::ports::{ConfigError, ConfigPort, ConfigValue};
use crate::config::keys;

const NUMERIC_KEYS: &[&str] = &[
    keys::WORK_MODE,
    keys::DATA_CHANNEL,
    keys::OUTPUT_CHANNEL,
    keys::NFC_OUTPUT_CHANNEL,
    keys::BLE_OUTPUT_CHANNEL,
    keys::NETWORK_OUTPUT,
    keys::REPORT_TIMEOUT,
    keys::SAFE_OPEN,
    keys::CODE_SWITCH,
    keys::NFC_ENABLED,
    keys::SCAN_MODE,
    keys::SCAN_INTERVAL,
    keys::BEEP_ON_SCAN,
    keys::BEEP_ON_NFC,
    keys::NFC_REPORT,
    keys::BEEP_DURATION,
    keys::HEART_ENABLED,
    keys::HEART_PERIOD,
    keys::BLE_FORMAT,
    keys::BLE_AFFIX_MODE,
    keys::BLE_APPEND_CR,
    keys::BLE_APPEND_LF,
];

#[derive(Debug, Default)]
pub struct MemoryConfig {
    store: HashMap<String, ConfigValue>,
    backing: Option<PathBuf>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    fn composite_key(key: &str) -> String {
        match key.split_once('.') {
            Some((section, name)) => format!("{}::{}", section, name),
            None => key.to_owned(),
        }
    }

    fn dotted_key(composite: &str) -> String {
        composite.replacen("::", ".", 1)
    }

    /// Store without validation or persistence. Test and seeding helper.
    pub fn insert(&mut self, key: &str, value: impl Into<ConfigValue>) {
        self.store.insert(Self::composite_key(key), value.into());
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Seed from a JSON object. Both flat (`{"sysInfo.w_mode": 2}`) and
    /// nested (`{"sysInfo": {"w_mode": 2}}`) layouts are accepted.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let root: Map<String, Value> = serde_json::from_str(json).map_err(|e| {
            warn!("CONFIG: device config is not a JSON object: {}", e);
            ConfigError::IoError
        })?;
        let mut cfg = Self::new();
        for (name, value) in root {
            match value {
                Value::Object(section) => {
                    for (k, v) in section {
                        cfg.insert_json(&format!("{}.{}", name, k), v);
                    }
                }
                v => cfg.insert_json(&name, v),
            }
        }
        Ok(cfg)
    }

    fn insert_json(&mut self, key: &str, value: Value) {
        let value = match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Number(i),
                None => ConfigValue::Text(n.to_string()),
            },
            Value::String(s) => ConfigValue::Text(s),
            Value::Bool(b) => ConfigValue::Number(i64::from(b)),
            other => ConfigValue::Text(other.to_string()),
        };
        self.store.insert(Self::composite_key(key), value);
    }

    /// Load `path` if it exists and persist every later change back to it.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| {
                warn!("CONFIG: cannot read {}: {}", path.display(), e);
                ConfigError::IoError
            })?;
            Self::from_json(&text)?
        } else {
            Self::new()
        };
        info!("CONFIG: {} keys from {}", cfg.len(), path.display());
        cfg.backing = Some(path.to_path_buf());
        Ok(cfg)
    }

    fn validate(key: &str, value: &ConfigValue) -> Result<(), ConfigError> {
        if NUMERIC_KEYS.contains(&key) && value.as_i64().is_none() {
            return Err(ConfigError::Rejected(key.to_owned()));
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.backing else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&Value::Object(self.snapshot()))
            .map_err(|_| ConfigError::IoError)?;
        std::fs::write(path, text).map_err(|e| {
            warn!("CONFIG: cannot write {}: {}", path.display(), e);
            ConfigError::IoError
        })
    }
}

impl ConfigPort for MemoryConfig {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.store.get(&Self::composite_key(key)).cloned()
    }

    fn set(&mut self, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        Self::validate(key, &value)?;
        self.store.insert(Self::composite_key(key), value);
        self.persist()
    }

    fn snapshot(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut entries: Vec<_> = self.store.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in entries {
            let value = match v {
                ConfigValue::Number(n) => Value::from(*n),
                ConfigValue::Text(s) => Value::from(s.as_str()),
            };
            map.insert(Self::dotted_key(k), value);
        }
        map
    }
}
