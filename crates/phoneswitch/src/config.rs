use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::types::ApnType;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArbiterConfigInput {
    pub version: u32,
    pub endpoint_count: Option<usize>,
    pub attach_ahead: Option<bool>,
    pub queue_capacity: Option<usize>,
    pub retry_interval_ms: Option<u64>,
    pub state_file: Option<String>,
    pub apn_priority: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub version: u32,
    pub endpoint_count: usize,
    /// Pre-attach the fallback endpoint while no request exists.
    pub attach_ahead: bool,
    pub queue_capacity: usize,
    pub retry_interval: Duration,
    pub state_file: Option<PathBuf>,
    pub apn_priority: BTreeMap<ApnType, i32>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            endpoint_count: 2,
            attach_ahead: true,
            queue_capacity: 256,
            retry_interval: Duration::from_millis(500),
            state_file: None,
            apn_priority: BTreeMap::new(),
        }
    }
}

impl ArbiterConfigInput {
    pub fn resolve(self) -> Result<ArbiterConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let defaults = ArbiterConfig::default();

        let endpoint_count = self.endpoint_count.unwrap_or(defaults.endpoint_count);
        if endpoint_count == 0 {
            return Err("endpoint_count must be at least 1".to_string());
        }

        let mut apn_priority = BTreeMap::new();
        for (name, prio) in self.apn_priority {
            let apn = name.parse::<ApnType>()?;
            apn_priority.insert(apn, prio);
        }

        let state_file = self.state_file.and_then(|path| {
            let trimmed = path.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            }
        });

        Ok(ArbiterConfig {
            version,
            endpoint_count,
            attach_ahead: self.attach_ahead.unwrap_or(defaults.attach_ahead),
            queue_capacity: self
                .queue_capacity
                .unwrap_or(defaults.queue_capacity)
                .max(16),
            retry_interval: self
                .retry_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            state_file,
            apn_priority,
        })
    }
}

impl ArbiterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ArbiterConfig::default());
        }
        let parsed: ArbiterConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }
}
