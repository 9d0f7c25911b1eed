use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub threads: ThreadSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Per-reference settings, keyed by processor reference.
    #[serde(default)]
    pub processors: BTreeMap<String, ProcessorSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Worker-group sizing and stop policy for one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSettings {
    #[serde(default = "default_thread_count")]
    pub count: usize,
    /// Exit a worker when its queue stays empty for `timeout_secs`.
    #[serde(default = "default_stop")]
    pub stop: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            count: default_thread_count(),
            stop: default_stop(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_thread_count() -> usize {
    3
}
fn default_stop() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    2
}

/// Partial thread settings; unset fields fall through to the next layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ThreadOverrides {
    pub fn apply(&self, base: ThreadSettings) -> ThreadSettings {
        ThreadSettings {
            count: self.count.unwrap_or(base.count),
            stop: self.stop.unwrap_or(base.stop),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

/// Settings a processor is instantiated with. Persisted as JSON on the
/// processor row so a reload rebuilds the same instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    #[serde(default)]
    pub threads: ThreadOverrides,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    /// Settings configured for `reference`, or defaults.
    pub fn processor_settings(&self, reference: &str) -> ProcessorSettings {
        self.processors.get(reference).cloned().unwrap_or_default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.threads.count == 0 {
        anyhow::bail!("threads.count must be >= 1");
    }

    if config.pipeline.queue_capacity == 0 {
        anyhow::bail!("pipeline.queue_capacity must be >= 1");
    }

    for (reference, settings) in &config.processors {
        if settings.threads.count == Some(0) {
            anyhow::bail!("processors.\"{}\".threads.count must be >= 1", reference);
        }
    }

    Ok(config)
}
