use std::path::PathBuf;
use std::time::Duration;

use ferry_ack::AckManagerConfig;
use ferry_buffer::{BufferConfig, WalConfig};
use ferry_forward::ForwarderConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// A plugin reference: registered name plus free-form settings handed to
/// the plugin's factory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginSetting {
    pub name: String,
    #[serde(default = "empty_settings")]
    pub settings: Value,
}

fn empty_settings() -> Value {
    Value::Object(Default::default())
}

impl PluginSetting {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: empty_settings(),
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Deserialize the settings into a plugin's own config type.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> PipelineResult<T> {
        serde_json::from_value(self.settings.clone()).map_err(|e| PipelineError::PluginSettings {
            plugin: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Definition of one pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on one `Buffer::read` in the worker loop.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Back the buffer with a write-ahead log at this path.
    #[serde(default)]
    pub buffer_path: Option<PathBuf>,
    #[serde(default)]
    pub wal: WalConfig,
    /// Track events end to end with acknowledgement sets.
    #[serde(default)]
    pub acknowledgements: bool,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: Duration,
    #[serde(default)]
    pub ack_manager: AckManagerConfig,
    #[serde(default)]
    pub peer_forwarder: ForwarderConfig,
    pub source: PluginSetting,
    #[serde(default)]
    pub processors: Vec<PluginSetting>,
    pub sinks: Vec<PluginSetting>,
}

fn default_workers() -> usize {
    1
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(60)
}

impl PipelineConfig {
    /// Minimal config with no processors.
    pub fn new(name: impl Into<String>, source: PluginSetting, sinks: Vec<PluginSetting>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            read_timeout: default_read_timeout(),
            buffer: BufferConfig::default(),
            buffer_path: None,
            wal: WalConfig::default(),
            acknowledgements: false,
            ack_timeout: default_ack_timeout(),
            ack_manager: AckManagerConfig::default(),
            peer_forwarder: ForwarderConfig::default(),
            source,
            processors: Vec::new(),
            sinks,
        }
    }

    pub fn from_toml_str(s: &str) -> PipelineResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no plugin registry.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("pipeline name must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be positive".into()));
        }
        if self.sinks.is_empty() {
            return Err(PipelineError::Config(format!(
                "pipeline {:?} has no sinks",
                self.name
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(PipelineError::Config("read_timeout must be positive".into()));
        }
        self.buffer.validate()?;
        Ok(())
    }
}
