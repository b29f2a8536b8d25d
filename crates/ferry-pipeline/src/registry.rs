use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{PipelineConfig, PluginSetting};
use crate::error::{PipelineError, PipelineResult, PluginKind};
use crate::plugin::{Processor, Sink, Source};

pub type SourceFactory = Box<dyn Fn(&PluginSetting) -> PipelineResult<Arc<dyn Source>> + Send + Sync>;
pub type ProcessorFactory =
    Box<dyn Fn(&PluginSetting) -> PipelineResult<Box<dyn Processor>> + Send + Sync>;
pub type SinkFactory = Box<dyn Fn(&PluginSetting) -> PipelineResult<Arc<dyn Sink>> + Send + Sync>;

/// Maps plugin names to constructors.
///
/// Everything a pipeline names must be registered before the pipeline is
/// built; [`PluginRegistry::validate`] checks that up front so a typo fails
/// at startup rather than when the first batch arrives.
#[derive(Default)]
pub struct PluginRegistry {
    sources: HashMap<String, SourceFactory>,
    processors: HashMap<String, ProcessorFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> PipelineResult<Arc<dyn Source>> + Send + Sync + 'static,
    {
        self.sources.insert(name.into(), Box::new(factory));
        self
    }

    pub fn register_processor<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> PipelineResult<Box<dyn Processor>> + Send + Sync + 'static,
    {
        self.processors.insert(name.into(), Box::new(factory));
        self
    }

    pub fn register_sink<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> PipelineResult<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        self.sinks.insert(name.into(), Box::new(factory));
        self
    }

    pub fn has(&self, kind: PluginKind, name: &str) -> bool {
        match kind {
            PluginKind::Source => self.sources.contains_key(name),
            PluginKind::Processor => self.processors.contains_key(name),
            PluginKind::Sink => self.sinks.contains_key(name),
        }
    }

    /// Report the first plugin `config` names that is not registered.
    pub fn validate(&self, config: &PipelineConfig) -> PipelineResult<()> {
        let wanted = std::iter::once((PluginKind::Source, &config.source))
            .chain(config.processors.iter().map(|p| (PluginKind::Processor, p)))
            .chain(config.sinks.iter().map(|s| (PluginKind::Sink, s)));
        for (kind, setting) in wanted {
            if !self.has(kind, &setting.name) {
                return Err(unknown(kind, &setting.name));
            }
        }
        Ok(())
    }

    pub fn build_source(&self, setting: &PluginSetting) -> PipelineResult<Arc<dyn Source>> {
        let factory = self
            .sources
            .get(&setting.name)
            .ok_or_else(|| unknown(PluginKind::Source, &setting.name))?;
        factory(setting)
    }

    pub fn build_processor(&self, setting: &PluginSetting) -> PipelineResult<Box<dyn Processor>> {
        let factory = self
            .processors
            .get(&setting.name)
            .ok_or_else(|| unknown(PluginKind::Processor, &setting.name))?;
        factory(setting)
    }

    pub fn build_sink(&self, setting: &PluginSetting) -> PipelineResult<Arc<dyn Sink>> {
        let factory = self
            .sinks
            .get(&setting.name)
            .ok_or_else(|| unknown(PluginKind::Sink, &setting.name))?;
        factory(setting)
    }
}

fn unknown(kind: PluginKind, name: &str) -> PipelineError {
    PipelineError::UnknownPlugin {
        kind,
        name: name.to_string(),
    }
}
