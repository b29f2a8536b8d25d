use ferry_ack::AckError;
use ferry_buffer::BufferError;
use ferry_coord::CoordError;
use ferry_forward::ForwardError;
use ferry_types::TypeError;
use thiserror::Error;

/// Which registry a plugin name is looked up in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginKind {
    Source,
    Processor,
    Sink,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Processor => f.write_str("processor"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown {kind} plugin: {name:?}")]
    UnknownPlugin { kind: PluginKind, name: String },

    #[error("invalid settings for plugin {plugin:?}: {reason}")]
    PluginSettings { plugin: String, reason: String },

    #[error("plugin {plugin:?} failed: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("pipeline {0:?} is already running")]
    AlreadyStarted(String),

    #[error("pipeline {0:?} is not running")]
    NotStarted(String),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("forwarding error: {0}")]
    Forward(#[from] ForwardError),

    #[error("acknowledgement error: {0}")]
    Ack(#[from] AckError),

    #[error("coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("event error: {0}")]
    Event(#[from] TypeError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Shorthand for plugins reporting their own failures.
    pub fn plugin(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }
}
