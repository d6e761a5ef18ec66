use thiserror::Error;

/// Failure raised by a plugin hook.
///
/// The registry never swallows these; they surface from the metering loop
/// wrapped in [`MeterError::Plugin`].
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    pub fn failed(msg: impl Into<String>) -> Self {
        PluginError::Failed(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("packet source error: {0}")]
    Source(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin `{plugin}` failed: {source}")]
    Plugin {
        plugin: String,
        #[source]
        source: PluginError,
    },

    #[error("metering thread terminated unexpectedly")]
    ProducerPanicked,
}

pub type Result<T> = std::result::Result<T, MeterError>;
