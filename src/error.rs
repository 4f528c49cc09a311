use thiserror::Error;

/// Errors surfaced by probe components.
///
/// Per-packet problems (malformed input, cache pressure, plugin flush
/// requests) are never errors; they are counters or control-flow flags.
/// `ProbeError` covers configuration mistakes, plugin failures and I/O
/// faults that abort a worker or the whole process.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Invalid configuration detected before the pipeline starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A plugin rejected its parameters or failed at runtime.
    #[error("plugin `{name}`: {reason}")]
    Plugin { name: String, reason: String },

    /// Underlying socket or file error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    pub fn plugin(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Plugin {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
