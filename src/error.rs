use thiserror::Error;

/// Errors raised by the emulator itself, as opposed to errors returned by user handlers.
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// A binding in the config file is malformed. Only that binding is skipped.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid interval format: {0:?}")]
    InvalidIntervalFormat(String),

    /// The handler failed, panicked, timed out or returned a malformed result.
    #[error("handler {handler} failed: {message}")]
    HandlerFault { handler: String, message: String },

    /// The listener could not be started. This one is fatal.
    #[error("startup error: {0}")]
    Startup(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigFormat {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl EmulatorError {
    pub fn handler_fault<H: Into<String>, M: ToString>(handler: H, message: M) -> Self {
        Self::HandlerFault {
            handler: handler.into(),
            message: message.to_string(),
        }
    }
}

/// Errors reported by a [crate::stream::StreamSource].
#[derive(Debug, Error)]
pub enum StreamError {
    /// The table has no stream, or the stream, shard or iterator is gone.
    /// The poller goes back to shard discovery on this one.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else, e.g. DynamoDB Local is not running. Retried on the next tick.
    #[error("{0}")]
    Transport(String),
}

pub type EmulatorResult<T> = Result<T, EmulatorError>;
