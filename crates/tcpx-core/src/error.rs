use crate::types::OperationKind;
use thiserror::Error;

/// Every failure the engine can surface.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A native call failed. `code` is the raw OS error number.
    #[error("platform call `{op}` failed with native code {code}")]
    Platform { op: &'static str, code: i32 },

    /// No free segment at checkout. Backpressure is the caller's policy.
    #[error("buffer arena exhausted: all {capacity} segments are checked out")]
    PoolExhausted { capacity: usize },

    /// A second receive (or send) while the first is unresolved.
    #[error("a {0} is already outstanding on this connection")]
    AlreadyPending(OperationKind),

    /// Fatal, reactor-scoped: the completion queue can no longer be trusted.
    #[error("completion queue of reactor {reactor} is corrupted")]
    QueueCorrupted { reactor: usize },

    /// Orderly shutdown observed (peer FIN, local disconnect, or cancellation).
    #[error("connection closed")]
    ConnectionClosed,

    #[error("payload of {len} bytes exceeds the segment length of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// The reactor or supervisor is no longer accepting work.
    #[error("engine stopped")]
    Stopped,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("failed to parse settings: {0}")]
    SettingsParse(#[from] toml::de::Error),

    #[error("failed to read settings file: {0}")]
    SettingsRead(#[source] std::io::Error),
}

impl EngineError {
    /// Captures `errno` for the native call `op` that just failed.
    pub fn last_os_error(op: &'static str) -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        EngineError::Platform { op, code }
    }

    pub fn platform(op: &'static str, code: i32) -> Self {
        EngineError::Platform { op, code }
    }

    /// True for errors after which the connection cannot be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::Platform { .. }
                | EngineError::QueueCorrupted { .. }
                | EngineError::ConnectionClosed
                | EngineError::Stopped
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Platform {
            op: "io",
            code: e.raw_os_error().unwrap_or(-1),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
