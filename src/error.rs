use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("checksum mismatch reading block {addr}")]
    ChecksumMismatch { addr: u32 },
}

impl EngineError {
    /// Structural damage detected in a page or block image. Fatal in debug
    /// builds, reported to the caller in release builds.
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "corruption: {msg}");
        EngineError::Corruption(msg)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
