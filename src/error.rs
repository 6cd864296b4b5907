//! Unified error handling for banwatch.

use thiserror::Error;

/// Errors raised by the attack record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Serialize(_) => "serialize_error",
        }
    }
}

/// Errors raised by the slow brute-force detector.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid log glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_codes() {
        let io = StoreError::Io(std::io::Error::other("boom"));
        assert_eq!(io.error_code(), "io_error");
    }
}
