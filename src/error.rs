//! Error types for the crate

use thiserror::Error;

/// Main error type for analytics operations
#[derive(Error, Debug)]
pub enum Error {
    /// Connecting to Redis or borrowing a pooled connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A Redis command failed
    #[error("Command error: {0}")]
    Command(String),

    /// Script loading or invocation failed
    #[error("Script error: {0}")]
    Script(String),

    /// A resolved key list exceeds the script runtime's argument ceiling
    ///
    /// The span/granularity combination is too large for a single
    /// evaluation; the request must not be retried as-is.
    #[error("Too many keys for one script call: {count} (max {max})")]
    KeyRangeExceeded {
        /// Number of keys the time frame resolved to
        count: usize,
        /// Maximum keys one script invocation accepts
        max: usize,
    },

    /// A time specification could not be interpreted
    #[error("Invalid time specification: {0}")]
    TimeSpec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoding or decoding a value failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Serializing script arguments or parsing script results failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error originated in the store and may be swallowed
    /// under the `silent` configuration.
    ///
    /// Caller mistakes (time specs, configuration, oversized key ranges)
    /// always propagate.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Command(_) | Error::Script(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(Error::Connection("refused".into()).is_store_error());
        assert!(Error::Command("WRONGTYPE".into()).is_store_error());
        assert!(Error::Script("NOSCRIPT".into()).is_store_error());

        assert!(!Error::KeyRangeExceeded { count: 9000, max: 8000 }.is_store_error());
        assert!(!Error::TimeSpec("bad".into()).is_store_error());
        assert!(!Error::Config("bad".into()).is_store_error());
    }

    #[test]
    fn test_key_range_message() {
        let e = Error::KeyRangeExceeded { count: 9001, max: 8000 };
        assert!(e.to_string().contains("9001"));
        assert!(e.to_string().contains("8000"));
    }
}
