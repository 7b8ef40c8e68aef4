//! Error types.
//!
//! All validation happens at construction time. A correctly constructed map
//! never fails from `get`/`put`/`remove`/`replace`; the only runtime error is
//! misuse of [`Iter::remove_current`](crate::Iter::remove_current).

use thiserror::Error;

/// Rejected construction parameters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Load factor must be a finite number greater than zero.
    #[error("load factor must be positive and finite, got {0}")]
    InvalidLoadFactor(f32),

    /// Concurrency level must be at least one.
    #[error("concurrency level must be positive")]
    ZeroConcurrencyLevel,
}

/// Returned by [`Iter::remove_current`](crate::Iter::remove_current) when no
/// element has been yielded since the last removal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no current entry to remove")]
pub struct NoCurrentEntry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_parameter() {
        assert_eq!(
            ConfigError::InvalidLoadFactor(-1.0).to_string(),
            "load factor must be positive and finite, got -1"
        );
        assert!(ConfigError::ZeroConcurrencyLevel
            .to_string()
            .contains("concurrency level"));
        assert_eq!(NoCurrentEntry.to_string(), "no current entry to remove");
    }

    #[test]
    fn implements_std_error() {
        fn assert_error<T: std::error::Error + Send + Sync + 'static>() {}
        assert_error::<ConfigError>();
        assert_error::<NoCurrentEntry>();
    }
}
