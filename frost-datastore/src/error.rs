//! Error taxonomy for the storage engine.
//!
//! Everything fallible returns `anyhow::Error`; this enum is the typed core
//! wrapped inside it, so callers that care (the CLI, tests) can classify a
//! failure with `err.downcast_ref::<FrostError>()` while everything else
//! just propagates with `?`.

/// Classified storage engine failures.
#[derive(thiserror::Error, Debug)]
pub enum FrostError {
    /// Magic mismatch, block sizes that do not fit the file, out-of-range
    /// offsets, a multichunk whose plaintext hash does not match its name.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// Wrong key material or an integrity mismatch after decryption.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Read/write/mmap/grow failures; disk full on grow is the common case.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing chunk, multichunk file or revision.
    #[error("not found: {0}")]
    NotFound(String),

    /// Overwrite forbidden, bad permissions on protected files.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Cooperative stop was requested.
    #[error("interrupted")]
    Interrupted,
}

/// Shorthand for a `BadFormat` error wrapped in `anyhow::Error`.
pub fn bad_format(msg: impl Into<String>) -> anyhow::Error {
    FrostError::BadFormat(msg.into()).into()
}

/// Shorthand for a `Crypto` error wrapped in `anyhow::Error`.
pub fn crypto_err(msg: impl Into<String>) -> anyhow::Error {
    FrostError::Crypto(msg.into()).into()
}

/// Wrap an I/O failure so it stays classifiable, with a context message.
pub fn io_err(msg: impl Into<String>, err: std::io::Error) -> anyhow::Error {
    anyhow::Error::new(FrostError::Io(err)).context(msg.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_failures_stay_classifiable() {
        let err = io_err(
            "growing the index",
            std::io::Error::from(std::io::ErrorKind::WriteZero),
        );
        assert!(matches!(
            err.downcast_ref::<FrostError>(),
            Some(FrostError::Io(_))
        ));
        assert!(err.to_string().contains("growing the index"));

        let err = bad_format("catalog at offset 7");
        assert!(matches!(
            err.downcast_ref::<FrostError>(),
            Some(FrostError::BadFormat(_))
        ));
    }
}

/// Shorthand for a `NotFound` error wrapped in `anyhow::Error`.
pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
    FrostError::NotFound(msg.into()).into()
}
