use std::io;

/// Crate-wide error type. Variants map to the error kinds the daemon distinguishes
/// operationally, not to individual failing syscalls.
#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to initialize {resource}: {source}")]
    ResourceInit {
        resource: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("baseline invalid: {0}")]
    BaselineInvalid(String),
}

pub type Result<T> = std::result::Result<T, GuardianError>;
