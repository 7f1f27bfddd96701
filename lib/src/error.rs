use std::fmt;

use crate::transform::TransformState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which external collaborator of the signing step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStage {
    Signer,
    Timestamp,
}

impl fmt::Display for BackendStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStage::Signer => f.write_str("signing"),
            BackendStage::Timestamp => f.write_str("timestamp"),
        }
    }
}

/// Where the write side stopped. Every stage past `Open` had a staged copy
/// that was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    Open,
    Copy,
    Embed,
    Commit,
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStage::Open => f.write_str("opening the staging file"),
            ApplyStage::Copy => f.write_str("copying the source"),
            ApplyStage::Embed => f.write_str("embedding the signature"),
            ApplyStage::Commit => f.write_str("committing"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("no embedded signature found")]
    Missing,

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("digest mismatch: signed {signed}, computed {computed}")]
    DigestMismatch { signed: String, computed: String },

    #[error("extended digest mismatch: embedded {embedded}, computed {computed}")]
    ExtendedDigestMismatch { embedded: String, computed: String },

    #[error("signature check failed: {0}")]
    BadSignature(String),

    #[error("unsupported signer key: {0}")]
    UnsupportedKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The container failed structural parsing. Nothing was mutated.
    #[error("malformed container: {0}")]
    Format(String),

    /// The canonicalization producer failed mid-stream.
    #[error("canonical stream failed: {0}")]
    Stream(String),

    #[error("{stage} backend failed: {message}")]
    SignBackend {
        stage: BackendStage,
        message: String,
    },

    #[error("apply failed while {stage}, original left untouched: {message}")]
    Apply { stage: ApplyStage, message: String },

    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{operation} is not allowed once the transformer is {state}")]
    State {
        operation: &'static str,
        state: TransformState,
    },

    #[error("registry: {0}")]
    Registry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn format(message: impl fmt::Display) -> Self {
        Error::Format(message.to_string())
    }

    pub(crate) fn apply(stage: ApplyStage, message: impl fmt::Display) -> Self {
        Error::Apply {
            stage,
            message: message.to_string(),
        }
    }

    pub(crate) fn backend(stage: BackendStage, message: impl fmt::Display) -> Self {
        Error::SignBackend {
            stage,
            message: message.to_string(),
        }
    }

    /// Short name of the pipeline stage this error came from.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Format(_) => "transform",
            Error::Stream(_) => "stream",
            Error::SignBackend {
                stage: BackendStage::Signer,
                ..
            } => "sign",
            Error::SignBackend {
                stage: BackendStage::Timestamp,
                ..
            } => "timestamp",
            Error::Apply { .. } => "apply",
            Error::Verify(_) => "verify",
            Error::Configuration(_) => "configuration",
            Error::State { .. } => "lifecycle",
            Error::Registry(_) => "registry",
            Error::Io(_) => "io",
        }
    }

    /// True when a staged rewrite existed and was thrown away. False means
    /// nothing was staged at all. The persisted artifact is unchanged in
    /// both cases.
    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Error::Apply { stage, .. } if *stage != ApplyStage::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolled_back_only_after_staging() {
        assert!(!Error::apply(ApplyStage::Open, "disk full").is_rolled_back());
        assert!(Error::apply(ApplyStage::Commit, "rename").is_rolled_back());
        assert!(!Error::Stream("boom".into()).is_rolled_back());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Error::backend(BackendStage::Timestamp, "down").stage(), "timestamp");
        assert_eq!(Error::Verify(VerifyError::Missing).stage(), "verify");
        assert_eq!(Error::format("short header").stage(), "transform");
    }
}
