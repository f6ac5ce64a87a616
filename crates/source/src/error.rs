use std::time::Duration;

use keel_core::JoinedError;
use thiserror::Error;

use crate::filter::FilterError;
use crate::fsutil::FsError;
use crate::policy::PolicyError;

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("catalog source type {0:?} is not supported")]
    UnsupportedSource(String),
    #[error("invalid catalog name {name:?}: {reason}")]
    InvalidCatalogName { name: String, reason: String },
    #[error("catalog source image configuration is unset")]
    MissingImageSource,
    #[error("error parsing image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("error creating canonical reference: {0}")]
    CanonicalReference(String),
    #[error("catalog image is missing the required label {label:?}")]
    MissingLabel { label: &'static str, spec_is_canonical: bool },
    #[error("error getting signature policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("registry error for {reference:?}: {reason}")]
    Registry { reference: String, reason: String },
    #[error("timed out after {timeout:?} during {operation}")]
    Timeout { operation: String, timeout: Duration },
    #[error("blob digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedDigest(String),
    #[error("unsupported layer compression for layer[{index}]: {reason}")]
    UnsupportedLayer { index: usize, reason: String },
    #[error("layer[{index}] contains special file {path:?}")]
    SpecialFile { index: usize, path: String },
    #[error("invalid image layout: {0}")]
    Layout(String),
    #[error("{context}: {source}")]
    Fs {
        context: &'static str,
        #[source]
        source: FsError,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("{0}")]
    Joined(JoinedError),
}

impl UnpackError {
    pub(crate) fn fs(context: &'static str, source: FsError) -> Self {
        UnpackError::Fs { context, source }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UnpackError::Io { context: context.into(), source }
    }

    /// Whether retrying the same catalog can never succeed.
    ///
    /// A missing content label is only permanent for digest-pinned references;
    /// a tag may later point at an image that carries it.
    pub fn is_terminal(&self) -> bool {
        match self {
            UnpackError::UnsupportedSource(_)
            | UnpackError::InvalidCatalogName { .. }
            | UnpackError::MissingImageSource
            | UnpackError::InvalidReference { .. }
            | UnpackError::CanonicalReference(_) => true,
            UnpackError::MissingLabel { spec_is_canonical, .. } => *spec_is_canonical,
            UnpackError::Policy(e) => e.is_terminal(),
            _ => false,
        }
    }

    /// Join `self` with a follow-up failure (typically cleanup), keeping both messages.
    pub(crate) fn join(self, other: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let mut joined = match self {
            UnpackError::Joined(j) => j,
            e => {
                let mut j = JoinedError::new();
                j.push(e);
                j
            }
        };
        joined.push(other);
        UnpackError::Joined(joined)
    }
}
