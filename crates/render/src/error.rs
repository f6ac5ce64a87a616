use keel_core::JoinedError;
use thiserror::Error;

use crate::options::InstallModeError;

#[derive(Debug, Error)]
pub enum RenderError {
    /// The bundle failed structural validation.
    #[error(transparent)]
    Validation(JoinedError),
    #[error("invalid option(s): {0}")]
    InvalidOptions(JoinedError),
    #[error(transparent)]
    InstallMode(#[from] InstallModeError),
    #[error("bundle contains unsupported resource: Name: {name}, Kind: {kind}")]
    UnsupportedResource { name: String, kind: String },
    #[error("apiServiceDefinitions are not supported")]
    ApiServiceDefinitionsUnsupported,
    #[error("webhookDefinitions are not supported without a certificate provider")]
    WebhooksRequireCertificateProvider,
    #[error("custom resource definition '{crd}' is referenced by multiple conversion webhook definitions")]
    SharedConversionCrd { crd: String },
    #[error("custom resource definition '{crd}' must have .spec.preserveUnknownFields set to false to let API Server call webhook to do the conversion")]
    PreserveUnknownFields { crd: String },
    #[error("failed to hash {what}: {source}")]
    Hash {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("certificate provider: {0}")]
    Certificate(String),
}

impl RenderError {
    /// Configuration problems that retrying cannot fix.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RenderError::Hash { .. } | RenderError::Certificate(_))
    }
}
