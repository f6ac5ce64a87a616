//! Keel core types: the closed object model, joined errors and naming helpers.

#![forbid(unsafe_code)]

pub mod kinds;
pub mod naming;
pub mod object;

pub use kinds::{Scope, SupportedKind};
pub use naming::{deep_hash, dns1123_subdomain_errors, object_name_for_base_and_suffix, MAX_NAME_LENGTH};
pub use object::Object;

/// Image label naming the directory that holds file-based catalog content.
pub const CONFIG_DIR_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

/// Annotation stamped on RBAC objects produced by the renderer. Only the key is significant.
pub const ANNOTATION_GENERATED_MANIFEST: &str = "olm.operatorframework.io/registryv1-generated";

/// Pod template annotation carrying the comma separated target namespaces.
pub const ANNOTATION_TARGET_NAMESPACES: &str = "olm.targetNamespaces";

/// CSV annotation holding the JSON encoded bundle properties.
pub const ANNOTATION_PROPERTIES: &str = "olm.properties";

pub const ANNOTATION_SUGGESTED_NAMESPACE: &str = "operatorframework.io/suggested-namespace";

/// Errors gathered from independent checks, reported together one per line.
#[derive(Debug, Default)]
pub struct JoinedError {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl JoinedError {
    pub fn new() -> Self { Self::default() }

    pub fn push<E>(&mut self, err: E)
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.errors.push(err.into());
    }

    pub fn len(&self) -> usize { self.errors.len() }

    pub fn is_empty(&self) -> bool { self.errors.is_empty() }

    pub fn errors(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync + 'static)> {
        self.errors.iter().map(|e| e.as_ref())
    }

    /// `Ok(())` when nothing was collected, the aggregate otherwise.
    pub fn into_result(self) -> Result<(), JoinedError> {
        if self.errors.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl std::fmt::Display for JoinedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 { f.write_str("\n")?; }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {}

impl<E> FromIterator<E> for JoinedError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        let mut joined = JoinedError::new();
        for e in iter { joined.push(e); }
        joined
    }
}
