//! Render options and install-mode resolution.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use keel_bundle::validate::bracket_list;
use keel_bundle::{InstallModeType, RegistryV1};
use keel_core::{deep_hash, object_name_for_base_and_suffix, JoinedError};
use serde_json::Value as Json;
use thiserror::Error;

use crate::certs::CertificateProvider;
use crate::RenderError;

/// Builds an object name from a readable base and the content it was derived from.
pub type UniqueNameGenerator = Arc<dyn Fn(&str, &Json) -> Result<String, RenderError> + Send + Sync>;

/// `base-<hash(content)>`, with `base` shortened to fit the name length limit.
pub fn default_unique_name(base: &str, content: &Json) -> Result<String, RenderError> {
    let hash = deep_hash(content).map_err(|source| RenderError::Hash { what: "object", source })?;
    Ok(object_name_for_base_and_suffix(base, &hash))
}

pub fn default_unique_name_generator() -> UniqueNameGenerator {
    Arc::new(default_unique_name)
}

/// One override applied on top of the defaults; later options win.
#[derive(Clone)]
pub enum RenderOption {
    TargetNamespaces(Vec<String>),
    UniqueNameGenerator(UniqueNameGenerator),
    CertificateProvider(Option<Arc<dyn CertificateProvider>>),
}

impl RenderOption {
    pub fn target_namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RenderOption::TargetNamespaces(namespaces.into_iter().map(Into::into).collect())
    }

    pub fn certificate_provider(provider: impl CertificateProvider + 'static) -> Self {
        RenderOption::CertificateProvider(Some(Arc::new(provider)))
    }
}

impl fmt::Debug for RenderOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderOption::TargetNamespaces(ns) => f.debug_tuple("TargetNamespaces").field(ns).finish(),
            RenderOption::UniqueNameGenerator(_) => f.write_str("UniqueNameGenerator(..)"),
            RenderOption::CertificateProvider(p) => f.debug_tuple("CertificateProvider").field(&p.is_some()).finish(),
        }
    }
}

/// Effective settings for one render call.
#[derive(Clone)]
pub struct RenderOptions {
    pub install_namespace: String,
    pub target_namespaces: Vec<String>,
    pub unique_name_generator: UniqueNameGenerator,
    pub certificate_provider: Option<Arc<dyn CertificateProvider>>,
}

impl fmt::Debug for RenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderOptions")
            .field("install_namespace", &self.install_namespace)
            .field("target_namespaces", &self.target_namespaces)
            .field("certificate_provider", &self.certificate_provider.is_some())
            .finish()
    }
}

impl RenderOptions {
    /// Defaults: all namespaces, hash-suffixed names, no certificate provider.
    pub fn new(install_namespace: &str) -> Self {
        Self {
            install_namespace: install_namespace.to_string(),
            target_namespaces: vec![String::new()],
            unique_name_generator: default_unique_name_generator(),
            certificate_provider: None,
        }
    }

    pub fn apply<'a>(mut self, opts: impl IntoIterator<Item = &'a RenderOption>) -> Self {
        for opt in opts {
            match opt {
                RenderOption::TargetNamespaces(ns) => self.target_namespaces = ns.clone(),
                RenderOption::UniqueNameGenerator(g) => self.unique_name_generator = g.clone(),
                RenderOption::CertificateProvider(p) => self.certificate_provider = p.clone(),
            }
        }
        self
    }

    /// Check the options against what the bundle supports.
    pub fn validate(self, bundle: &RegistryV1) -> Result<Self, RenderError> {
        let mut errs = JoinedError::new();
        if self.target_namespaces.is_empty() {
            errs.push("at least one target namespace must be specified");
        }
        let supported: BTreeSet<InstallModeType> = bundle.csv.supported_install_modes().collect();
        if let Err(e) = resolve_install_mode(&supported, &self.install_namespace, &self.target_namespaces) {
            errs.push(format!("invalid target namespaces {}: {}", bracket_list(&self.target_namespaces), e));
        }
        errs.into_result().map_err(RenderError::InvalidOptions)?;
        Ok(self)
    }

    /// `true` when the targets are exactly `[""]`.
    pub fn is_all_namespaces(&self) -> bool {
        matches!(self.target_namespaces.as_slice(), [only] if only.is_empty())
    }

    pub fn unique_name(&self, base: &str, content: &Json) -> Result<String, RenderError> {
        (self.unique_name_generator)(base, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallModeError {
    #[error("supported install modes {supported} do not support targeting all namespaces")]
    AllNamespaces { supported: String },
    #[error("supported install modes {supported} do not support target namespaces {targets}")]
    TargetNamespaces { supported: String, targets: String },
}

/// Decide which install mode a set of target namespaces amounts to, given what the CSV supports.
///
/// - no targets or only `""`: AllNamespaces
/// - one target equal to the install namespace: OwnNamespace (SingleNamespace also accepts it)
/// - one other target: SingleNamespace
/// - several targets, none empty: MultiNamespace
pub fn resolve_install_mode(
    supported: &BTreeSet<InstallModeType>,
    install_namespace: &str,
    targets: &[String],
) -> Result<InstallModeType, InstallModeError> {
    let set: BTreeSet<&str> = targets.iter().map(String::as_str).collect();
    let supported_list = || bracket_list(supported.iter());
    let all = set.is_empty() || (set.len() == 1 && set.contains(""));
    if all {
        return if supported.contains(&InstallModeType::AllNamespaces) {
            Ok(InstallModeType::AllNamespaces)
        } else {
            Err(InstallModeError::AllNamespaces { supported: supported_list() })
        };
    }
    if set.len() == 1 {
        let own = targets[0] == install_namespace;
        if own && supported.contains(&InstallModeType::OwnNamespace) {
            return Ok(InstallModeType::OwnNamespace);
        }
        if supported.contains(&InstallModeType::SingleNamespace) {
            return Ok(InstallModeType::SingleNamespace);
        }
    } else if supported.contains(&InstallModeType::MultiNamespace) && !set.contains("") {
        return Ok(InstallModeType::MultiNamespace);
    }
    Err(InstallModeError::TargetNamespaces { supported: supported_list(), targets: bracket_list(targets) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstallModeType::*;

    fn modes(m: &[InstallModeType]) -> BTreeSet<InstallModeType> {
        m.iter().copied().collect()
    }

    fn targets(t: &[&str]) -> Vec<String> {
        t.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_each_mode() {
        let every = modes(&[AllNamespaces, OwnNamespace, SingleNamespace, MultiNamespace]);
        assert_eq!(resolve_install_mode(&every, "install", &[]), Ok(AllNamespaces));
        assert_eq!(resolve_install_mode(&every, "install", &targets(&[""])), Ok(AllNamespaces));
        assert_eq!(resolve_install_mode(&every, "install", &targets(&["install"])), Ok(OwnNamespace));
        assert_eq!(resolve_install_mode(&every, "install", &targets(&["watch"])), Ok(SingleNamespace));
        assert_eq!(resolve_install_mode(&every, "install", &targets(&["a", "b"])), Ok(MultiNamespace));
    }

    #[test]
    fn single_namespace_accepts_the_install_namespace() {
        assert_eq!(resolve_install_mode(&modes(&[SingleNamespace]), "install", &targets(&["install"])), Ok(SingleNamespace));
    }

    #[test]
    fn unsupported_combinations_name_modes_and_targets() {
        let own = modes(&[OwnNamespace]);
        assert_eq!(
            resolve_install_mode(&own, "install", &targets(&[""])).unwrap_err().to_string(),
            "supported install modes [OwnNamespace] do not support targeting all namespaces"
        );
        assert_eq!(
            resolve_install_mode(&own, "install", &targets(&["other"])).unwrap_err().to_string(),
            "supported install modes [OwnNamespace] do not support target namespaces [other]"
        );
        assert!(resolve_install_mode(&modes(&[MultiNamespace]), "install", &targets(&["", "a"])).is_err());
        assert!(resolve_install_mode(&modes(&[AllNamespaces, OwnNamespace]), "install", &targets(&["a", "b"])).is_err());
    }

    #[test]
    fn later_options_override_earlier_ones() {
        let opts = RenderOptions::new("install").apply(&[
            RenderOption::target_namespaces(["a"]),
            RenderOption::target_namespaces(["b", "c"]),
        ]);
        assert_eq!(opts.target_namespaces, targets(&["b", "c"]));
        assert!(!opts.is_all_namespaces());
        assert!(RenderOptions::new("install").is_all_namespaces());
    }

    #[test]
    fn options_validation_collects_errors() {
        let mut bundle = RegistryV1::default();
        bundle.csv.spec.install_modes = vec![keel_bundle::InstallMode { mode: OwnNamespace, supported: true }];
        let err = RenderOptions::new("install").apply(&[RenderOption::TargetNamespaces(vec![])]).validate(&bundle).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid option(s): at least one target namespace must be specified\n\
             invalid target namespaces []: supported install modes [OwnNamespace] do not support targeting all namespaces"
        );
        assert!(RenderOptions::new("install").apply(&[RenderOption::target_namespaces(["install"])]).validate(&bundle).is_ok());
    }

    #[test]
    fn default_names_are_stable_and_bounded() {
        let content = serde_json::json!({"serviceAccountName": "sa", "rules": []});
        let a = default_unique_name("csv-sa", &content).unwrap();
        let b = default_unique_name("csv-sa", &content).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("csv-sa-"));
        let long = default_unique_name(&"x".repeat(100), &content).unwrap();
        assert_eq!(long.len(), keel_core::MAX_NAME_LENGTH);
    }
}
