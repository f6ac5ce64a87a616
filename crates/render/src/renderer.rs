use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use keel_bundle::{BundleValidator, InstallModeType, RegistryV1};
use keel_core::{Object, ANNOTATION_SUGGESTED_NAMESPACE};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::certs::CertificateProvider;
use crate::generators::{registry_v1_generators, Generator};
use crate::mutators::{registry_v1_mutator_factories, MutatorFactory};
use crate::options::{resolve_install_mode, RenderOption, RenderOptions};
use crate::RenderError;

/// Validate, generate, then mutate.
pub struct BundleRenderer {
    validator: BundleValidator,
    generators: Vec<Generator>,
    mutator_factories: Vec<MutatorFactory>,
}

impl fmt::Debug for BundleRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleRenderer")
            .field("validator", &self.validator)
            .field("generators", &self.generators.len())
            .field("mutator_factories", &self.mutator_factories.len())
            .finish()
    }
}

impl Default for BundleRenderer {
    fn default() -> Self { Self::registry_v1() }
}

impl BundleRenderer {
    pub fn new(validator: BundleValidator, generators: Vec<Generator>, mutator_factories: Vec<MutatorFactory>) -> Self {
        Self { validator, generators, mutator_factories }
    }

    pub fn registry_v1() -> Self {
        Self::new(BundleValidator::registry_v1(), registry_v1_generators(), registry_v1_mutator_factories())
    }

    /// Same pipeline, with the extended bundle checks in front.
    pub fn registry_v1_extended() -> Self {
        Self::new(BundleValidator::registry_v1_extended(), registry_v1_generators(), registry_v1_mutator_factories())
    }

    /// Render `bundle` into `install_namespace`. Nothing is returned unless every step succeeds.
    pub fn render(&self, bundle: &RegistryV1, install_namespace: &str, opts: &[RenderOption]) -> Result<Vec<Object>, RenderError> {
        let t0 = std::time::Instant::now();
        let res = self.render_inner(bundle, install_namespace, opts);
        histogram!("bundle_render_ms", t0.elapsed().as_millis() as f64);
        match &res {
            Ok(objs) => info!(csv = %bundle.csv.name(), namespace = %install_namespace, objects = objs.len(), "bundle rendered"),
            Err(e) => {
                counter!("bundle_render_errors_total", 1u64);
                debug!(csv = %bundle.csv.name(), error = %e, "bundle render failed");
            }
        }
        res
    }

    fn render_inner(&self, bundle: &RegistryV1, install_namespace: &str, opts: &[RenderOption]) -> Result<Vec<Object>, RenderError> {
        self.validator.validate(bundle).map_err(RenderError::Validation)?;
        let opts = RenderOptions::new(install_namespace).apply(opts).validate(bundle)?;

        let mut objs = Vec::new();
        for generate in &self.generators {
            objs.extend(generate(bundle, &opts)?);
        }

        let mut mutators = Vec::new();
        for make in &self.mutator_factories {
            mutators.extend(make(bundle, &opts)?);
        }
        debug!(objects = objs.len(), mutators = mutators.len(), "applying mutators");
        for obj in objs.iter_mut() {
            for mutate in &mutators {
                mutate(obj)?;
            }
        }
        Ok(objs)
    }
}

/// Render a bundle the way an installer would, filling in defaults:
///
/// - an empty install namespace becomes the CSV's suggested namespace, else `<package>-system`
/// - empty targets become all namespaces when supported, else the install namespace
///   when OwnNamespace is supported
///
/// Bundles with owned API services are refused, as are webhooks without a
/// certificate provider.
pub fn convert(
    bundle: &RegistryV1,
    install_namespace: &str,
    target_namespaces: &[String],
    certificate_provider: Option<Arc<dyn CertificateProvider>>,
) -> Result<Vec<Object>, RenderError> {
    let install_namespace = default_install_namespace(bundle, install_namespace);
    let supported: BTreeSet<InstallModeType> = bundle.csv.supported_install_modes().collect();
    let mut targets = target_namespaces.to_vec();
    if targets.is_empty() {
        if supported.contains(&InstallModeType::AllNamespaces) {
            targets = vec![String::new()];
        } else if supported.contains(&InstallModeType::OwnNamespace) {
            targets = vec![install_namespace.clone()];
        }
    }
    let mode = resolve_install_mode(&supported, &install_namespace, &targets)?;
    debug!(csv = %bundle.csv.name(), %mode, namespace = %install_namespace, "resolved install mode");

    if !bundle.csv.spec.api_service_definitions.owned.is_empty() {
        return Err(RenderError::ApiServiceDefinitionsUnsupported);
    }
    if !bundle.csv.webhooks().is_empty() && certificate_provider.is_none() {
        return Err(RenderError::WebhooksRequireCertificateProvider);
    }

    BundleRenderer::registry_v1_extended().render(
        bundle,
        &install_namespace,
        &[RenderOption::TargetNamespaces(targets), RenderOption::CertificateProvider(certificate_provider)],
    )
}

pub fn default_install_namespace(bundle: &RegistryV1, install_namespace: &str) -> String {
    if !install_namespace.is_empty() {
        return install_namespace.to_string();
    }
    match bundle.csv.annotation(ANNOTATION_SUGGESTED_NAMESPACE) {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => format!("{}-system", bundle.package_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_bundle::{InstallMode, WebhookAdmissionType, WebhookDescription};
    use std::collections::BTreeMap;

    fn bundle(modes: &[InstallModeType]) -> RegistryV1 {
        let mut b = RegistryV1 { package_name: "pkg".into(), ..Default::default() };
        b.csv.metadata.name = Some("csv".into());
        b.csv.spec.install_modes = modes.iter().map(|m| InstallMode { mode: *m, supported: true }).collect();
        b
    }

    #[test]
    fn install_namespace_defaults() {
        let mut b = bundle(&[]);
        assert_eq!(default_install_namespace(&b, "given"), "given");
        assert_eq!(default_install_namespace(&b, ""), "pkg-system");
        b.csv.metadata.annotations =
            Some(BTreeMap::from([(ANNOTATION_SUGGESTED_NAMESPACE.to_string(), "suggested".to_string())]));
        assert_eq!(default_install_namespace(&b, ""), "suggested");
    }

    #[test]
    fn convert_defaults_to_own_namespace() {
        let b = bundle(&[InstallModeType::OwnNamespace]);
        assert!(convert(&b, "install", &[], None).is_ok());
        let err = convert(&b, "install", &["other".to_string()], None).unwrap_err();
        assert_eq!(err.to_string(), "supported install modes [OwnNamespace] do not support target namespaces [other]");
        assert!(err.is_terminal());
    }

    #[test]
    fn convert_requires_a_certificate_provider_for_webhooks() {
        let mut b = bundle(&[InstallModeType::AllNamespaces]);
        b.csv.spec.webhook_definitions =
            vec![WebhookDescription::new(WebhookAdmissionType::ValidatingAdmissionWebhook, "v", "dep")];
        assert!(matches!(convert(&b, "", &[], None), Err(RenderError::WebhooksRequireCertificateProvider)));
    }

    #[test]
    fn validation_errors_stop_rendering() {
        let mut b = bundle(&[InstallModeType::AllNamespaces]);
        b.csv.spec.webhook_definitions =
            vec![WebhookDescription::new(WebhookAdmissionType::ValidatingAdmissionWebhook, "v", "missing")];
        let err = BundleRenderer::registry_v1().render(&b, "install", &[]).unwrap_err();
        assert!(matches!(err, RenderError::Validation(_)));
    }

    #[test]
    fn empty_generator_list_renders_nothing() {
        let r = BundleRenderer::new(BundleValidator::new(vec![]), vec![], vec![]);
        assert!(r.render(&bundle(&[InstallModeType::AllNamespaces]), "install", &[]).unwrap().is_empty());
    }
}
