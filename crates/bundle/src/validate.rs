//! Bundle-level checks. Each check is independent and reports every problem it finds,
//! in a fixed order, so the joined message is stable for a given bundle.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::JoinedError;
use thiserror::Error;

use crate::csv::{InstallModeType, WebhookAdmissionType, WebhookDescription};
use crate::RegistryV1;

pub use keel_core::naming::dns1123_subdomain_errors;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    fn new(msg: impl Into<String>) -> Self { Self(msg.into()) }
}

pub type Check = fn(&RegistryV1) -> Vec<ValidationError>;

/// Ordered list of checks; all of them run, their errors are joined.
#[derive(Clone)]
pub struct BundleValidator {
    checks: Vec<Check>,
}

impl BundleValidator {
    pub fn new(checks: Vec<Check>) -> Self { Self { checks } }

    /// Structural checks every renderable bundle must pass.
    pub fn registry_v1() -> Self {
        Self::new(vec![
            check_deployment_spec_uniqueness as Check,
            check_crd_resource_uniqueness,
            check_owned_crd_existence,
            check_webhook_deployment_referential_integrity,
            check_webhook_name_uniqueness,
            check_conversion_webhooks_reference_owned_crds,
        ])
    }

    /// [`registry_v1`](Self::registry_v1) plus naming and webhook safety checks.
    pub fn registry_v1_extended() -> Self {
        let mut v = Self::registry_v1();
        v.checks.extend([
            check_package_name_not_empty as Check,
            check_deployment_name_is_dns1123_subdomain,
            check_conversion_webhook_support,
            check_conversion_webhook_crd_reference_uniqueness,
            check_webhook_name_is_dns1123_subdomain,
            check_webhook_rules,
        ]);
        v
    }

    pub fn len(&self) -> usize { self.checks.len() }

    pub fn is_empty(&self) -> bool { self.checks.is_empty() }

    pub fn validate(&self, bundle: &RegistryV1) -> Result<(), JoinedError> {
        self.checks.iter().flat_map(|check| check(bundle)).collect::<JoinedError>().into_result()
    }
}

impl Default for BundleValidator {
    fn default() -> Self { Self::registry_v1() }
}

impl std::fmt::Debug for BundleValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleValidator").field("checks", &self.checks.len()).finish()
    }
}

/// Names seen more than once, sorted.
fn duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeSet<&'a str> {
    let mut seen = BTreeSet::new();
    let mut dups = BTreeSet::new();
    for n in names {
        if !seen.insert(n) {
            dups.insert(n);
        }
    }
    dups
}

/// `[a b c]`, the way list values are rendered in messages.
pub fn bracket_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: std::fmt::Display,
{
    let parts: Vec<String> = items.into_iter().map(|s| s.to_string()).collect();
    format!("[{}]", parts.join(" "))
}

pub fn check_deployment_spec_uniqueness(b: &RegistryV1) -> Vec<ValidationError> {
    duplicates(b.csv.deployments().iter().map(|d| d.name.as_str()))
        .into_iter()
        .map(|d| ValidationError::new(format!("cluster service version contains duplicate strategy deployment spec '{}'", d)))
        .collect()
}

pub fn check_crd_resource_uniqueness(b: &RegistryV1) -> Vec<ValidationError> {
    duplicates(b.crds.iter().map(|c| c.metadata.name.as_deref().unwrap_or("")))
        .into_iter()
        .map(|n| ValidationError::new(format!("bundle contains duplicate custom resource definition '{}'", n)))
        .collect()
}

pub fn check_owned_crd_existence(b: &RegistryV1) -> Vec<ValidationError> {
    let present: BTreeSet<&str> = b.crds.iter().filter_map(|c| c.metadata.name.as_deref()).collect();
    let missing: BTreeSet<&str> = b
        .csv
        .spec
        .custom_resource_definitions
        .owned
        .iter()
        .map(|c| c.name.as_str())
        .filter(|n| !present.contains(n))
        .collect();
    missing
        .into_iter()
        .map(|n| ValidationError::new(format!("cluster service definition references owned custom resource definition '{}' not found in bundle", n)))
        .collect()
}

pub fn check_webhook_deployment_referential_integrity(b: &RegistryV1) -> Vec<ValidationError> {
    let deployments: BTreeSet<&str> = b.csv.deployments().iter().map(|d| d.name.as_str()).collect();
    let mut dangling: Vec<&WebhookDescription> = b.csv.webhooks().iter().filter(|wh| !deployments.contains(wh.deployment_name.as_str())).collect();
    dangling.sort_by(|a, b| {
        (a.deployment_name.as_str(), a.webhook_type, a.generate_name.as_str()).cmp(&(b.deployment_name.as_str(), b.webhook_type, b.generate_name.as_str()))
    });
    dangling
        .into_iter()
        .map(|wh| {
            ValidationError::new(format!(
                "webhook of type '{}' with name '{}' references non-existent deployment '{}'",
                wh.webhook_type, wh.generate_name, wh.deployment_name
            ))
        })
        .collect()
}

pub fn check_webhook_name_uniqueness(b: &RegistryV1) -> Vec<ValidationError> {
    let mut by_type: BTreeMap<WebhookAdmissionType, Vec<&str>> = BTreeMap::new();
    for wh in b.csv.webhooks() {
        by_type.entry(wh.webhook_type).or_default().push(wh.generate_name.as_str());
    }
    by_type
        .into_iter()
        .flat_map(|(t, names)| duplicates(names).into_iter().map(move |n| ValidationError::new(format!("duplicate webhook '{}' of type '{}'", n, t))))
        .collect()
}

fn conversion_webhooks(b: &RegistryV1) -> impl Iterator<Item = &WebhookDescription> {
    b.csv.webhooks().iter().filter(|wh| wh.webhook_type == WebhookAdmissionType::ConversionWebhook)
}

pub fn check_conversion_webhooks_reference_owned_crds(b: &RegistryV1) -> Vec<ValidationError> {
    let mut webhooks: Vec<&WebhookDescription> = conversion_webhooks(b).collect();
    if webhooks.is_empty() {
        return Vec::new();
    }
    let owned: BTreeSet<&str> = b.csv.spec.custom_resource_definitions.owned.iter().map(|c| c.name.as_str()).collect();
    webhooks.sort_by(|a, b| a.generate_name.cmp(&b.generate_name));
    let mut errs = Vec::new();
    for wh in webhooks {
        let mut crds: Vec<&str> = wh.conversion_crds.iter().map(String::as_str).collect();
        crds.sort_unstable();
        for crd in crds.into_iter().filter(|c| !owned.contains(c)) {
            errs.push(ValidationError::new(format!(
                "conversion webhook '{}' references custom resource definition '{}' not owned bundle",
                wh.generate_name, crd
            )));
        }
    }
    errs
}

pub fn check_package_name_not_empty(b: &RegistryV1) -> Vec<ValidationError> {
    if b.package_name.is_empty() {
        vec![ValidationError::new("package name is empty")]
    } else {
        Vec::new()
    }
}

pub fn check_deployment_name_is_dns1123_subdomain(b: &RegistryV1) -> Vec<ValidationError> {
    let invalid: BTreeMap<&str, Vec<String>> = b
        .csv
        .deployments()
        .iter()
        .filter_map(|d| {
            let mut errs = dns1123_subdomain_errors(&d.name);
            errs.sort();
            (!errs.is_empty()).then_some((d.name.as_str(), errs))
        })
        .collect();
    invalid
        .into_iter()
        .map(|(name, errs)| ValidationError::new(format!("invalid cluster service version strategy deployment name '{}': {}", name, errs.join(", "))))
        .collect()
}

/// Conversion webhooks are only rendered for bundles whose sole supported mode is AllNamespaces.
pub fn check_conversion_webhook_support(b: &RegistryV1) -> Vec<ValidationError> {
    let names: Vec<&str> = conversion_webhooks(b).map(|wh| wh.generate_name.as_str()).collect();
    if names.is_empty() {
        return Vec::new();
    }
    let modes: BTreeSet<InstallModeType> = b.csv.supported_install_modes().collect();
    if modes.len() == 1 && modes.contains(&InstallModeType::AllNamespaces) {
        return Vec::new();
    }
    let modes = bracket_list(modes);
    names
        .into_iter()
        .map(|n| {
            ValidationError::new(format!(
                "bundle contains conversion webhook {:?} and supports install modes {} - conversion webhooks are only supported for bundles that only support AllNamespaces install mode",
                n, modes
            ))
        })
        .collect()
}

pub fn check_conversion_webhook_crd_reference_uniqueness(b: &RegistryV1) -> Vec<ValidationError> {
    let mut by_crd: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for wh in conversion_webhooks(b) {
        for crd in &wh.conversion_crds {
            by_crd.entry(crd.as_str()).or_default().insert(wh.generate_name.as_str());
        }
    }
    by_crd
        .into_iter()
        .filter(|(_, whs)| whs.len() > 1)
        .map(|(crd, whs)| {
            let names: Vec<&str> = whs.into_iter().collect();
            ValidationError::new(format!("conversion webhooks [{}] reference same custom resource definition '{}'", names.join(","), crd))
        })
        .collect()
}

pub fn check_webhook_name_is_dns1123_subdomain(b: &RegistryV1) -> Vec<ValidationError> {
    let mut invalid: BTreeMap<(WebhookAdmissionType, &str), Vec<String>> = BTreeMap::new();
    for wh in b.csv.webhooks() {
        let mut errs = dns1123_subdomain_errors(&wh.generate_name);
        if !errs.is_empty() {
            errs.sort();
            invalid.insert((wh.webhook_type, wh.generate_name.as_str()), errs);
        }
    }
    invalid
        .into_iter()
        .map(|((t, name), errs)| ValidationError::new(format!("webhook of type '{}' has invalid name '{}': {}", t, name, errs.join(","))))
        .collect()
}

const FORBIDDEN_WEBHOOK_RULE_API_GROUPS: [&str; 2] = ["olm.operatorframework.io", "*"];
const ADMISSION_REGISTRATION_GROUP: &str = "admissionregistration.k8s.io";
const FORBIDDEN_ADMISSION_REGISTRATION_RESOURCES: [&str; 5] = [
    "*",
    "mutatingwebhookconfiguration",
    "mutatingwebhookconfigurations",
    "validatingwebhookconfiguration",
    "validatingwebhookconfigurations",
];

/// Admission webhooks may not intercept OLM's own API or the admission registration API.
pub fn check_webhook_rules(b: &RegistryV1) -> Vec<ValidationError> {
    let mut errs = Vec::new();
    for wh in b.csv.webhooks().iter().filter(|wh| wh.webhook_type != WebhookAdmissionType::ConversionWebhook) {
        for rule in &wh.rules {
            for group in rule.api_groups.iter().flatten() {
                if FORBIDDEN_WEBHOOK_RULE_API_GROUPS.contains(&group.as_str()) {
                    errs.push(ValidationError::new(format!(
                        "webhook {:?} contains forbidden rule: admission webhook rules cannot reference API group {:?}",
                        wh.generate_name, group
                    )));
                }
                if group == ADMISSION_REGISTRATION_GROUP {
                    for resource in rule.resources.iter().flatten() {
                        if FORBIDDEN_ADMISSION_REGISTRATION_RESOURCES.contains(&resource.to_lowercase().as_str()) {
                            errs.push(ValidationError::new(format!(
                                "webhook {:?} contains forbidden rule: admission webhook rules cannot reference resource {:?} for API group {:?}",
                                wh.generate_name, resource, group
                            )));
                        }
                    }
                }
            }
        }
    }
    errs
}
