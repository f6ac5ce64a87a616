//! Generators: each turns the bundle and the render options into a slice of objects.
//!
//! Generators are plain functions and never look at each other's output. The
//! renderer concatenates their results in the order they are registered.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_bundle::{RegistryV1, StrategyDeploymentPermissions, WebhookAdmissionType, WebhookDescription};
use keel_core::object::merge_missing;
use keel_core::{Object, Scope, SupportedKind, ANNOTATION_TARGET_NAMESPACES};

use crate::certs::{webhook_service_name, CertificateProvisioningConfig};
use crate::options::RenderOptions;
use crate::resources;
use crate::RenderError;

pub type Generator = fn(&RegistryV1, &RenderOptions) -> Result<Vec<Object>, RenderError>;

/// Generators for a registry+v1 bundle, in output order.
pub fn registry_v1_generators() -> Vec<Generator> {
    vec![
        service_accounts,
        permissions,
        cluster_permissions,
        custom_resource_definitions,
        additional_resources,
        deployments,
        webhook_configurations,
        webhook_services,
        certificate_provider_resources,
    ]
}

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

fn permission_name(bundle: &RegistryV1, opts: &RenderOptions, permission: &StrategyDeploymentPermissions) -> Result<String, RenderError> {
    let base = format!("{}-{}", bundle.csv.name(), permission.service_account_or_default());
    let content = serde_json::to_value(permission).map_err(|source| RenderError::Hash { what: "permission", source })?;
    opts.unique_name(&base, &content)
}

/// One Deployment per install strategy deployment spec.
///
/// CSV annotations are merged under the pod template's own, the target namespaces
/// are stamped into `olm.targetNamespaces`, and revision history is capped at 1.
pub fn deployments(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let csv_annotations = bundle.csv.annotations();
    let mut objs = Vec::with_capacity(bundle.csv.deployments().len());
    for dep in bundle.csv.deployments() {
        let mut spec = dep.spec.clone();
        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        let mut annotations = template_meta.annotations.take().unwrap_or_default();
        merge_missing(&mut annotations, &csv_annotations);
        annotations.insert(ANNOTATION_TARGET_NAMESPACES.to_string(), opts.target_namespaces.join(","));
        template_meta.annotations = Some(annotations);
        spec.revision_history_limit = Some(1);

        let mut metadata = resources::meta(&dep.name, Some(&opts.install_namespace));
        if !dep.label.is_empty() {
            metadata.labels = Some(dep.label.clone());
        }
        objs.push(Deployment { metadata, spec: Some(spec), status: None }.into());
    }
    Ok(objs)
}

/// A Role and RoleBinding per permission per target namespace.
/// Nothing in AllNamespaces mode, where permissions become cluster permissions.
pub fn permissions(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    if opts.is_all_namespaces() {
        return Ok(Vec::new());
    }
    let perms = bundle.csv.permissions();
    let mut objs = Vec::with_capacity(2 * opts.target_namespaces.len() * perms.len());
    for ns in &opts.target_namespaces {
        for permission in perms {
            let sa = permission.service_account_or_default();
            let name = permission_name(bundle, opts, permission)?;
            objs.push(resources::role(&name, ns, permission.rules.clone()).into());
            objs.push(resources::role_binding(&name, ns, sa, &opts.install_namespace).into());
        }
    }
    Ok(objs)
}

fn namespace_read_rule() -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["namespaces".to_string()]),
        verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
        ..Default::default()
    }
}

/// A ClusterRole and ClusterRoleBinding per cluster permission.
///
/// In AllNamespaces mode namespaced permissions are promoted here too, each with
/// an extra rule to read namespaces.
pub fn cluster_permissions(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let mut perms: Vec<StrategyDeploymentPermissions> = bundle.csv.cluster_permissions().to_vec();
    if opts.is_all_namespaces() {
        perms.extend(bundle.csv.permissions().iter().cloned().map(|mut p| {
            p.rules.push(namespace_read_rule());
            p
        }));
    }
    let mut objs = Vec::with_capacity(2 * perms.len());
    for permission in &perms {
        let sa = permission.service_account_or_default();
        let name = permission_name(bundle, opts, permission)?;
        objs.push(resources::cluster_role(&name, permission.rules.clone()).into());
        objs.push(resources::cluster_role_binding(&name, sa, &opts.install_namespace).into());
    }
    Ok(objs)
}

/// One ServiceAccount per distinct account named by any permission, first seen first.
/// The namespace's `default` account already exists and is never generated.
pub fn service_accounts(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let mut seen: Vec<&str> = Vec::new();
    for p in bundle.csv.permissions().iter().chain(bundle.csv.cluster_permissions()) {
        let sa = p.service_account_or_default();
        if sa != "default" && !seen.contains(&sa) {
            seen.push(sa);
        }
    }
    Ok(seen.into_iter().map(|sa| resources::service_account(sa, &opts.install_namespace).into()).collect())
}

pub fn custom_resource_definitions(bundle: &RegistryV1, _opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    Ok(bundle.crds.iter().cloned().map(Object::from).collect())
}

/// Plain manifests shipped in the bundle. Kinds outside the allowlist fail the
/// render; namespaced objects are moved into the install namespace.
pub fn additional_resources(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let mut objs = Vec::with_capacity(bundle.others.len());
    for res in &bundle.others {
        let mut obj = Object::Dynamic(res.clone());
        let kind = SupportedKind::from_kind(obj.kind()).filter(|k| k.is_passthrough());
        let Some(kind) = kind else {
            return Err(RenderError::UnsupportedResource { name: obj.name().to_string(), kind: obj.kind().to_string() });
        };
        if kind.scope() == Scope::Namespaced {
            obj.set_namespace(&opts.install_namespace);
        }
        objs.push(obj);
    }
    Ok(objs)
}

/// Name of the webhook configuration generated for a definition.
pub fn webhook_configuration_name(wh: &WebhookDescription) -> &str {
    wh.generate_name.strip_suffix('-').unwrap_or(&wh.generate_name)
}

fn webhook_client_config(wh: &WebhookDescription, opts: &RenderOptions) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            namespace: opts.install_namespace.clone(),
            name: webhook_service_name(&wh.deployment_name),
            path: wh.webhook_path.clone(),
            port: Some(wh.port()),
        }),
        ..Default::default()
    }
}

/// Restricts a webhook to the target namespaces; `None` when every namespace is targeted.
fn webhook_namespace_selector(targets: &[String]) -> Option<LabelSelector> {
    if targets.is_empty() || targets.iter().any(String::is_empty) {
        return None;
    }
    Some(LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: NAMESPACE_NAME_LABEL.to_string(),
            operator: "In".to_string(),
            values: Some(targets.to_vec()),
        }]),
        match_labels: None,
    })
}

fn rules_or_none<T: Clone>(rules: &[T]) -> Option<Vec<T>> {
    if rules.is_empty() { None } else { Some(rules.to_vec()) }
}

/// Validating and mutating webhook configurations, one per definition.
/// Conversion webhooks are wired into their CRDs by a mutator instead.
pub fn webhook_configurations(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let mut objs = Vec::new();
    for wh in bundle.csv.webhooks() {
        let metadata = resources::meta(webhook_configuration_name(wh), None);
        match wh.webhook_type {
            WebhookAdmissionType::ValidatingAdmissionWebhook => {
                let webhook = ValidatingWebhook {
                    name: wh.generate_name.clone(),
                    rules: rules_or_none(&wh.rules),
                    failure_policy: wh.failure_policy.clone(),
                    match_policy: wh.match_policy.clone(),
                    object_selector: wh.object_selector.clone(),
                    namespace_selector: webhook_namespace_selector(&opts.target_namespaces),
                    side_effects: wh.side_effects.clone().unwrap_or_default(),
                    timeout_seconds: wh.timeout_seconds,
                    admission_review_versions: wh.admission_review_versions.clone(),
                    client_config: webhook_client_config(wh, opts),
                    ..Default::default()
                };
                objs.push(ValidatingWebhookConfiguration { metadata, webhooks: Some(vec![webhook]) }.into());
            }
            WebhookAdmissionType::MutatingAdmissionWebhook => {
                let webhook = MutatingWebhook {
                    name: wh.generate_name.clone(),
                    rules: rules_or_none(&wh.rules),
                    failure_policy: wh.failure_policy.clone(),
                    match_policy: wh.match_policy.clone(),
                    object_selector: wh.object_selector.clone(),
                    namespace_selector: webhook_namespace_selector(&opts.target_namespaces),
                    side_effects: wh.side_effects.clone().unwrap_or_default(),
                    timeout_seconds: wh.timeout_seconds,
                    admission_review_versions: wh.admission_review_versions.clone(),
                    client_config: webhook_client_config(wh, opts),
                    reinvocation_policy: wh.reinvocation_policy.clone(),
                    ..Default::default()
                };
                objs.push(MutatingWebhookConfiguration { metadata, webhooks: Some(vec![webhook]) }.into());
            }
            WebhookAdmissionType::ConversionWebhook => {}
        }
    }
    Ok(objs)
}

fn webhook_service_port(wh: &WebhookDescription) -> ServicePort {
    let port = wh.port();
    ServicePort {
        name: Some(port.to_string()),
        port,
        target_port: Some(wh.target_port.clone().unwrap_or(IntOrString::Int(port))),
        ..Default::default()
    }
}

/// One Service per deployment that backs at least one webhook, in deployment order.
/// Ports are deduplicated and sorted by name.
pub fn webhook_services(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let mut ports_by_deployment: BTreeMap<&str, Vec<ServicePort>> = BTreeMap::new();
    for wh in bundle.csv.webhooks() {
        let ports = ports_by_deployment.entry(wh.deployment_name.as_str()).or_default();
        let port = webhook_service_port(wh);
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    let mut objs = Vec::new();
    for dep in bundle.csv.deployments() {
        let Some(ports) = ports_by_deployment.get_mut(dep.name.as_str()) else { continue };
        let mut ports = std::mem::take(ports);
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        let selector = dep.spec.selector.match_labels.clone();
        objs.push(resources::service(&webhook_service_name(&dep.name), &opts.install_namespace, ports, selector).into());
    }
    Ok(objs)
}

/// Deployments that back webhooks, in order of first reference.
pub(crate) fn webhook_deployments(bundle: &RegistryV1) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for wh in bundle.csv.webhooks() {
        if !names.contains(&wh.deployment_name.as_str()) {
            names.push(&wh.deployment_name);
        }
    }
    names
}

/// Whatever the certificate provider needs per webhook deployment. Nothing without a provider.
pub fn certificate_provider_resources(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Object>, RenderError> {
    let Some(provider) = opts.certificate_provider.as_ref() else { return Ok(Vec::new()) };
    let mut objs = Vec::new();
    for dep in webhook_deployments(bundle) {
        let cfg = CertificateProvisioningConfig::for_deployment(dep, &opts.install_namespace, bundle.csv.name());
        objs.extend(provider.additional_objects(&cfg)?);
    }
    Ok(objs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_bundle::{InstallMode, InstallModeType, StrategyDeploymentSpec};
    use serde_json::json;

    fn rule(resource: &str) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![resource.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }
    }

    fn bundle() -> RegistryV1 {
        let mut b = RegistryV1 { package_name: "pkg".into(), ..Default::default() };
        b.csv.metadata.name = Some("csv".into());
        b.csv.spec.install_modes = vec![
            InstallMode { mode: InstallModeType::AllNamespaces, supported: true },
            InstallMode { mode: InstallModeType::SingleNamespace, supported: true },
        ];
        b.csv.spec.install.spec.permissions = vec![StrategyDeploymentPermissions {
            service_account_name: "sa1".into(),
            rules: vec![rule("configmaps")],
        }];
        b
    }

    fn opts(targets: &[&str]) -> RenderOptions {
        RenderOptions {
            target_namespaces: targets.iter().map(|s| s.to_string()).collect(),
            ..RenderOptions::new("install")
        }
    }

    fn kinds(objs: &[Object]) -> Vec<&str> {
        objs.iter().map(|o| o.kind()).collect()
    }

    #[test]
    fn permissions_repeat_for_every_target_namespace() {
        let objs = permissions(&bundle(), &opts(&["a", "b"])).unwrap();
        assert_eq!(kinds(&objs), vec!["Role", "RoleBinding", "Role", "RoleBinding"]);
        assert_eq!(objs[0].namespace(), "a");
        assert_eq!(objs[2].namespace(), "b");
        assert_eq!(objs[0].name(), objs[2].name());
        assert!(objs[0].name().starts_with("csv-sa1-"));
    }

    #[test]
    fn all_namespaces_promotes_permissions() {
        let b = bundle();
        assert!(permissions(&b, &opts(&[""])).unwrap().is_empty());
        let objs = cluster_permissions(&b, &opts(&[""])).unwrap();
        assert_eq!(kinds(&objs), vec!["ClusterRole", "ClusterRoleBinding"]);
        let Object::ClusterRole(cr) = &objs[0] else { panic!("expected cluster role") };
        let rules = cr.rules.as_ref().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], rule("configmaps"));
        assert_eq!(rules[1], namespace_read_rule());
        assert!(cluster_permissions(&b, &opts(&["a"])).unwrap().is_empty());
    }

    #[test]
    fn promoted_name_hashes_the_extended_rules() {
        let b = bundle();
        let role = &permissions(&b, &opts(&["a"])).unwrap()[0];
        let cluster_role = &cluster_permissions(&b, &opts(&[""])).unwrap()[0];
        assert_ne!(role.name(), cluster_role.name());
    }

    #[test]
    fn default_service_account_is_not_generated() {
        let mut b = bundle();
        b.csv.spec.install.spec.cluster_permissions = vec![
            StrategyDeploymentPermissions { service_account_name: String::new(), rules: vec![] },
            StrategyDeploymentPermissions { service_account_name: "sa2".into(), rules: vec![] },
            StrategyDeploymentPermissions { service_account_name: "sa1".into(), rules: vec![] },
        ];
        let objs = service_accounts(&b, &opts(&[""])).unwrap();
        let names: Vec<_> = objs.iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["sa1", "sa2"]);
        assert!(objs.iter().all(|o| o.namespace() == "install"));
    }

    #[test]
    fn deployment_annotations_and_history_limit() {
        let mut b = bundle();
        b.csv.metadata.annotations = Some(BTreeMap::from([
            ("csv-only".to_string(), "csv".to_string()),
            ("shared".to_string(), "csv".to_string()),
        ]));
        let mut spec: k8s_openapi::api::apps::v1::DeploymentSpec = serde_json::from_value(json!({
            "selector": {"matchLabels": {"app": "x"}},
            "template": {"metadata": {"annotations": {"shared": "template"}}}
        }))
        .unwrap();
        spec.revision_history_limit = Some(10);
        b.csv.spec.install.spec.deployment_specs =
            vec![StrategyDeploymentSpec { name: "dep".into(), spec, label: BTreeMap::from([("app".into(), "x".into())]) }];

        let objs = deployments(&b, &opts(&["a", "b"])).unwrap();
        let Object::Deployment(d) = &objs[0] else { panic!("expected deployment") };
        assert_eq!(d.metadata.namespace.as_deref(), Some("install"));
        assert_eq!(d.metadata.labels.as_ref().unwrap()["app"], "x");
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(spec.revision_history_limit, Some(1));
        let ann = spec.template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(ann["shared"], "template");
        assert_eq!(ann["csv-only"], "csv");
        assert_eq!(ann[ANNOTATION_TARGET_NAMESPACES], "a,b");
    }

    #[test]
    fn unsupported_passthrough_kind_is_rejected() {
        let mut b = bundle();
        b.others.push(serde_json::from_value(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}})).unwrap());
        let err = additional_resources(&b, &opts(&[""])).unwrap_err();
        assert_eq!(err.to_string(), "bundle contains unsupported resource: Name: p, Kind: Pod");
    }

    #[test]
    fn namespaced_passthrough_moves_to_install_namespace() {
        let mut b = bundle();
        b.others.push(serde_json::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "elsewhere"}})).unwrap());
        b.others.push(serde_json::from_value(json!({"apiVersion": "scheduling.k8s.io/v1", "kind": "PriorityClass", "metadata": {"name": "pc"}})).unwrap());
        let objs = additional_resources(&b, &opts(&[""])).unwrap();
        assert!(objs[0].is("ConfigMap", "cm", "install"));
        assert!(objs[1].is("PriorityClass", "pc", ""));
    }

    fn webhook_bundle() -> RegistryV1 {
        let mut b = bundle();
        let spec = serde_json::from_value(json!({"selector": {"matchLabels": {"app": "hooks"}}, "template": {}})).unwrap();
        b.csv.spec.install.spec.deployment_specs =
            vec![StrategyDeploymentSpec { name: "hook.dep".into(), spec, label: BTreeMap::new() }];
        let mut v = WebhookDescription::new(WebhookAdmissionType::ValidatingAdmissionWebhook, "vhook-", "hook.dep");
        v.side_effects = Some("None".into());
        v.webhook_path = Some("/validate".into());
        let mut m = WebhookDescription::new(WebhookAdmissionType::MutatingAdmissionWebhook, "mhook", "hook.dep");
        m.container_port = 8443;
        m.target_port = Some(IntOrString::String("https".into()));
        let mut again = WebhookDescription::new(WebhookAdmissionType::ValidatingAdmissionWebhook, "vhook2", "hook.dep");
        again.container_port = 0;
        b.csv.spec.webhook_definitions = vec![v, m, again];
        b
    }

    #[test]
    fn webhook_configurations_point_at_the_deployment_service() {
        let objs = webhook_configurations(&webhook_bundle(), &opts(&["a"])).unwrap();
        assert_eq!(kinds(&objs), vec!["ValidatingWebhookConfiguration", "MutatingWebhookConfiguration", "ValidatingWebhookConfiguration"]);
        assert_eq!(objs[0].name(), "vhook");
        let Object::ValidatingWebhookConfiguration(cfg) = &objs[0] else { panic!("expected validating config") };
        let wh = &cfg.webhooks.as_ref().unwrap()[0];
        assert_eq!(wh.name, "vhook-");
        let svc = wh.client_config.service.as_ref().unwrap();
        assert_eq!(svc.name, "hook-dep-service");
        assert_eq!(svc.namespace, "install");
        assert_eq!(svc.port, Some(443));
        assert_eq!(svc.path.as_deref(), Some("/validate"));
        let selector = wh.namespace_selector.as_ref().unwrap();
        assert_eq!(selector.match_expressions.as_ref().unwrap()[0].values, Some(vec!["a".to_string()]));

        let all = webhook_configurations(&webhook_bundle(), &opts(&[""])).unwrap();
        let Object::MutatingWebhookConfiguration(cfg) = &all[1] else { panic!("expected mutating config") };
        assert!(cfg.webhooks.as_ref().unwrap()[0].namespace_selector.is_none());
    }

    #[test]
    fn one_service_per_webhook_deployment_with_deduplicated_ports() {
        let objs = webhook_services(&webhook_bundle(), &opts(&[""])).unwrap();
        assert_eq!(objs.len(), 1);
        assert!(objs[0].is("Service", "hook-dep-service", "install"));
        let Object::Service(svc) = &objs[0] else { panic!("expected service") };
        let spec = svc.spec.as_ref().unwrap();
        let ports = spec.ports.as_ref().unwrap();
        let names: Vec<_> = ports.iter().map(|p| p.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["443", "8443"]);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(443)));
        assert_eq!(ports[1].target_port, Some(IntOrString::String("https".into())));
        assert_eq!(spec.selector.as_ref().unwrap()["app"], "hooks");
    }

    #[test]
    fn no_certificate_objects_without_provider() {
        assert!(certificate_provider_resources(&webhook_bundle(), &opts(&[""])).unwrap().is_empty());
        assert_eq!(webhook_deployments(&webhook_bundle()), vec!["hook.dep"]);
    }
}
