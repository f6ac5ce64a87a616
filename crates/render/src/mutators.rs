//! Mutators: targeted edits applied to generated objects after generation.
//!
//! A factory inspects the bundle and returns mutators, each bound to one object
//! by kind and name (and namespace where it matters). A mutator leaves every other
//! object alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{KeyToPath, SecretVolumeSource, Volume, VolumeMount};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, ServiceReference, WebhookClientConfig, WebhookConversion,
};
use keel_bundle::{RegistryV1, WebhookAdmissionType};
use keel_core::Object;

use crate::certs::{webhook_service_name, CertSecretInfo, CertificateProvisioningConfig};
use crate::generators::{webhook_configuration_name, webhook_deployments};
use crate::options::RenderOptions;
use crate::RenderError;

pub type Mutator = Box<dyn Fn(&mut Object) -> Result<(), RenderError> + Send + Sync>;
pub type MutatorFactory = fn(&RegistryV1, &RenderOptions) -> Result<Vec<Mutator>, RenderError>;

pub fn registry_v1_mutator_factories() -> Vec<MutatorFactory> {
    vec![conversion_webhook_mutators, certificate_provider_mutators]
}

pub const APISERVICE_CERT_VOLUME: &str = "apiservice-cert";
pub const WEBHOOK_CERT_VOLUME: &str = "webhook-cert";
pub const APISERVICE_CERT_MOUNT_PATH: &str = "/apiserver.local.config/certificates";
pub const WEBHOOK_CERT_MOUNT_PATH: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Run `f` on the object with this kind and name, and namespace when one is given.
pub fn object_mutator<F>(kind: &'static str, name: &str, namespace: Option<&str>, f: F) -> Mutator
where
    F: Fn(&mut Object) -> Result<(), RenderError> + Send + Sync + 'static,
{
    let name = name.to_string();
    let namespace = namespace.map(str::to_string);
    Box::new(move |obj: &mut Object| {
        if obj.kind() != kind || obj.name() != name {
            return Ok(());
        }
        if let Some(ns) = &namespace {
            if obj.namespace() != ns.as_str() {
                return Ok(());
            }
        }
        f(obj)
    })
}

pub fn crd_mutator<F>(name: &str, f: F) -> Mutator
where
    F: Fn(&mut CustomResourceDefinition) -> Result<(), RenderError> + Send + Sync + 'static,
{
    object_mutator("CustomResourceDefinition", name, None, move |obj| match obj {
        Object::CustomResourceDefinition(crd) => f(crd),
        _ => Ok(()),
    })
}

pub fn deployment_mutator<F>(name: &str, namespace: &str, f: F) -> Mutator
where
    F: Fn(&mut Deployment) -> Result<(), RenderError> + Send + Sync + 'static,
{
    object_mutator("Deployment", name, Some(namespace), move |obj| match obj {
        Object::Deployment(dep) => f(dep),
        _ => Ok(()),
    })
}

/// Wire conversion webhooks into the CRDs they convert, and move CRDs that
/// already point at a conversion service into the install namespace.
pub fn conversion_webhook_mutators(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Mutator>, RenderError> {
    let mut mutators = Vec::new();
    let mut referenced: BTreeMap<&str, usize> = BTreeMap::new();
    for wh in bundle.csv.webhooks().iter().filter(|wh| wh.webhook_type == WebhookAdmissionType::ConversionWebhook) {
        for crd in &wh.conversion_crds {
            *referenced.entry(crd.as_str()).or_default() += 1;
        }
    }
    if let Some((crd, _)) = referenced.iter().find(|(_, n)| **n > 1) {
        return Err(RenderError::SharedConversionCrd { crd: crd.to_string() });
    }

    for wh in bundle.csv.webhooks() {
        if wh.webhook_type != WebhookAdmissionType::ConversionWebhook {
            continue;
        }
        let conversion = CustomResourceConversion {
            strategy: "Webhook".to_string(),
            webhook: Some(WebhookConversion {
                client_config: Some(WebhookClientConfig {
                    service: Some(ServiceReference {
                        namespace: opts.install_namespace.clone(),
                        name: webhook_service_name(&wh.deployment_name),
                        path: Some(wh.webhook_path.clone().unwrap_or_else(|| "/".to_string())),
                        port: Some(wh.port()),
                    }),
                    ..Default::default()
                }),
                conversion_review_versions: wh.admission_review_versions.clone(),
            }),
        };
        for crd_name in &wh.conversion_crds {
            let conversion = conversion.clone();
            let owned_name = crd_name.clone();
            mutators.push(crd_mutator(crd_name, move |crd| {
                if crd.spec.preserve_unknown_fields == Some(true) {
                    return Err(RenderError::PreserveUnknownFields { crd: owned_name.clone() });
                }
                crd.spec.conversion = Some(conversion.clone());
                Ok(())
            }));
        }
    }

    for crd in &bundle.crds {
        if conversion_service(crd).is_none() {
            continue;
        }
        let ns = opts.install_namespace.clone();
        mutators.push(crd_mutator(crd.metadata.name.as_deref().unwrap_or(""), move |crd| {
            if let Some(svc) = conversion_service_mut(crd) {
                svc.namespace = ns.clone();
            }
            Ok(())
        }));
    }
    Ok(mutators)
}

fn conversion_service(crd: &CustomResourceDefinition) -> Option<&ServiceReference> {
    crd.spec.conversion.as_ref()?.webhook.as_ref()?.client_config.as_ref()?.service.as_ref()
}

fn conversion_service_mut(crd: &mut CustomResourceDefinition) -> Option<&mut ServiceReference> {
    crd.spec.conversion.as_mut()?.webhook.as_mut()?.client_config.as_mut()?.service.as_mut()
}

fn cert_volumes(secret: &CertSecretInfo) -> [Volume; 2] {
    let volume = |name: &str, cert_path: &str, key_path: &str| Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.secret_name.clone()),
            items: Some(vec![
                KeyToPath { key: secret.certificate_key.clone(), path: cert_path.to_string(), mode: None },
                KeyToPath { key: secret.private_key_key.clone(), path: key_path.to_string(), mode: None },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };
    [
        volume(APISERVICE_CERT_VOLUME, "apiserver.crt", "apiserver.key"),
        volume(WEBHOOK_CERT_VOLUME, "tls.crt", "tls.key"),
    ]
}

fn is_cert_volume(name: &str) -> bool {
    name == APISERVICE_CERT_VOLUME || name == WEBHOOK_CERT_VOLUME
}

/// Replace the certificate volumes and mounts of a deployment. Existing entries
/// with the same names are dropped first, so applying twice changes nothing.
pub fn inject_cert_volumes(dep: &mut Deployment, secret: &CertSecretInfo) {
    let Some(pod) = dep.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else { return };
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|v| !is_cert_volume(&v.name));
    volumes.extend(cert_volumes(secret));

    for container in &mut pod.containers {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.retain(|m| !is_cert_volume(&m.name));
        mounts.push(VolumeMount {
            name: APISERVICE_CERT_VOLUME.to_string(),
            mount_path: APISERVICE_CERT_MOUNT_PATH.to_string(),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: WEBHOOK_CERT_VOLUME.to_string(),
            mount_path: WEBHOOK_CERT_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }
}

/// Certificate wiring for every deployment that backs webhooks: secret volumes on
/// the deployment and CA injection into its Service, webhook configurations and
/// conversion CRDs. Nothing without a certificate provider.
pub fn certificate_provider_mutators(bundle: &RegistryV1, opts: &RenderOptions) -> Result<Vec<Mutator>, RenderError> {
    let Some(provider) = opts.certificate_provider.clone() else { return Ok(Vec::new()) };
    let mut mutators = Vec::new();
    for dep in webhook_deployments(bundle) {
        let cfg = Arc::new(CertificateProvisioningConfig::for_deployment(dep, &opts.install_namespace, bundle.csv.name()));
        let secret = provider.cert_secret_info(&cfg);
        mutators.push(deployment_mutator(dep, &opts.install_namespace, move |d| {
            inject_cert_volumes(d, &secret);
            Ok(())
        }));

        let inject = |kind: &'static str, name: &str, namespace: Option<&str>| {
            let provider = provider.clone();
            let cfg = cfg.clone();
            object_mutator(kind, name, namespace, move |obj| provider.inject_ca_bundle(obj, &cfg))
        };
        mutators.push(inject("Service", &cfg.webhook_service_name, Some(&opts.install_namespace)));
        for wh in bundle.csv.webhooks().iter().filter(|wh| wh.deployment_name == dep) {
            match wh.webhook_type {
                WebhookAdmissionType::ValidatingAdmissionWebhook => {
                    mutators.push(inject("ValidatingWebhookConfiguration", webhook_configuration_name(wh), None));
                }
                WebhookAdmissionType::MutatingAdmissionWebhook => {
                    mutators.push(inject("MutatingWebhookConfiguration", webhook_configuration_name(wh), None));
                }
                WebhookAdmissionType::ConversionWebhook => {
                    for crd in &wh.conversion_crds {
                        mutators.push(inject("CustomResourceDefinition", crd, None));
                    }
                }
            }
        }
    }
    Ok(mutators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use keel_bundle::WebhookDescription;
    use serde_json::json;

    fn secret() -> CertSecretInfo {
        CertSecretInfo { secret_name: "s".into(), private_key_key: "tls.key".into(), certificate_key: "tls.crt".into() }
    }

    fn deployment() -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "dep", "namespace": "ns"},
            "spec": {
                "selector": {},
                "template": {"spec": {
                    "volumes": [{"name": "keep", "emptyDir": {}}, {"name": "webhook-cert", "emptyDir": {}}],
                    "containers": [
                        {"name": "a", "volumeMounts": [{"name": "webhook-cert", "mountPath": "/old"}, {"name": "keep", "mountPath": "/keep"}]},
                        {"name": "b"}
                    ]
                }}
            }
        }))
        .unwrap()
    }

    #[test]
    fn cert_volume_injection_is_idempotent() {
        let mut dep = deployment();
        inject_cert_volumes(&mut dep, &secret());
        let once = serde_json::to_value(&dep).unwrap();
        inject_cert_volumes(&mut dep, &secret());
        assert_eq!(once, serde_json::to_value(&dep).unwrap());

        let pod = dep.spec.unwrap().template.spec.unwrap();
        let volumes: Vec<_> = pod.volumes.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(volumes, vec!["keep", APISERVICE_CERT_VOLUME, WEBHOOK_CERT_VOLUME]);
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        let paths: Vec<_> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(paths, vec!["/keep", APISERVICE_CERT_MOUNT_PATH, WEBHOOK_CERT_MOUNT_PATH]);
        assert_eq!(pod.containers[1].volume_mounts.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn apiservice_volume_maps_tls_keys_to_apiserver_files() {
        let [apiservice, webhook] = cert_volumes(&secret());
        let items = apiservice.secret.unwrap().items.unwrap();
        assert_eq!((items[0].key.as_str(), items[0].path.as_str()), ("tls.crt", "apiserver.crt"));
        assert_eq!((items[1].key.as_str(), items[1].path.as_str()), ("tls.key", "apiserver.key"));
        let items = webhook.secret.unwrap().items.unwrap();
        assert_eq!(items[0].path, "tls.crt");
    }

    #[test]
    fn targeted_mutator_ignores_other_objects() {
        let m = object_mutator("Service", "svc", Some("ns"), |obj| {
            obj.annotations_mut().insert("touched".into(), "yes".into());
            Ok(())
        });
        let mut hit: Object = serde_json::from_value::<Service>(json!({"metadata": {"name": "svc", "namespace": "ns"}})).unwrap().into();
        let mut other_ns: Object = serde_json::from_value::<Service>(json!({"metadata": {"name": "svc", "namespace": "x"}})).unwrap().into();
        let mut other_kind = Object::from(deployment());
        for obj in [&mut hit, &mut other_ns, &mut other_kind] {
            m(obj).unwrap();
        }
        assert!(hit.has_annotation("touched"));
        assert!(!other_ns.has_annotation("touched"));
        assert!(!other_kind.has_annotation("touched"));
    }

    fn conversion_bundle(crds: &[&str]) -> RegistryV1 {
        let mut b = RegistryV1::default();
        for name in crds {
            b.crds.push(serde_json::from_value(json!({
                "apiVersion": "apiextensions.k8s.io/v1",
                "kind": "CustomResourceDefinition",
                "metadata": {"name": name},
                "spec": {"group": "example.com", "names": {"kind": "Foo", "plural": "foos"}, "scope": "Namespaced", "versions": []}
            }))
            .unwrap());
        }
        let mut wh = WebhookDescription::new(WebhookAdmissionType::ConversionWebhook, "conv", "dep");
        wh.container_port = 9443;
        wh.admission_review_versions = vec!["v1".into()];
        wh.conversion_crds = crds.iter().map(|s| s.to_string()).collect();
        b.csv.spec.webhook_definitions = vec![wh];
        b
    }

    #[test]
    fn conversion_webhook_is_wired_into_crd() {
        let b = conversion_bundle(&["foos.example.com"]);
        let mutators = conversion_webhook_mutators(&b, &RenderOptions::new("install")).unwrap();
        let mut obj = Object::from(b.crds[0].clone());
        for m in &mutators {
            m(&mut obj).unwrap();
        }
        let v = obj.to_value().unwrap();
        let conversion = &v["spec"]["conversion"];
        assert_eq!(conversion["strategy"], "Webhook");
        let svc = &conversion["webhook"]["clientConfig"]["service"];
        assert_eq!(svc["name"], "dep-service");
        assert_eq!(svc["namespace"], "install");
        assert_eq!(svc["path"], "/");
        assert_eq!(svc["port"], 9443);
        assert_eq!(conversion["webhook"]["conversionReviewVersions"], json!(["v1"]));
    }

    #[test]
    fn conversion_requires_preserve_unknown_fields_off() {
        let mut b = conversion_bundle(&["foos.example.com"]);
        b.crds[0].spec.preserve_unknown_fields = Some(true);
        let mutators = conversion_webhook_mutators(&b, &RenderOptions::new("install")).unwrap();
        let mut obj = Object::from(b.crds[0].clone());
        let err = mutators[0](&mut obj).unwrap_err();
        assert!(err.to_string().contains("'foos.example.com' must have .spec.preserveUnknownFields set to false"));
    }

    #[test]
    fn crd_shared_by_two_conversion_webhooks_is_rejected() {
        let mut b = conversion_bundle(&["foos.example.com"]);
        let dup = b.csv.spec.webhook_definitions[0].clone();
        b.csv.spec.webhook_definitions.push(dup);
        let err = conversion_webhook_mutators(&b, &RenderOptions::new("install")).err().unwrap();
        assert_eq!(
            err.to_string(),
            "custom resource definition 'foos.example.com' is referenced by multiple conversion webhook definitions"
        );
    }

    #[test]
    fn no_certificate_mutators_without_provider() {
        let b = conversion_bundle(&["foos.example.com"]);
        assert!(certificate_provider_mutators(&b, &RenderOptions::new("install")).unwrap().is_empty());
    }
}
