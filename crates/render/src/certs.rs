//! Certificate providers: who issues webhook serving certificates and how the CA reaches the API server.

use keel_core::{object_name_for_base_and_suffix, Object};
use kube::core::DynamicObject;
use serde_json::json;

use crate::RenderError;

pub const CERT_MANAGER_INJECT_CA_ANNOTATION: &str = "cert-manager.io/inject-ca-from";

/// Where a deployment's webhook certificate lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateProvisioningConfig {
    pub webhook_service_name: String,
    pub namespace: String,
    pub cert_name: String,
}

impl CertificateProvisioningConfig {
    pub fn for_deployment(deployment_name: &str, namespace: &str, csv_name: &str) -> Self {
        Self {
            webhook_service_name: webhook_service_name(deployment_name),
            namespace: namespace.to_string(),
            cert_name: format!("{csv_name}-{deployment_name}-crt"),
        }
    }
}

/// Secret holding the serving certificate and the keys of its two entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSecretInfo {
    pub secret_name: String,
    pub private_key_key: String,
    pub certificate_key: String,
}

pub trait CertificateProvider: Send + Sync {
    /// Arrange for the CA bundle to be injected into `obj`. Objects the provider
    /// does not care about are left untouched.
    fn inject_ca_bundle(&self, obj: &mut Object, cfg: &CertificateProvisioningConfig) -> Result<(), RenderError>;

    fn cert_secret_info(&self, cfg: &CertificateProvisioningConfig) -> CertSecretInfo;

    /// Extra objects the provider needs installed next to the bundle.
    fn additional_objects(&self, cfg: &CertificateProvisioningConfig) -> Result<Vec<Object>, RenderError>;
}

/// Name of the Service fronting a deployment's webhooks.
pub fn webhook_service_name(deployment_name: &str) -> String {
    format!("{}-service", deployment_name.replace('.', "-"))
}

/// Certificates issued by cert-manager through a per-deployment self-signed issuer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertManagerCertificateProvider;

impl CertificateProvider for CertManagerCertificateProvider {
    fn inject_ca_bundle(&self, obj: &mut Object, cfg: &CertificateProvisioningConfig) -> Result<(), RenderError> {
        match obj {
            Object::ValidatingWebhookConfiguration(_)
            | Object::MutatingWebhookConfiguration(_)
            | Object::CustomResourceDefinition(_) => {
                obj.annotations_mut()
                    .insert(CERT_MANAGER_INJECT_CA_ANNOTATION.to_string(), format!("{}/{}", cfg.namespace, cfg.cert_name));
            }
            _ => {}
        }
        Ok(())
    }

    fn cert_secret_info(&self, cfg: &CertificateProvisioningConfig) -> CertSecretInfo {
        CertSecretInfo {
            secret_name: cfg.cert_name.clone(),
            private_key_key: "tls.key".to_string(),
            certificate_key: "tls.crt".to_string(),
        }
    }

    fn additional_objects(&self, cfg: &CertificateProvisioningConfig) -> Result<Vec<Object>, RenderError> {
        let issuer_name = object_name_for_base_and_suffix(&cfg.cert_name, "selfsigned-issuer");
        let host = format!("{}.{}", cfg.webhook_service_name, cfg.namespace);
        let issuer = json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Issuer",
            "metadata": {"name": issuer_name, "namespace": cfg.namespace},
            "spec": {"selfSigned": {}},
        });
        let certificate = json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {"name": cfg.cert_name, "namespace": cfg.namespace},
            "spec": {
                "secretName": cfg.cert_name,
                "commonName": host,
                "usages": ["server auth"],
                "isCA": false,
                "dnsNames": [host.clone(), format!("{host}.svc"), format!("{host}.svc.cluster.local")],
                "issuerRef": {"name": issuer_name},
                "duration": "17520h0m0s",
                "renewBefore": "24h0m0s",
            },
        });
        [issuer, certificate]
            .into_iter()
            .map(|v| {
                serde_json::from_value::<DynamicObject>(v)
                    .map(Object::Dynamic)
                    .map_err(|e| RenderError::Certificate(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;

    fn cfg() -> CertificateProvisioningConfig {
        CertificateProvisioningConfig::for_deployment("my.deployment", "ns", "csv")
    }

    #[test]
    fn config_names_follow_the_deployment() {
        let cfg = cfg();
        assert_eq!(cfg.webhook_service_name, "my-deployment-service");
        assert_eq!(cfg.cert_name, "csv-my.deployment-crt");
        assert_eq!(cfg.namespace, "ns");
    }

    #[test]
    fn cert_manager_annotates_webhook_configs_but_not_services() {
        let p = CertManagerCertificateProvider;
        let mut wh = Object::from(ValidatingWebhookConfiguration::default());
        p.inject_ca_bundle(&mut wh, &cfg()).unwrap();
        assert_eq!(
            wh.annotations().unwrap()[CERT_MANAGER_INJECT_CA_ANNOTATION],
            "ns/csv-my.deployment-crt"
        );
        let mut svc = Object::from(Service::default());
        p.inject_ca_bundle(&mut svc, &cfg()).unwrap();
        assert!(svc.annotations().is_none());
    }

    #[test]
    fn cert_manager_emits_issuer_and_certificate() {
        let objs = CertManagerCertificateProvider.additional_objects(&cfg()).unwrap();
        assert_eq!(objs.len(), 2);
        assert!(objs[0].is("Issuer", "csv-my.deployment-crt-selfsigned-issuer", "ns"));
        assert!(objs[1].is("Certificate", "csv-my.deployment-crt", "ns"));
        let cert = objs[1].to_value().unwrap();
        assert_eq!(cert["spec"]["issuerRef"]["name"], "csv-my.deployment-crt-selfsigned-issuer");
        assert_eq!(cert["spec"]["dnsNames"][1], "my-deployment-service.ns.svc");
        assert_eq!(cert["spec"]["secretName"], "csv-my.deployment-crt");
    }

    #[test]
    fn secret_info_uses_tls_keys() {
        let info = CertManagerCertificateProvider.cert_secret_info(&cfg());
        assert_eq!(info.secret_name, "csv-my.deployment-crt");
        assert_eq!(info.certificate_key, "tls.crt");
        assert_eq!(info.private_key_key, "tls.key");
    }
}
