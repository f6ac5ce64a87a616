//! The slice of the ClusterServiceVersion schema the renderer consumes.
//!
//! Unknown fields are ignored on input. Everything the generators read is modelled
//! with the upstream Kubernetes types so generated objects can embed them verbatim.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

pub const CSV_KIND: &str = "ClusterServiceVersion";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersion {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CsvSpec,
}

impl ClusterServiceVersion {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    /// Install modes flagged as supported, in declaration order.
    pub fn supported_install_modes(&self) -> impl Iterator<Item = InstallModeType> + '_ {
        self.spec.install_modes.iter().filter(|m| m.supported).map(|m| m.mode)
    }

    pub fn supports(&self, mode: InstallModeType) -> bool {
        self.supported_install_modes().any(|m| m == mode)
    }

    pub fn deployments(&self) -> &[StrategyDeploymentSpec] {
        &self.spec.install.spec.deployment_specs
    }

    pub fn permissions(&self) -> &[StrategyDeploymentPermissions] {
        &self.spec.install.spec.permissions
    }

    pub fn cluster_permissions(&self) -> &[StrategyDeploymentPermissions] {
        &self.spec.install.spec.cluster_permissions
    }

    pub fn webhooks(&self) -> &[WebhookDescription] {
        &self.spec.webhook_definitions
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvSpec {
    #[serde(default)]
    pub install: NamedInstallStrategy,
    #[serde(default)]
    pub install_modes: Vec<InstallMode>,
    #[serde(default, rename = "customresourcedefinitions")]
    pub custom_resource_definitions: CustomResourceDefinitions,
    #[serde(default, rename = "apiservicedefinitions")]
    pub api_service_definitions: ApiServiceDefinitions,
    #[serde(default, rename = "webhookdefinitions")]
    pub webhook_definitions: Vec<WebhookDescription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedInstallStrategy {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub spec: StrategyDetailsDeployment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDetailsDeployment {
    #[serde(default, rename = "deployments")]
    pub deployment_specs: Vec<StrategyDeploymentSpec>,
    #[serde(default)]
    pub permissions: Vec<StrategyDeploymentPermissions>,
    #[serde(default)]
    pub cluster_permissions: Vec<StrategyDeploymentPermissions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyDeploymentSpec {
    pub name: String,
    pub spec: DeploymentSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label: BTreeMap<String, String>,
}

/// Rules granted to one service account. Its JSON form feeds the generated-name hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDeploymentPermissions {
    #[serde(default)]
    pub service_account_name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl StrategyDeploymentPermissions {
    /// An empty account name means the namespace's `default` account.
    pub fn service_account_or_default(&self) -> &str {
        if self.service_account_name.is_empty() { "default" } else { &self.service_account_name }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InstallModeType {
    AllNamespaces,
    MultiNamespace,
    OwnNamespace,
    SingleNamespace,
}

impl InstallModeType {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallModeType::AllNamespaces => "AllNamespaces",
            InstallModeType::MultiNamespace => "MultiNamespace",
            InstallModeType::OwnNamespace => "OwnNamespace",
            InstallModeType::SingleNamespace => "SingleNamespace",
        }
    }
}

impl fmt::Display for InstallModeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMode {
    #[serde(rename = "type")]
    pub mode: InstallModeType,
    #[serde(default)]
    pub supported: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomResourceDefinitions {
    #[serde(default)]
    pub owned: Vec<CrdDescription>,
    #[serde(default)]
    pub required: Vec<CrdDescription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdDescription {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiServiceDefinitions {
    #[serde(default)]
    pub owned: Vec<ApiServiceDescription>,
    #[serde(default)]
    pub required: Vec<ApiServiceDescription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_name: String,
}

/// Declaration order is the sort order of the type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WebhookAdmissionType {
    ConversionWebhook,
    MutatingAdmissionWebhook,
    ValidatingAdmissionWebhook,
}

impl WebhookAdmissionType {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookAdmissionType::ConversionWebhook => "ConversionWebhook",
            WebhookAdmissionType::MutatingAdmissionWebhook => "MutatingAdmissionWebhook",
            WebhookAdmissionType::ValidatingAdmissionWebhook => "ValidatingAdmissionWebhook",
        }
    }
}

impl fmt::Display for WebhookAdmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub const DEFAULT_WEBHOOK_PORT: i32 = 443;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDescription {
    pub generate_name: String,
    #[serde(rename = "type")]
    pub webhook_type: WebhookAdmissionType,
    pub deployment_name: String,
    #[serde(default)]
    pub container_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub admission_review_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reinvocation_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_path: Option<String>,
    #[serde(default, rename = "conversionCRDs")]
    pub conversion_crds: Vec<String>,
}

impl WebhookDescription {
    pub fn new(webhook_type: WebhookAdmissionType, generate_name: &str, deployment_name: &str) -> Self {
        Self {
            generate_name: generate_name.to_string(),
            webhook_type,
            deployment_name: deployment_name.to_string(),
            container_port: DEFAULT_WEBHOOK_PORT,
            target_port: None,
            rules: Vec::new(),
            failure_policy: None,
            match_policy: None,
            object_selector: None,
            side_effects: None,
            timeout_seconds: None,
            admission_review_versions: Vec::new(),
            reinvocation_policy: None,
            webhook_path: None,
            conversion_crds: Vec::new(),
        }
    }

    /// Container port, falling back to 443 when unset.
    pub fn port(&self) -> i32 {
        if self.container_port > 0 { self.container_port } else { DEFAULT_WEBHOOK_PORT }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_csv_yaml() {
        let yaml = r#"
apiVersion: operators.coreos.com/v1alpha1
kind: ClusterServiceVersion
metadata:
  name: memcached.v0.1.0
  annotations:
    operatorframework.io/suggested-namespace: memcached
spec:
  displayName: ignored
  installModes:
    - type: OwnNamespace
      supported: true
    - type: AllNamespaces
      supported: false
  install:
    strategy: deployment
    spec:
      permissions:
        - serviceAccountName: operator
          rules:
            - apiGroups: [""]
              resources: [configmaps]
              verbs: [get]
      deployments:
        - name: memcached-operator
          label:
            app: memcached
          spec:
            selector:
              matchLabels:
                app: memcached
            template:
              spec:
                containers:
                  - name: manager
                    image: example.com/memcached:v0.1.0
  customresourcedefinitions:
    owned:
      - name: memcacheds.cache.example.com
        version: v1
        kind: Memcached
  webhookdefinitions:
    - generateName: vmemcached.kb.io
      type: ValidatingAdmissionWebhook
      deploymentName: memcached-operator
      containerPort: 9443
      conversionCRDs: []
"#;
        let csv: ClusterServiceVersion = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(csv.name(), "memcached.v0.1.0");
        assert_eq!(csv.supported_install_modes().collect::<Vec<_>>(), vec![InstallModeType::OwnNamespace]);
        assert!(!csv.supports(InstallModeType::AllNamespaces));
        assert_eq!(csv.deployments()[0].label["app"], "memcached");
        assert_eq!(csv.permissions()[0].service_account_or_default(), "operator");
        assert_eq!(csv.spec.custom_resource_definitions.owned[0].name, "memcacheds.cache.example.com");
        assert_eq!(csv.webhooks()[0].webhook_type, WebhookAdmissionType::ValidatingAdmissionWebhook);
        assert_eq!(csv.webhooks()[0].port(), 9443);
    }

    #[test]
    fn webhook_types_order_by_name() {
        let mut types = vec![
            WebhookAdmissionType::ValidatingAdmissionWebhook,
            WebhookAdmissionType::ConversionWebhook,
            WebhookAdmissionType::MutatingAdmissionWebhook,
        ];
        types.sort();
        let names: Vec<_> = types.iter().map(|t| t.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn empty_service_account_means_default() {
        assert_eq!(StrategyDeploymentPermissions::default().service_account_or_default(), "default");
    }
}
