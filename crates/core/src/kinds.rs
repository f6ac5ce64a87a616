//! The closed set of kinds a rendered registry+v1 bundle may contain.
//!
//! - Passthrough kinds: what a bundle may ship verbatim under `manifests/`
//! - Managed kinds: what the installer RBAC aggregator grants access to

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Cluster,
    Namespaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SupportedKind {
    // cluster scoped
    ClusterRole,
    ClusterRoleBinding,
    PriorityClass,
    ConsoleYamlSample,
    ConsoleQuickStart,
    ConsoleCliDownload,
    ConsoleLink,
    CustomResourceDefinition,
    // namespace scoped
    Secret,
    ConfigMap,
    ServiceAccount,
    Service,
    Role,
    RoleBinding,
    PrometheusRule,
    ServiceMonitor,
    PodDisruptionBudget,
    VerticalPodAutoscaler,
    NetworkPolicy,
    Deployment,
}

impl SupportedKind {
    pub const ALL: [SupportedKind; 20] = [
        SupportedKind::ClusterRole,
        SupportedKind::ClusterRoleBinding,
        SupportedKind::PriorityClass,
        SupportedKind::ConsoleYamlSample,
        SupportedKind::ConsoleQuickStart,
        SupportedKind::ConsoleCliDownload,
        SupportedKind::ConsoleLink,
        SupportedKind::CustomResourceDefinition,
        SupportedKind::Secret,
        SupportedKind::ConfigMap,
        SupportedKind::ServiceAccount,
        SupportedKind::Service,
        SupportedKind::Role,
        SupportedKind::RoleBinding,
        SupportedKind::PrometheusRule,
        SupportedKind::ServiceMonitor,
        SupportedKind::PodDisruptionBudget,
        SupportedKind::VerticalPodAutoscaler,
        SupportedKind::NetworkPolicy,
        SupportedKind::Deployment,
    ];

    /// Kind string as it appears in an object's `kind` field.
    pub fn as_str(self) -> &'static str {
        match self {
            SupportedKind::ClusterRole => "ClusterRole",
            SupportedKind::ClusterRoleBinding => "ClusterRoleBinding",
            SupportedKind::PriorityClass => "PriorityClass",
            SupportedKind::ConsoleYamlSample => "ConsoleYAMLSample",
            SupportedKind::ConsoleQuickStart => "ConsoleQuickStart",
            SupportedKind::ConsoleCliDownload => "ConsoleCLIDownload",
            SupportedKind::ConsoleLink => "ConsoleLink",
            SupportedKind::CustomResourceDefinition => "CustomResourceDefinition",
            SupportedKind::Secret => "Secret",
            SupportedKind::ConfigMap => "ConfigMap",
            SupportedKind::ServiceAccount => "ServiceAccount",
            SupportedKind::Service => "Service",
            SupportedKind::Role => "Role",
            SupportedKind::RoleBinding => "RoleBinding",
            SupportedKind::PrometheusRule => "PrometheusRule",
            SupportedKind::ServiceMonitor => "ServiceMonitor",
            SupportedKind::PodDisruptionBudget => "PodDisruptionBudget",
            SupportedKind::VerticalPodAutoscaler => "VerticalPodAutoscaler",
            SupportedKind::NetworkPolicy => "NetworkPolicy",
            SupportedKind::Deployment => "Deployment",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == kind)
    }

    pub fn scope(self) -> Scope {
        match self {
            SupportedKind::ClusterRole
            | SupportedKind::ClusterRoleBinding
            | SupportedKind::PriorityClass
            | SupportedKind::ConsoleYamlSample
            | SupportedKind::ConsoleQuickStart
            | SupportedKind::ConsoleCliDownload
            | SupportedKind::ConsoleLink
            | SupportedKind::CustomResourceDefinition => Scope::Cluster,
            _ => Scope::Namespaced,
        }
    }

    /// Whether a bundle may carry this kind as a plain manifest.
    /// Deployments only come from the CSV install strategy.
    pub fn is_passthrough(self) -> bool {
        !matches!(self, SupportedKind::Deployment)
    }
}

impl std::fmt::Display for SupportedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for k in SupportedKind::ALL {
            assert_eq!(SupportedKind::from_kind(k.as_str()), Some(k));
        }
        assert_eq!(SupportedKind::from_kind("ConsoleYamlSample"), None);
        assert_eq!(SupportedKind::from_kind("Pod"), None);
    }

    #[test]
    fn scopes() {
        assert_eq!(SupportedKind::CustomResourceDefinition.scope(), Scope::Cluster);
        assert_eq!(SupportedKind::ConfigMap.scope(), Scope::Namespaced);
        assert!(!SupportedKind::Deployment.is_passthrough());
        assert!(SupportedKind::Secret.is_passthrough());
    }
}
