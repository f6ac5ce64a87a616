//! Constructors for the objects generators emit.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::ANNOTATION_GENERATED_MANIFEST;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub(crate) fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: namespace.map(str::to_string), ..Default::default() }
}

// RBAC objects carry the generated marker so the installer can later re-delegate them.
fn rbac_meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    let mut m = meta(name, namespace);
    m.annotations = Some(BTreeMap::from([(ANNOTATION_GENERATED_MANIFEST.to_string(), "true".to_string())]));
    m
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

pub fn service_account(name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount { metadata: meta(name, Some(namespace)), ..Default::default() }
}

pub fn role(name: &str, namespace: &str, rules: Vec<PolicyRule>) -> Role {
    Role { metadata: rbac_meta(name, Some(namespace)), rules: Some(rules) }
}

pub fn role_binding(name: &str, namespace: &str, sa_name: &str, sa_namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: rbac_meta(name, Some(namespace)),
        subjects: Some(vec![service_account_subject(sa_name, sa_namespace)]),
        role_ref: RoleRef { api_group: RBAC_GROUP.to_string(), kind: "Role".to_string(), name: name.to_string() },
    }
}

pub fn cluster_role(name: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole { metadata: rbac_meta(name, None), rules: Some(rules), aggregation_rule: None }
}

pub fn cluster_role_binding(name: &str, sa_name: &str, sa_namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: rbac_meta(name, None),
        subjects: Some(vec![service_account_subject(sa_name, sa_namespace)]),
        role_ref: RoleRef { api_group: RBAC_GROUP.to_string(), kind: "ClusterRole".to_string(), name: name.to_string() },
    }
}

pub fn service(name: &str, namespace: &str, ports: Vec<ServicePort>, selector: Option<BTreeMap<String, String>>) -> Service {
    Service {
        metadata: meta(name, Some(namespace)),
        spec: Some(ServiceSpec { ports: Some(ports), selector, ..Default::default() }),
        status: None,
    }
}
