//! Closed object model for everything the renderer emits.
//!
//! Typed variants cover the kinds generators and mutators need to inspect;
//! everything else travels as a [`DynamicObject`].

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone)]
pub enum Object {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Deployment(Deployment),
    Service(Service),
    CustomResourceDefinition(CustomResourceDefinition),
    ValidatingWebhookConfiguration(ValidatingWebhookConfiguration),
    MutatingWebhookConfiguration(MutatingWebhookConfiguration),
    Dynamic(DynamicObject),
}

macro_rules! each_typed {
    ($obj:expr, $o:ident => $typed:expr, $dyn_o:ident => $dynamic:expr) => {
        match $obj {
            Object::ServiceAccount($o) => $typed,
            Object::Role($o) => $typed,
            Object::RoleBinding($o) => $typed,
            Object::ClusterRole($o) => $typed,
            Object::ClusterRoleBinding($o) => $typed,
            Object::Deployment($o) => $typed,
            Object::Service($o) => $typed,
            Object::CustomResourceDefinition($o) => $typed,
            Object::ValidatingWebhookConfiguration($o) => $typed,
            Object::MutatingWebhookConfiguration($o) => $typed,
            Object::Dynamic($dyn_o) => $dynamic,
        }
    };
}

// Static type info of a typed variant, read through a reference to the value.
fn kind_of<K: k8s_openapi::Resource>(_: &K) -> &'static str { K::KIND }
fn api_version_of<K: k8s_openapi::Resource>(_: &K) -> &'static str { K::API_VERSION }
fn group_of<K: k8s_openapi::Resource>(_: &K) -> &'static str { K::GROUP }

impl Object {
    pub fn meta(&self) -> &ObjectMeta {
        each_typed!(self, o => &o.metadata, d => &d.metadata)
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        each_typed!(self, o => &mut o.metadata, d => &mut d.metadata)
    }

    pub fn kind(&self) -> &str {
        each_typed!(self, o => kind_of(o), d => d.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""))
    }

    pub fn api_version(&self) -> &str {
        each_typed!(self, o => api_version_of(o), d => d.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or(""))
    }

    /// API group; empty for the core group.
    pub fn group(&self) -> &str {
        each_typed!(self, o => group_of(o), d => {
            let av = d.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or("");
            match av.split_once('/') {
                Some((group, _)) => group,
                None => "",
            }
        })
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or("")
    }

    pub fn set_namespace(&mut self, ns: &str) {
        self.meta_mut().namespace = Some(ns.to_string());
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().annotations.as_ref()
    }

    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.meta_mut().annotations.get_or_insert_with(BTreeMap::new)
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations().map(|a| a.contains_key(key)).unwrap_or(false)
    }

    /// `true` if kind, name and namespace all match.
    pub fn is(&self, kind: &str, name: &str, namespace: &str) -> bool {
        self.kind() == kind && self.name() == name && self.namespace() == namespace
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        each_typed!(self, o => o.serialize(serializer), d => d.serialize(serializer))
    }
}

macro_rules! impl_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for Object {
            fn from(o: $ty) -> Self { Object::$variant(o) }
        })*
    };
}

impl_from! {
    ServiceAccount => ServiceAccount,
    Role => Role,
    RoleBinding => RoleBinding,
    ClusterRole => ClusterRole,
    ClusterRoleBinding => ClusterRoleBinding,
    Deployment => Deployment,
    Service => Service,
    CustomResourceDefinition => CustomResourceDefinition,
    ValidatingWebhookConfiguration => ValidatingWebhookConfiguration,
    MutatingWebhookConfiguration => MutatingWebhookConfiguration,
    Dynamic => DynamicObject,
}

/// Copy every entry of `src` into `dst`; entries already present in `dst` win.
pub fn merge_missing(dst: &mut BTreeMap<String, String>, src: &BTreeMap<String, String>) {
    for (k, v) in src {
        dst.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(v: serde_json::Value) -> Object {
        Object::Dynamic(serde_json::from_value(v).unwrap())
    }

    #[test]
    fn typed_variant_reports_static_type_info() {
        let cr = ClusterRole { metadata: ObjectMeta { name: Some("cr".into()), ..Default::default() }, ..Default::default() };
        let obj = Object::from(cr);
        assert_eq!(obj.kind(), "ClusterRole");
        assert_eq!(obj.group(), "rbac.authorization.k8s.io");
        assert_eq!(obj.api_version(), "rbac.authorization.k8s.io/v1");
        assert_eq!(obj.name(), "cr");
        assert_eq!(obj.namespace(), "");
        let v = obj.to_value().unwrap();
        assert_eq!(v["kind"], "ClusterRole");
    }

    #[test]
    fn dynamic_variant_reads_type_meta() {
        let mut obj = dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "a"},
            "data": {"k": "v"}
        }));
        assert_eq!(obj.kind(), "ConfigMap");
        assert_eq!(obj.group(), "");
        assert!(obj.is("ConfigMap", "cm", "a"));
        obj.set_namespace("b");
        obj.annotations_mut().insert("x".into(), "y".into());
        let v = obj.to_value().unwrap();
        assert_eq!(v["metadata"]["namespace"], "b");
        assert_eq!(v["data"]["k"], "v");
        assert!(obj.has_annotation("x"));

        let pr = dynamic(json!({"apiVersion": "monitoring.coreos.com/v1", "kind": "PrometheusRule", "metadata": {"name": "r"}}));
        assert_eq!(pr.group(), "monitoring.coreos.com");
    }

    #[test]
    fn merge_missing_keeps_existing() {
        let mut dst = BTreeMap::from([("a".to_string(), "dst".to_string())]);
        let src = BTreeMap::from([("a".to_string(), "src".to_string()), ("b".to_string(), "src".to_string())]);
        merge_missing(&mut dst, &src);
        assert_eq!(dst["a"], "dst");
        assert_eq!(dst["b"], "src");
    }
}
