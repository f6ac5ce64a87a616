//! Keel installer RBAC: the rules an installer needs to create and own a rendered bundle.
//!
//! For every kind present it grants create/list/watch, plus get/update/patch/delete
//! limited to the names actually rendered. Generated Roles and ClusterRoles are
//! copied in too, since the installer can only bind rules it holds itself.

#![forbid(unsafe_code)]

pub use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::{Object, Scope, SupportedKind, ANNOTATION_GENERATED_MANIFEST};
use rustc_hash::FxHashMap;
use tracing::warn;

const UNNAMED_RESOURCE_VERBS: [&str; 3] = ["create", "list", "watch"];
const NAMED_RESOURCE_VERBS: [&str; 4] = ["get", "update", "patch", "delete"];

const EXTENSION_API_GROUP: &str = "olm.operatorframework.io";

fn scope_of(obj: &Object) -> Option<Scope> {
    SupportedKind::from_kind(obj.kind()).map(SupportedKind::scope)
}

fn is_generated(obj: &Object) -> bool {
    obj.has_annotation(ANNOTATION_GENERATED_MANIFEST)
}

/// ClusterRole managing every cluster-scoped object in `objs`, or `None` when there is nothing to grant.
/// The name is left for the caller to choose.
pub fn generate_resource_manager_cluster_role(objs: &[Object]) -> Option<ClusterRole> {
    let cluster: Vec<&Object> = objs.iter().filter(|o| scope_of(o) == Some(Scope::Cluster)).collect();
    let mut rules = policy_rules(&cluster);
    rules.extend(collect_rbac_rules(cluster.iter().copied().filter(|o| o.kind() == "ClusterRole" && is_generated(o))));
    if rules.is_empty() {
        return None;
    }
    Some(ClusterRole { metadata: ObjectMeta::default(), rules: Some(rules), aggregation_rule: None })
}

/// One Role per namespace holding namespaced objects, in order of first appearance.
/// Names are left for the caller to choose.
pub fn generate_resource_manager_roles(objs: &[Object]) -> Vec<Role> {
    let mut by_namespace: Vec<(&str, Vec<&Object>)> = Vec::new();
    for obj in objs.iter().filter(|o| scope_of(o) == Some(Scope::Namespaced)) {
        match by_namespace.iter_mut().find(|(ns, _)| *ns == obj.namespace()) {
            Some((_, group)) => group.push(obj),
            None => by_namespace.push((obj.namespace(), vec![obj])),
        }
    }
    by_namespace
        .into_iter()
        .map(|(ns, group)| {
            let mut rules = policy_rules(&group);
            rules.extend(collect_rbac_rules(group.iter().copied().filter(|o| o.kind() == "Role" && is_generated(o))));
            Role {
                metadata: ObjectMeta { namespace: Some(ns.to_string()), ..Default::default() },
                rules: Some(rules),
            }
        })
        .collect()
}

/// Permission to update the finalizers of the named ClusterExtension.
pub fn cluster_extension_finalizer_policy_rule(cluster_extension_name: &str) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![EXTENSION_API_GROUP.to_string()]),
        resources: Some(vec!["clusterextensions/finalizers".to_string()]),
        verbs: vec!["update".to_string()],
        resource_names: Some(vec![cluster_extension_name.to_string()]),
        ..Default::default()
    }
}

/// Two rules per (group, kind), in order of first appearance.
fn policy_rules(objs: &[&Object]) -> Vec<PolicyRule> {
    let mut index: FxHashMap<(&str, &str), usize> = FxHashMap::default();
    let mut groups: Vec<((&str, &str), Vec<String>)> = Vec::new();
    for obj in objs {
        let key = (obj.group(), obj.kind());
        let i = *index.entry(key).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[i].1.push(obj.name().to_string());
    }

    let mut rules = Vec::with_capacity(2 * groups.len());
    for ((group, kind), names) in groups {
        rules.push(policy_rule(group, kind, &UNNAMED_RESOURCE_VERBS, None));
        rules.push(policy_rule(group, kind, &NAMED_RESOURCE_VERBS, Some(names)));
    }
    rules
}

fn policy_rule(group: &str, kind: &str, verbs: &[&str], resource_names: Option<Vec<String>>) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(vec![format!("{}s", kind.to_lowercase())]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        resource_names,
        ..Default::default()
    }
}

fn collect_rbac_rules<'a>(objs: impl Iterator<Item = &'a Object>) -> Vec<PolicyRule> {
    let mut rules = Vec::new();
    for obj in objs {
        match obj {
            Object::Role(r) => rules.extend(r.rules.iter().flatten().cloned()),
            Object::ClusterRole(cr) => rules.extend(cr.rules.iter().flatten().cloned()),
            Object::Dynamic(d) => match d.data.get("rules").cloned().map(serde_json::from_value::<Vec<PolicyRule>>) {
                Some(Ok(parsed)) => rules.extend(parsed),
                Some(Err(e)) => warn!(kind = %obj.kind(), name = %obj.name(), error = %e, "skipping unreadable rules"),
                None => {}
            },
            _ => {}
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use std::collections::BTreeMap;

    fn meta(name: &str, ns: Option<&str>, generated: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: ns.map(str::to_string),
            annotations: generated.then(|| BTreeMap::from([(ANNOTATION_GENERATED_MANIFEST.to_string(), String::new())])),
            ..Default::default()
        }
    }

    fn config_map(name: &str, ns: &str) -> Object {
        Object::Dynamic(
            serde_json::from_value(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": ns}
            }))
            .unwrap(),
        )
    }

    fn rule(resource: &str) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![resource.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }
    }

    fn names(rule: &PolicyRule) -> Vec<&str> {
        rule.resource_names.iter().flatten().map(String::as_str).collect()
    }

    #[test]
    fn cluster_role_covers_cluster_scoped_kinds_and_generated_roles() {
        let objs: Vec<Object> = vec![
            ClusterRole { metadata: meta("generated", None, true), rules: Some(vec![rule("configmaps")]), aggregation_rule: None }.into(),
            ClusterRole { metadata: meta("shipped", None, false), rules: Some(vec![rule("secrets")]), aggregation_rule: None }.into(),
            CustomResourceDefinition { metadata: meta("a.example.com", None, false), ..Default::default() }.into(),
            CustomResourceDefinition { metadata: meta("b.example.com", None, false), ..Default::default() }.into(),
            config_map("cm", "ns"),
        ];
        let cr = generate_resource_manager_cluster_role(&objs).unwrap();
        assert!(cr.metadata.name.is_none());
        let rules = cr.rules.unwrap();
        assert_eq!(rules.len(), 5);

        assert_eq!(rules[0].api_groups, Some(vec!["rbac.authorization.k8s.io".to_string()]));
        assert_eq!(rules[0].resources, Some(vec!["clusterroles".to_string()]));
        assert_eq!(rules[0].verbs, vec!["create", "list", "watch"]);
        assert!(rules[0].resource_names.is_none());
        assert_eq!(rules[1].verbs, vec!["get", "update", "patch", "delete"]);
        assert_eq!(names(&rules[1]), vec!["generated", "shipped"]);

        assert_eq!(rules[2].api_groups, Some(vec!["apiextensions.k8s.io".to_string()]));
        assert_eq!(rules[2].resources, Some(vec!["customresourcedefinitions".to_string()]));
        assert_eq!(names(&rules[3]), vec!["a.example.com", "b.example.com"]);

        assert_eq!(rules[4], rule("configmaps"));
    }

    #[test]
    fn no_cluster_role_without_cluster_scoped_objects() {
        let objs: Vec<Object> = vec![config_map("cm", "ns")];
        assert!(generate_resource_manager_cluster_role(&objs).is_none());
        assert!(generate_resource_manager_cluster_role(&[]).is_none());
    }

    #[test]
    fn one_role_per_namespace() {
        let objs: Vec<Object> = vec![
            Service { metadata: meta("svc", Some("b"), false), ..Default::default() }.into(),
            config_map("cm1", "a"),
            Role { metadata: meta("r", Some("a"), true), rules: Some(vec![rule("pods")]) }.into(),
            config_map("cm2", "a"),
        ];
        let roles = generate_resource_manager_roles(&objs);
        let namespaces: Vec<_> = roles.iter().map(|r| r.metadata.namespace.clone().unwrap()).collect();
        assert_eq!(namespaces, vec!["b", "a"]);
        assert!(roles.iter().all(|r| r.metadata.name.is_none()));

        let rules = roles[1].rules.as_ref().unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[0].resources, Some(vec!["configmaps".to_string()]));
        assert_eq!(names(&rules[1]), vec!["cm1", "cm2"]);
        assert_eq!(rules[2].resources, Some(vec!["roles".to_string()]));
        assert_eq!(rules[4], rule("pods"));
    }

    #[test]
    fn generated_dynamic_roles_contribute_rules() {
        let role: Object = Object::Dynamic(
            serde_json::from_value(serde_json::json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "Role",
                "metadata": {"name": "r", "namespace": "ns", "annotations": {(ANNOTATION_GENERATED_MANIFEST): "true"}},
                "rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get"]}]
            }))
            .unwrap(),
        );
        let roles = generate_resource_manager_roles(&[role]);
        assert_eq!(roles[0].rules.as_ref().unwrap()[2], rule("pods"));
    }

    #[test]
    fn finalizer_rule() {
        let r = cluster_extension_finalizer_policy_rule("my-ext");
        assert_eq!(r.api_groups, Some(vec!["olm.operatorframework.io".to_string()]));
        assert_eq!(r.resources, Some(vec!["clusterextensions/finalizers".to_string()]));
        assert_eq!(r.verbs, vec!["update"]);
        assert_eq!(r.resource_names, Some(vec!["my-ext".to_string()]));
    }
}
