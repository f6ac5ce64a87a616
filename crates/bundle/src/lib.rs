//! Keel registry+v1 bundles: the CSV model, the filesystem parser and the validator.

#![forbid(unsafe_code)]

pub mod csv;
pub mod parse;
pub mod validate;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::DynamicObject;

pub use csv::{
    ClusterServiceVersion, InstallMode, InstallModeType, StrategyDeploymentPermissions, StrategyDeploymentSpec, WebhookAdmissionType,
    WebhookDescription,
};
pub use parse::{parse_fs, ParseError, Property};
pub use validate::{BundleValidator, ValidationError};

/// A parsed bundle: one CSV, its CRDs, and everything else in discovery order.
#[derive(Debug, Clone, Default)]
pub struct RegistryV1 {
    pub package_name: String,
    pub csv: ClusterServiceVersion,
    pub crds: Vec<CustomResourceDefinition>,
    pub others: Vec<DynamicObject>,
}
