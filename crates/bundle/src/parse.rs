//! Reading a registry+v1 bundle from its on-disk layout.
//!
//! ```text
//! metadata/annotations.yaml    required
//! metadata/properties.yaml     optional
//! manifests/*.yaml             flat, exactly one ClusterServiceVersion
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use keel_core::ANNOTATION_PROPERTIES;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::debug;

use crate::csv::{ClusterServiceVersion, CSV_KIND};
use crate::RegistryV1;

pub const MANIFESTS_DIR: &str = "manifests";
pub const METADATA_DIR: &str = "metadata";
pub const ANNOTATION_PACKAGE: &str = "operators.operatorframework.io.bundle.package.v1";

const CRD_KIND: &str = "CustomResourceDefinition";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("error parsing objects in {:?}: {reason}", .path.display().to_string())]
    Objects { path: PathBuf, reason: String },
    #[error("subdirectories are not allowed within the {:?} directory of the bundle image filesystem: found {:?}", MANIFESTS_DIR, .path)]
    Subdirectory { path: String },
    #[error("no ClusterServiceVersion found in {:?}", MANIFESTS_DIR)]
    MissingCsv,
    #[error("failed to unmarshal csv.metadata.annotations['olm.properties']: {0}")]
    CsvProperties(#[source] serde_json::Error),
    #[error("failed to unmarshal metadata/properties.yaml: {0}")]
    PropertiesFile(#[source] serde_yaml::Error),
    #[error("failed to marshal registry+v1 properties to json: {0}")]
    EncodeProperties(#[source] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct AnnotationsFile {
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
}

/// One `{type, value}` bundle property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub property_type: String,
    pub value: Json,
}

#[derive(Debug, Default, Deserialize)]
struct PropertiesFile {
    #[serde(default)]
    properties: Vec<Property>,
}

fn read(path: &Path) -> Result<String, ParseError> {
    fs::read_to_string(path).map_err(|source| ParseError::Read { path: path.to_path_buf(), source })
}

/// Parse the bundle rooted at `root`.
pub fn parse_fs(root: &Path) -> Result<RegistryV1, ParseError> {
    let annotations_path = root.join(METADATA_DIR).join("annotations.yaml");
    let annotations: AnnotationsFile = serde_yaml::from_str(&read(&annotations_path)?)
        .map_err(|source| ParseError::Yaml { path: annotations_path.clone(), source })?;

    let mut bundle = RegistryV1 {
        package_name: annotations.annotations.get(ANNOTATION_PACKAGE).cloned().unwrap_or_default(),
        ..Default::default()
    };

    let mut csv = None;
    for path in manifest_files(root)? {
        let text = read(&path)?;
        let objects = decode_documents(&text).map_err(|reason| ParseError::Objects { path: path.clone(), reason })?;
        debug!(path = %path.display(), objects = objects.len(), "parsed manifest file");
        for obj in objects {
            let kind = obj.get("kind").and_then(Json::as_str).unwrap_or("").to_string();
            let to_err = |e: serde_json::Error| ParseError::Objects { path: path.clone(), reason: e.to_string() };
            match kind.as_str() {
                CSV_KIND => csv = Some(serde_json::from_value::<ClusterServiceVersion>(obj).map_err(to_err)?),
                CRD_KIND => bundle.crds.push(serde_json::from_value::<CustomResourceDefinition>(obj).map_err(to_err)?),
                _ => bundle.others.push(serde_json::from_value::<DynamicObject>(obj).map_err(to_err)?),
            }
        }
    }
    bundle.csv = csv.ok_or(ParseError::MissingCsv)?;
    merge_metadata_properties(&mut bundle.csv, root)?;
    Ok(bundle)
}

/// Regular files directly below `manifests/`, in lexical order.
fn manifest_files(root: &Path) -> Result<Vec<PathBuf>, ParseError> {
    let dir = root.join(MANIFESTS_DIR);
    let entries = fs::read_dir(&dir).map_err(|source| ParseError::Read { path: dir.clone(), source })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ParseError::Read { path: dir.clone(), source })?;
        let path = entry.path();
        let is_dir = entry.file_type().map_err(|source| ParseError::Read { path: path.clone(), source })?.is_dir();
        if is_dir {
            let rel = format!("{}/{}", MANIFESTS_DIR, entry.file_name().to_string_lossy());
            return Err(ParseError::Subdirectory { path: rel });
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Every object in a multi-document YAML stream, with `*List` wrappers flattened.
fn decode_documents(text: &str) -> Result<Vec<Json>, String> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| e.to_string())?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value).map_err(|e| e.to_string())?;
        flatten_into(json, &mut out)?;
    }
    Ok(out)
}

fn flatten_into(obj: Json, out: &mut Vec<Json>) -> Result<(), String> {
    let is_list = obj.get("kind").and_then(Json::as_str).map(|k| k.ends_with("List")).unwrap_or(false);
    match obj {
        Json::Object(mut map) if is_list && map.contains_key("items") => {
            if let Some(Json::Array(items)) = map.remove("items") {
                for item in items {
                    flatten_into(item, out)?;
                }
            }
            Ok(())
        }
        Json::Object(ref map) if !map.contains_key("kind") => Err("object has no kind".to_string()),
        Json::Object(_) => {
            out.push(obj);
            Ok(())
        }
        _ => Err("document is not an object".to_string()),
    }
}

/// Append `metadata/properties.yaml` entries to the CSV's property annotation.
/// Properties already on the CSV come first; nothing is deduplicated.
fn merge_metadata_properties(csv: &mut ClusterServiceVersion, root: &Path) -> Result<(), ParseError> {
    let mut all: Vec<Property> = match csv.annotation(ANNOTATION_PROPERTIES) {
        Some(raw) => serde_json::from_str(raw).map_err(ParseError::CsvProperties)?,
        None => Vec::new(),
    };

    let path = root.join(METADATA_DIR).join("properties.yaml");
    let data = match fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(ParseError::Read { path, source }),
    };
    if data.is_empty() {
        return Ok(());
    }
    let file: PropertiesFile = serde_yaml::from_str(&data).map_err(ParseError::PropertiesFile)?;
    all.extend(file.properties);

    let encoded = serde_json::to_string(&all).map_err(ParseError::EncodeProperties)?;
    csv.metadata.annotations.get_or_insert_with(Default::default).insert(ANNOTATION_PROPERTIES.to_string(), encoded);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lists_are_flattened_and_empty_documents_skipped() {
        let text = r#"
---
apiVersion: v1
kind: ConfigMapList
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata: {name: a}
  - apiVersion: v1
    kind: ConfigMap
    metadata: {name: b}
---
---
apiVersion: v1
kind: Secret
metadata: {name: c}
"#;
        let objs = decode_documents(text).unwrap();
        let names: Vec<_> = objs.iter().map(|o| o["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn documents_without_kind_are_rejected() {
        assert!(decode_documents("metadata: {name: x}\n").is_err());
        assert!(decode_documents("- 1\n- 2\n").is_err());
    }

    #[test]
    fn property_round_trips_as_type_value_pairs() {
        let p: Property = serde_json::from_value(json!({"type": "olm.package", "value": {"packageName": "x"}})).unwrap();
        assert_eq!(p.property_type, "olm.package");
        assert_eq!(serde_json::to_value(&p).unwrap()["type"], "olm.package");
    }
}
