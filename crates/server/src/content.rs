//! Line-delimited catalog content with a schema/package/name index.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::body::Bytes;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("error parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: catalog documents must be objects")]
    NotAnObject { path: PathBuf },
}

fn io_err(path: &Path, source: std::io::Error) -> ContentError {
    ContentError::Io { path: path.to_path_buf(), source }
}

/// Every catalog object, one compact JSON document per line, plus where each one lives.
#[derive(Debug, Clone)]
pub struct CatalogContent {
    data: Bytes,
    sections: Vec<Range<usize>>,
    by_schema: BTreeMap<String, Vec<usize>>,
    by_package: BTreeMap<String, Vec<usize>>,
    by_name: BTreeMap<String, Vec<usize>>,
    modified: SystemTime,
}

impl CatalogContent {
    /// Read every `.json`, `.jsonl`, `.yaml` and `.yml` file below `root` in path order.
    /// Symlinks are not followed and other files are ignored.
    pub fn load(root: &Path) -> Result<Self, ContentError> {
        let modified = fs::metadata(root).and_then(|md| md.modified()).map_err(|e| io_err(root, e))?;
        let mut files = Vec::new();
        collect_files(root, &mut files)?;

        let mut content = CatalogContent {
            data: Bytes::new(),
            sections: Vec::new(),
            by_schema: BTreeMap::new(),
            by_package: BTreeMap::new(),
            by_name: BTreeMap::new(),
            modified,
        };
        let mut data = Vec::new();
        for file in files {
            let raw = fs::read(&file).map_err(|e| io_err(&file, e))?;
            for doc in parse_documents(&file, &raw)? {
                content.push(&mut data, &file, doc)?;
            }
        }
        debug!(root = %root.display(), metas = content.sections.len(), bytes = data.len(), "indexed catalog content");
        content.data = Bytes::from(data);
        Ok(content)
    }

    fn push(&mut self, data: &mut Vec<u8>, file: &Path, doc: Value) -> Result<(), ContentError> {
        let Value::Object(obj) = &doc else {
            return Err(ContentError::NotAnObject { path: file.to_path_buf() });
        };
        let field = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let schema = field("schema");
        let name = field("name");
        let mut package = field("package");
        if package.is_empty() && schema == "olm.package" {
            package = name.clone();
        }

        let start = data.len();
        serde_json::to_writer(&mut *data, &doc).map_err(|source| ContentError::Json { path: file.to_path_buf(), source })?;
        data.push(b'\n');
        let idx = self.sections.len();
        self.sections.push(start..data.len());
        for (map, key) in [(&mut self.by_schema, schema), (&mut self.by_package, package), (&mut self.by_name, name)] {
            if !key.is_empty() {
                map.entry(key).or_default().push(idx);
            }
        }
        Ok(())
    }

    pub fn all(&self) -> Bytes { self.data.clone() }

    pub fn modified(&self) -> SystemTime { self.modified }

    pub fn len(&self) -> usize { self.sections.len() }

    pub fn is_empty(&self) -> bool { self.sections.is_empty() }

    /// Objects matching every non-empty filter, in catalog order.
    pub fn metas(&self, schema: &str, package: &str, name: &str) -> Bytes {
        if schema.is_empty() && package.is_empty() && name.is_empty() {
            return self.all();
        }
        let lookup = |map: &BTreeMap<String, Vec<usize>>, key: &str| -> BTreeSet<usize> {
            map.get(key).map(|v| v.iter().copied().collect()).unwrap_or_default()
        };
        let mut matched: BTreeSet<usize> = if schema.is_empty() { (0..self.sections.len()).collect() } else { lookup(&self.by_schema, schema) };
        if !package.is_empty() {
            let pkg = lookup(&self.by_package, package);
            matched.retain(|i| pkg.contains(i));
        }
        if !name.is_empty() {
            let names = lookup(&self.by_name, name);
            matched.retain(|i| names.contains(i));
        }

        let mut out = Vec::new();
        for i in matched {
            out.extend_from_slice(&self.data[self.sections[i].clone()]);
        }
        Bytes::from(out)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ContentError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io_err(dir, e))?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() && matches!(path.extension().and_then(|e| e.to_str()), Some("json" | "jsonl" | "yaml" | "yml")) {
            out.push(path);
        }
    }
    Ok(())
}

fn parse_documents(path: &Path, raw: &[u8]) -> Result<Vec<Value>, ContentError> {
    let mut docs = Vec::new();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => {
            for de in serde_yaml::Deserializer::from_slice(raw) {
                let doc = Value::deserialize(de).map_err(|source| ContentError::Yaml { path: path.to_path_buf(), source })?;
                if !doc.is_null() {
                    docs.push(doc);
                }
            }
        }
        _ => {
            for doc in serde_json::Deserializer::from_slice(raw).into_iter::<Value>() {
                docs.push(doc.map_err(|source| ContentError::Json { path: path.to_path_buf(), source })?);
            }
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(b: Bytes) -> Vec<Value> {
        std::str::from_utf8(&b).unwrap().lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    fn catalog() -> (tempfile::TempDir, CatalogContent) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("configs/foo")).unwrap();
        fs::write(
            root.join("configs/foo/catalog.json"),
            r#"{"schema":"olm.package","name":"foo","defaultChannel":"stable"}
{"schema":"olm.channel","package":"foo","name":"stable","entries":[{"name":"foo.v1"}]}
{"schema":"olm.bundle","package":"foo","name":"foo.v1","image":"example.com/foo:v1"}"#,
        )
        .unwrap();
        fs::write(
            root.join("configs/bar.yaml"),
            "schema: olm.package\nname: bar\n---\nschema: olm.bundle\npackage: bar\nname: foo.v1\n---\n",
        )
        .unwrap();
        fs::write(root.join("configs/README.md"), "not catalog content").unwrap();
        std::os::unix::fs::symlink("/etc", root.join("configs/etc")).unwrap();
        let content = CatalogContent::load(root).unwrap();
        (tmp, content)
    }

    #[test]
    fn all_lists_every_object_in_path_order() {
        let (_tmp, content) = catalog();
        assert_eq!(content.len(), 5);
        let names: Vec<_> = lines(content.all()).iter().map(|v| v["name"].as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["bar", "foo.v1", "foo", "stable", "foo.v1"]);
    }

    #[test]
    fn metas_intersect_filters() {
        let (_tmp, content) = catalog();
        let bundles = lines(content.metas("olm.bundle", "", ""));
        assert_eq!(bundles.len(), 2);

        let foo_bundles = lines(content.metas("olm.bundle", "foo", ""));
        assert_eq!(foo_bundles.len(), 1);
        assert_eq!(foo_bundles[0]["image"], "example.com/foo:v1");

        // a package object belongs to the package it names
        assert_eq!(lines(content.metas("", "bar", "")).len(), 2);
        assert_eq!(lines(content.metas("", "", "foo.v1")).len(), 2);
        assert!(content.metas("olm.channel", "bar", "").is_empty());
        assert!(content.metas("olm.missing", "", "").is_empty());
        assert_eq!(content.metas("", "", ""), content.all());
    }

    #[test]
    fn non_object_documents_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("catalog.json"), "[1, 2]").unwrap();
        assert!(matches!(CatalogContent::load(tmp.path()), Err(ContentError::NotAnObject { .. })));

        fs::write(tmp.path().join("catalog.json"), "{\"schema\":").unwrap();
        assert!(matches!(CatalogContent::load(tmp.path()), Err(ContentError::Json { .. })));
    }
}
