//! Process-local OCI image layout used as the pull staging area.
//!
//! ```text
//! <root>/oci-layout
//! <root>/index.json
//! <root>/blobs/sha256/<hex>
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest, OCI_IMAGE_MEDIA_TYPE};
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::registry::{current_platform, RegistryClient};
use crate::UnpackError;

const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Index {
    schema_version: u8,
    manifests: Vec<OciDescriptor>,
}

/// Subset of the OCI image config this pipeline reads.
#[derive(Debug, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: Option<ImageConfigBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageConfigBody {
    #[serde(rename = "Labels", default)]
    pub labels: Option<BTreeMap<String, String>>,
}

impl ImageConfig {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.as_ref()?.labels.as_ref()?.get(key).map(String::as_str)
    }
}

pub struct OciLayout {
    root: PathBuf,
}

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

impl OciLayout {
    pub fn create(root: &Path) -> Result<Self, UnpackError> {
        std::fs::create_dir_all(root.join("blobs/sha256")).map_err(|e| UnpackError::io("error creating image layout", e))?;
        std::fs::write(root.join("oci-layout"), LAYOUT_VERSION).map_err(|e| UnpackError::io("error creating image layout", e))?;
        Ok(Self { root: root.to_path_buf() })
    }

    pub fn open(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, UnpackError> {
        match digest.split_once(':') {
            Some(("sha256", hex)) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Ok(self.root.join("blobs/sha256").join(hex))
            }
            _ => Err(UnpackError::UnsupportedDigest(digest.to_string())),
        }
    }

    /// Store `data` under `digest`, refusing content that does not hash to it.
    pub fn write_blob(&self, digest: &str, data: &[u8]) -> Result<(), UnpackError> {
        let path = self.blob_path(digest)?;
        let actual = sha256_digest(data);
        if actual != digest {
            return Err(UnpackError::DigestMismatch { expected: digest.to_string(), actual });
        }
        std::fs::write(&path, data).map_err(|e| UnpackError::io(format!("error writing blob {}", digest), e))
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>, UnpackError> {
        let path = self.blob_path(digest)?;
        std::fs::read(&path).map_err(|e| UnpackError::io(format!("error reading blob {}", digest), e))
    }

    fn write_index(&self, manifest: OciDescriptor) -> Result<(), UnpackError> {
        let index = Index { schema_version: 2, manifests: vec![manifest] };
        let raw = serde_json::to_vec(&index).map_err(|e| UnpackError::Layout(e.to_string()))?;
        std::fs::write(self.root.join("index.json"), raw).map_err(|e| UnpackError::io("error writing index.json", e))
    }

    /// The single image manifest recorded in `index.json`.
    pub fn image_manifest(&self) -> Result<OciImageManifest, UnpackError> {
        let raw = std::fs::read(self.root.join("index.json")).map_err(|e| UnpackError::io("error reading index.json", e))?;
        let index: Index = serde_json::from_slice(&raw).map_err(|e| UnpackError::Layout(format!("index.json: {}", e)))?;
        let desc = match index.manifests.as_slice() {
            [only] => only,
            other => return Err(UnpackError::Layout(format!("expected exactly one manifest, found {}", other.len()))),
        };
        let raw = self.read_blob(&desc.digest)?;
        serde_json::from_slice(&raw).map_err(|e| UnpackError::Layout(format!("manifest {}: {}", desc.digest, e)))
    }

    pub fn image_config(&self, manifest: &OciImageManifest) -> Result<ImageConfig, UnpackError> {
        let raw = self.read_blob(&manifest.config.digest)?;
        serde_json::from_slice(&raw).map_err(|e| UnpackError::Layout(format!("config {}: {}", manifest.config.digest, e)))
    }
}

async fn with_timeout<T, F>(timeout: Duration, operation: impl Into<String>, fut: F) -> Result<T, UnpackError>
where
    F: std::future::Future<Output = Result<T, UnpackError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| UnpackError::Timeout { operation: operation.into(), timeout })?
}

pub(crate) async fn pull_manifest(
    registry: &dyn RegistryClient,
    reference: &Reference,
    timeout: Duration,
) -> Result<(OciManifest, String), UnpackError> {
    with_timeout(timeout, format!("pull manifest for {}", reference.whole()), registry.pull_manifest(reference)).await
}

/// Resolve an image index to the manifest for the running platform.
async fn resolve_image_manifest(
    registry: &dyn RegistryClient,
    reference: &Reference,
    timeout: Duration,
) -> Result<OciImageManifest, UnpackError> {
    let (manifest, _) = pull_manifest(registry, reference, timeout).await?;
    let index = match manifest {
        OciManifest::Image(img) => return Ok(img),
        OciManifest::ImageIndex(index) => index,
    };
    let (os, arch) = current_platform();
    let entry = index
        .manifests
        .iter()
        .find(|m| m.platform.as_ref().is_some_and(|p| p.os == os && p.architecture == arch))
        .ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();
            UnpackError::Registry {
                reference: reference.whole(),
                reason: format!("no manifest for {}/{}; available: {}", os, arch, available.join(", ")),
            }
        })?;
    let platform_ref: Reference = format!("{}/{}@{}", reference.registry(), reference.repository(), entry.digest)
        .parse()
        .map_err(|e| UnpackError::Registry { reference: reference.whole(), reason: format!("failed to build platform reference: {}", e) })?;
    match pull_manifest(registry, &platform_ref, timeout).await? {
        (OciManifest::Image(img), _) => Ok(img),
        _ => Err(UnpackError::Registry { reference: reference.whole(), reason: "nested image index not supported".to_string() }),
    }
}

/// Copy the image at `reference` into `layout`. Signatures are never copied.
pub async fn pull_into_layout(
    registry: &dyn RegistryClient,
    reference: &Reference,
    layout: &OciLayout,
    timeout: Duration,
) -> Result<OciImageManifest, UnpackError> {
    let manifest = resolve_image_manifest(registry, reference, timeout).await?;

    let blobs = std::iter::once(&manifest.config).chain(manifest.layers.iter());
    for desc in blobs {
        debug!(digest = %desc.digest, size = desc.size, "pulling blob");
        let data = with_timeout(timeout, format!("pull blob {}", desc.digest), registry.pull_blob(reference, desc)).await?;
        layout.write_blob(&desc.digest, &data)?;
    }

    let raw = serde_json::to_vec(&manifest).map_err(|e| UnpackError::Layout(e.to_string()))?;
    let digest = sha256_digest(&raw);
    layout.write_blob(&digest, &raw)?;
    layout.write_index(OciDescriptor {
        media_type: OCI_IMAGE_MEDIA_TYPE.to_string(),
        digest,
        size: raw.len() as i64,
        ..Default::default()
    })?;
    Ok(manifest)
}
