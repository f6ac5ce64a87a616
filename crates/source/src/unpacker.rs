//! Content-addressed catalog unpacking.
//!
//! Layout: `<cache-root>/<catalog-name>/<digest>/...`. A directory at a digest
//! path is only ever a complete unpack; only the newest digest per catalog is kept.

use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use metrics::{counter, histogram};
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_core::{dns1123_subdomain_errors, CONFIG_DIR_LABEL};

use crate::filter::{all_filters, force_ownership_rwx, only_path};
use crate::fsutil::{self, FsError, WRITABLE_MODE};
use crate::layers::apply_layers_to_disk;
use crate::layout::{pull_into_layout, pull_manifest, OciLayout};
use crate::policy::PolicySource;
use crate::registry::RegistryClient;
use crate::UnpackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSource>,
}

/// A catalog to unpack. `name` must already be a valid path component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
    pub source: CatalogSource,
}

impl Catalog {
    pub fn image(name: &str, reference: &str) -> Self {
        Self {
            name: name.to_string(),
            source: CatalogSource {
                source_type: "Image".to_string(),
                image: Some(ImageSource { reference: reference.to_string(), poll_interval_minutes: None }),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnpackState {
    Pending,
    Unpacking,
    Unpacked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedImageSource {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub image: ResolvedImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpackResult {
    /// Root of the unpacked content.
    pub path: PathBuf,
    pub resolved_source: ResolvedSource,
    pub state: UnpackState,
    pub message: String,
    /// Whole seconds; status fields carry no finer precision.
    pub unpack_time: DateTime<Utc>,
    pub last_successful_poll_attempt: DateTime<Utc>,
}

#[async_trait]
pub trait Unpacker: Send + Sync {
    async fn unpack(&self, catalog: &Catalog) -> Result<UnpackResult, UnpackError>;
    async fn cleanup(&self, catalog: &Catalog) -> Result<(), UnpackError>;
}

#[derive(Debug, Clone)]
pub struct UnpackerConfig {
    pub base_cache_path: PathBuf,
    pub policy: PolicySource,
    /// Deadline for each registry round trip.
    pub pull_timeout: Duration,
    /// Parent for staging directories; the system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
}

impl UnpackerConfig {
    pub fn new(base_cache_path: impl Into<PathBuf>, policy: PolicySource) -> Self {
        Self { base_cache_path: base_cache_path.into(), policy, pull_timeout: Duration::from_secs(300), staging_dir: None }
    }
}

pub struct ImageUnpacker {
    config: UnpackerConfig,
    registry: Arc<dyn RegistryClient>,
}

fn truncate(t: impl Into<DateTime<Utc>>) -> DateTime<Utc> {
    t.into().trunc_subsecs(0)
}

impl ImageUnpacker {
    pub fn new(config: UnpackerConfig, registry: Arc<dyn RegistryClient>) -> Self {
        Self { config, registry }
    }

    /// Cache directory for a catalog. The name must be a DNS-1123 subdomain, which
    /// also keeps it a single path component below the cache root.
    pub fn catalog_path(&self, catalog_name: &str) -> Result<PathBuf, UnpackError> {
        let errs = dns1123_subdomain_errors(catalog_name);
        if !errs.is_empty() {
            return Err(UnpackError::InvalidCatalogName { name: catalog_name.to_string(), reason: errs.join("; ") });
        }
        Ok(self.config.base_cache_path.join(catalog_name))
    }

    fn unpack_path(&self, catalog_name: &str, digest: &str) -> Result<PathBuf, UnpackError> {
        Ok(self.catalog_path(catalog_name)?.join(digest))
    }

    /// Digest-pinned references are used as-is; tags are resolved through the registry.
    async fn resolve_canonical(&self, reference: &Reference) -> Result<(Reference, bool), UnpackError> {
        if reference.digest().is_some() {
            return Ok((reference.clone(), true));
        }
        let (_, digest) = pull_manifest(self.registry.as_ref(), reference, self.config.pull_timeout).await?;
        let canonical: Reference = format!("{}/{}@{}", reference.registry(), reference.repository(), digest)
            .parse()
            .map_err(|e| UnpackError::CanonicalReference(format!("{}", e)))?;
        Ok((canonical, false))
    }

    fn success_result(&self, unpack_path: PathBuf, canonical: &Reference, unpack_time: SystemTime) -> UnpackResult {
        UnpackResult {
            path: unpack_path,
            resolved_source: ResolvedSource {
                source_type: SourceType::Image,
                image: ResolvedImageSource { reference: canonical.whole() },
            },
            state: UnpackState::Unpacked,
            message: format!("unpacked {:?} successfully", canonical.whole()),
            unpack_time: truncate(unpack_time),
            last_successful_poll_attempt: truncate(Utc::now()),
        }
    }

    async fn pull_and_extract(&self, catalog_name: &str, canonical: &Reference, spec_is_canonical: bool, unpack_path: &Path) -> Result<(), UnpackError> {
        let policy = self.config.policy.load()?;
        policy.evaluate(canonical)?;

        let prefix = format!("oci-layout-{}", catalog_name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let staging = match &self.config.staging_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(|e| UnpackError::io("error creating temporary directory", e))?;

        let result = self.extract_via(staging.path(), catalog_name, canonical, spec_is_canonical, unpack_path).await;
        match (result, staging.close()) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(UnpackError::io("error removing temporary OCI layout directory", e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => Err(e.join(format!("error removing temporary OCI layout directory: {}", cleanup))),
        }
    }

    async fn extract_via(&self, staging: &Path, catalog_name: &str, canonical: &Reference, spec_is_canonical: bool, unpack_path: &Path) -> Result<(), UnpackError> {
        let layout = OciLayout::create(staging)?;
        let manifest = pull_into_layout(self.registry.as_ref(), canonical, &layout, self.config.pull_timeout).await?;
        debug!(catalog = %catalog_name, layers = manifest.layers.len(), "pulled image into staging layout");

        let config = layout.image_config(&manifest)?;
        let dir_to_unpack = match config.label(CONFIG_DIR_LABEL) {
            Some(dir) => dir.to_string(),
            None => return Err(UnpackError::MissingLabel { label: CONFIG_DIR_LABEL, spec_is_canonical }),
        };

        let catalog_dir = self.catalog_path(catalog_name)?;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(WRITABLE_MODE)
            .create(&catalog_dir)
            .map_err(|e| UnpackError::io("error creating catalog cache directory", e))?;
        let owner = std::fs::metadata(&catalog_dir).map_err(|e| UnpackError::io("error reading catalog cache directory", e))?;
        let filter = all_filters(vec![only_path(&dir_to_unpack), force_ownership_rwx(owner.uid() as u64, owner.gid() as u64)]);

        let dest = unpack_path.to_path_buf();
        tokio::task::spawn_blocking(move || apply_layers_to_disk(&dest, &layout, &manifest, &filter))
            .await
            .map_err(|e| UnpackError::io("error applying layers", std::io::Error::other(e)))?
    }

    fn delete_other_images(&self, catalog_name: &str, digest_to_keep: &str) -> Result<(), UnpackError> {
        let catalog_dir = self.catalog_path(catalog_name)?;
        let entries = std::fs::read_dir(&catalog_dir).map_err(|e| UnpackError::io("error reading image directories", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| UnpackError::io("error reading image directories", e))?;
            if entry.file_name().to_str() == Some(digest_to_keep) {
                continue;
            }
            fsutil::delete_read_only_recursive(&entry.path()).map_err(|e| UnpackError::fs("error deleting old images", e))?;
            info!(catalog = %catalog_name, path = %entry.path().display(), "deleted old image");
        }
        Ok(())
    }
}

#[async_trait]
impl Unpacker for ImageUnpacker {
    async fn unpack(&self, catalog: &Catalog) -> Result<UnpackResult, UnpackError> {
        self.catalog_path(&catalog.name)?;
        if catalog.source.source_type != "Image" {
            return Err(UnpackError::UnsupportedSource(catalog.source.source_type.clone()));
        }
        let image = catalog.source.image.as_ref().ok_or(UnpackError::MissingImageSource)?;
        let reference: Reference = image
            .reference
            .parse()
            .map_err(|e| UnpackError::InvalidReference { reference: image.reference.clone(), reason: format!("{}", e) })?;

        let started = Instant::now();
        let (canonical, spec_is_canonical) = self.resolve_canonical(&reference).await?;
        let digest = canonical.digest().ok_or_else(|| UnpackError::CanonicalReference(format!("{} has no digest", canonical.whole())))?.to_string();
        let unpack_path = self.unpack_path(&catalog.name, &digest)?;

        match fsutil::directory_mod_time(&unpack_path) {
            Ok(mtime) => {
                counter!("catalog_unpack_cache_hits_total", 1u64);
                debug!(catalog = %catalog.name, digest = %digest, "image already unpacked");
                return Ok(self.success_result(unpack_path, &canonical, mtime));
            }
            Err(FsError::NotDirectory { .. }) => {
                warn!(path = %unpack_path.display(), "unpack path is not a directory; removing");
                fsutil::delete_read_only_recursive(&unpack_path).map_err(|e| UnpackError::fs("error removing unpack path", e))?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(UnpackError::fs("error checking image content", e)),
        }

        info!(catalog = %catalog.name, reference = %canonical.whole(), "unpacking catalog image");
        if let Err(e) = self.pull_and_extract(&catalog.name, &canonical, spec_is_canonical, &unpack_path).await {
            counter!("catalog_unpack_errors_total", 1u64);
            return Err(e);
        }
        self.delete_other_images(&catalog.name, &digest)?;

        let mtime = fsutil::directory_mod_time(&unpack_path).map_err(|e| UnpackError::fs("error reading unpack directory", e))?;
        counter!("catalog_unpack_total", 1u64);
        histogram!("catalog_unpack_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(self.success_result(unpack_path, &canonical, mtime))
    }

    async fn cleanup(&self, catalog: &Catalog) -> Result<(), UnpackError> {
        let dir = self.catalog_path(&catalog.name)?;
        tokio::task::spawn_blocking(move || fsutil::delete_read_only_recursive(&dir))
            .await
            .map_err(|e| UnpackError::io("error cleaning up catalog cache", std::io::Error::other(e)))?
            .map_err(|e| UnpackError::fs("error deleting catalog cache", e))
    }
}
