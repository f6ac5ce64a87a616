//! Registry access seam. Production pulls go through `oci-distribution`.

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};

use crate::UnpackError;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the manifest `reference` points at, with the digest of that manifest.
    async fn pull_manifest(&self, reference: &Reference) -> Result<(OciManifest, String), UnpackError>;

    /// Fetch the blob described by `descriptor` from the repository of `reference`.
    async fn pull_blob(&self, reference: &Reference, descriptor: &OciDescriptor) -> Result<Vec<u8>, UnpackError>;
}

pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    /// Anonymous client.
    pub fn new(protocol: ClientProtocol) -> Self {
        Self {
            client: Client::new(ClientConfig { protocol, ..Default::default() }),
            auth: RegistryAuth::Anonymous,
        }
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = RegistryAuth::Basic(username.to_string(), password.to_string());
        self
    }
}

impl Default for OciRegistry {
    fn default() -> Self { Self::new(ClientProtocol::Https) }
}

fn registry_error(reference: &Reference, e: impl std::fmt::Display) -> UnpackError {
    UnpackError::Registry { reference: reference.whole(), reason: e.to_string() }
}

#[async_trait]
impl RegistryClient for OciRegistry {
    async fn pull_manifest(&self, reference: &Reference) -> Result<(OciManifest, String), UnpackError> {
        self.client.pull_manifest(reference, &self.auth).await.map_err(|e| registry_error(reference, e))
    }

    async fn pull_blob(&self, reference: &Reference, descriptor: &OciDescriptor) -> Result<Vec<u8>, UnpackError> {
        let mut data = Vec::new();
        self.client
            .pull_blob(reference, descriptor, &mut data)
            .await
            .map_err(|e| registry_error(reference, e))?;
        Ok(data)
    }
}

/// `os/arch` of the running process in OCI platform terms.
pub(crate) fn current_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        _ => "amd64",
    };
    ("linux", arch)
}
