//! Keel renderer: turns a registry+v1 bundle into the objects that install it.

#![forbid(unsafe_code)]

pub mod certs;
mod error;
pub mod generators;
pub mod mutators;
pub mod options;
pub mod renderer;
pub mod resources;

pub use certs::{CertManagerCertificateProvider, CertSecretInfo, CertificateProvider, CertificateProvisioningConfig};
pub use error::RenderError;
pub use options::{resolve_install_mode, InstallModeError, RenderOption, RenderOptions, UniqueNameGenerator};
pub use renderer::{convert, default_install_namespace, BundleRenderer};
