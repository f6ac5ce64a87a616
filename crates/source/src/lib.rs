//! Keel catalog sources: pull catalog images and keep one unpacked copy per digest.

#![forbid(unsafe_code)]

mod error;
pub mod filter;
pub mod fsutil;
pub mod layers;
pub mod layout;
pub mod policy;
pub mod registry;
pub mod unpacker;

pub use error::UnpackError;
pub use policy::{Policy, PolicyError, PolicySource};
pub use registry::{OciRegistry, RegistryClient};
pub use unpacker::{Catalog, CatalogSource, ImageSource, ImageUnpacker, UnpackResult, UnpackState, Unpacker, UnpackerConfig};

pub use oci_distribution::client::ClientProtocol;
pub use oci_distribution::Reference;
