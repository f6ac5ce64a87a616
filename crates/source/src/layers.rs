//! Applying image layers onto a directory.

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use flate2::read::GzDecoder;
use oci_distribution::manifest::OciImageManifest;
use tar::EntryType;
use tracing::{debug, info};

use crate::filter::{clean, EntryHeader, Filter};
use crate::fsutil::{self, WRITABLE_MODE};
use crate::layout::OciLayout;
use crate::UnpackError;

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Write every layer of `manifest` to `dest` through `filter`, then make `dest` read-only.
///
/// `dest` is emptied first. On failure the partially written directory is removed,
/// so a directory at `dest` always means a complete unpack.
pub fn apply_layers_to_disk(dest: &Path, layout: &OciLayout, manifest: &OciImageManifest, filter: &Filter) -> Result<(), UnpackError> {
    fsutil::ensure_empty_directory(dest, WRITABLE_MODE).map_err(|e| UnpackError::fs("error ensuring empty unpack directory", e))?;
    info!(path = %dest.display(), "unpacking image");
    for (i, layer) in manifest.layers.iter().enumerate() {
        let applied = layout.read_blob(&layer.digest).and_then(|blob| apply_layer(i, &blob, dest, filter));
        if let Err(e) = applied {
            return Err(match fsutil::delete_read_only_recursive(dest) {
                Ok(()) => e,
                Err(cleanup) => e.join(cleanup),
            });
        }
        debug!(layer = i, digest = %layer.digest, "applied layer");
    }
    fsutil::set_read_only_recursive(dest).map_err(|e| UnpackError::fs("error making unpack directory read-only", e))
}

fn apply_layer(index: usize, blob: &[u8], dest: &Path, filter: &Filter) -> Result<(), UnpackError> {
    match blob {
        [0x1f, 0x8b, ..] => apply_tar(index, GzDecoder::new(blob), dest, filter),
        [0x28, 0xb5, 0x2f, 0xfd, ..] => Err(UnpackError::UnsupportedLayer { index, reason: "zstd".to_string() }),
        _ => apply_tar(index, blob, dest, filter),
    }
}

fn layer_io(index: usize, e: io::Error) -> UnpackError {
    UnpackError::io(format!("error applying layer[{}]", index), e)
}

fn apply_tar<R: Read>(index: usize, reader: R, dest: &Path, filter: &Filter) -> Result<(), UnpackError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);
    for entry in archive.entries().map_err(|e| layer_io(index, e))? {
        let mut entry = entry.map_err(|e| layer_io(index, e))?;
        let mut header = {
            let h = entry.header();
            EntryHeader {
                path: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                mode: h.mode().map_err(|e| layer_io(index, e))?,
                uid: h.uid().map_err(|e| layer_io(index, e))?,
                gid: h.gid().map_err(|e| layer_io(index, e))?,
            }
        };
        if !filter(&mut header)? {
            continue;
        }
        let rel = clean(header.path.trim_start_matches('/'));
        if rel == "." || rel == ".." || rel.starts_with("../") {
            continue;
        }
        let rel = Path::new(&rel);
        let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let parent = dest.join(rel.parent().unwrap_or_else(|| Path::new("")));
        if name == WHITEOUT_OPAQUE {
            if parent.is_dir() {
                for child in fs::read_dir(&parent).map_err(|e| layer_io(index, e))? {
                    let child = child.map_err(|e| layer_io(index, e))?;
                    fsutil::delete_read_only_recursive(&child.path()).map_err(|e| UnpackError::fs("error applying opaque whiteout", e))?;
                }
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            if matches!(hidden, "" | "." | "..") || hidden.contains('/') {
                debug!(layer = index, path = %header.path, "ignoring whiteout that names no sibling");
                continue;
            }
            fsutil::delete_read_only_recursive(&parent.join(hidden)).map_err(|e| UnpackError::fs("error applying whiteout", e))?;
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            EntryType::Symlink | EntryType::Link => {
                debug!(layer = index, path = %header.path, "skipping link");
                continue;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                return Err(UnpackError::SpecialFile { index, path: header.path });
            }
            other => {
                debug!(layer = index, path = %header.path, entry_type = ?other, "skipping unsupported entry");
                continue;
            }
        }
        if !entry.unpack_in(dest).map_err(|e| layer_io(index, e))? {
            continue;
        }
        let target = dest.join(rel);
        fs::set_permissions(&target, fs::Permissions::from_mode(header.mode & 0o7777)).map_err(|e| layer_io(index, e))?;
    }
    Ok(())
}
