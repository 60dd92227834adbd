//! Reproducible layer tarballs.
//!
//! Entries are sorted by path, parent directories are synthesized, and
//! every header carries the same owner and timestamp, so the same
//! entries always produce the same bytes.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path};

use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};
use tracing::debug;

use super::cache::{BlobStore, CachedLayer};
use super::sha256_digest;
use crate::context::{EntrySource, LayerEntry, LayerSource};

/// Modification time stamped on every entry (one second past the epoch).
pub const REPRODUCIBLE_MTIME: u64 = 1;

const DIRECTORY_MODE: u32 = 0o755;

enum Item<'a> {
    Directory,
    File(&'a LayerEntry),
}

/// Content key for a layer source.
///
/// Hashes each entry's target path, mode and content digest in path order,
/// so the key depends on what the layer contains, not how it was listed.
pub fn content_key(source: &LayerSource) -> io::Result<String> {
    let mut entries: Vec<&LayerEntry> = source.entries.iter().collect();
    entries.sort_by(|a, b| a.target.cmp(&b.target));

    let mut hasher = Sha256::new();
    for entry in entries {
        let content = read_entry(entry)?;
        hasher.update(entry.target.as_bytes());
        hasher.update([0]);
        hasher.update(entry.mode.to_be_bytes());
        hasher.update(Sha256::digest(&content));
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Write the uncompressed tar for `entries` into `out`.
pub fn write_layer_tar<W: Write>(entries: &[LayerEntry], out: W) -> io::Result<W> {
    let mut items: BTreeMap<String, Item<'_>> = BTreeMap::new();

    for entry in entries {
        let path = relative_target(&entry.target)?;

        let mut parent = Path::new(&path).parent();
        while let Some(dir) = parent.filter(|d| !d.as_os_str().is_empty()) {
            items
                .entry(format!("{}/", dir.display()))
                .or_insert(Item::Directory);
            parent = dir.parent();
        }

        if items.insert(path.clone(), Item::File(entry)).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("duplicate layer entry '{}'", entry.target),
            ));
        }
    }

    let mut builder = tar::Builder::new(out);
    for (path, item) in &items {
        let mut header = Header::new_gnu();
        header.set_mtime(REPRODUCIBLE_MTIME);
        header.set_uid(0);
        header.set_gid(0);

        match item {
            Item::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(DIRECTORY_MODE);
                header.set_size(0);
                builder.append_data(&mut header, path, io::empty())?;
            }
            Item::File(entry) => {
                let content = read_entry(entry)?;
                header.set_entry_type(EntryType::Regular);
                header.set_mode(entry.mode);
                header.set_size(content.len() as u64);
                builder.append_data(&mut header, path, content.as_slice())?;
            }
        }
    }

    builder.into_inner()
}

/// Build the compressed layer blob for `source` and store it.
pub fn build_layer(source: &LayerSource, store: &BlobStore) -> io::Result<CachedLayer> {
    let tar_bytes = write_layer_tar(&source.entries, Vec::new())?;
    let diff_id = sha256_digest(&tar_bytes);

    let mut encoder: GzEncoder<Vec<u8>> = GzBuilder::new().write(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    let compressed = encoder.finish()?;

    let digest = sha256_digest(&compressed);
    store.write(&digest, &compressed)?;

    debug!(
        layer = %source.name,
        digest = %digest,
        diff_id = %diff_id,
        size = compressed.len(),
        "Layer built"
    );

    Ok(CachedLayer {
        digest,
        diff_id,
        size: compressed.len() as u64,
    })
}

fn read_entry(entry: &LayerEntry) -> io::Result<Vec<u8>> {
    match &entry.source {
        EntrySource::Bytes(data) => Ok(data.clone()),
        EntrySource::File(path) => fs::read(path).map_err(|e| {
            io::Error::new(e.kind(), format!("failed to read {}: {e}", path.display()))
        }),
    }
}

/// Strip the leading '/' from an absolute container path, rejecting traversal.
fn relative_target(target: &str) -> io::Result<String> {
    let invalid = |reason: &str| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid layer target '{target}': {reason}"),
        )
    };

    let path = Path::new(target);
    if !path.is_absolute() {
        return Err(invalid("must be absolute"));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(invalid("must not contain '..'"));
    }

    let relative = target.trim_start_matches('/');
    if relative.is_empty() || relative.ends_with('/') {
        return Err(invalid("must name a file"));
    }

    Ok(relative.to_string())
}
