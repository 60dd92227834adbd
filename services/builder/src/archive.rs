//! `docker save` compatible image archives.
//!
//! Layout:
//! - `manifest.json`: `[{"Config", "RepoTags", "Layers"}]`
//! - `<config-hex>.json`: the image config
//! - `<layer-hex>.tar.gz`: one compressed blob per layer

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tar::{EntryType, Header};
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

use crate::layer::{BlobStore, REPRODUCIBLE_MTIME};
use crate::manifest::AssembledImage;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry<'a> {
    config: String,
    repo_tags: &'a [String],
    layers: Vec<String>,
}

fn hex_part(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Write a `docker save` archive of `image` into `out`.
pub fn write_docker_archive<W: Write>(
    image: &AssembledImage,
    repo_tags: &[String],
    store: &BlobStore,
    out: W,
) -> io::Result<W> {
    let config_name = format!("{}.json", hex_part(&image.config_digest));
    let layer_names: Vec<String> = image
        .layers()
        .iter()
        .map(|layer| format!("{}.tar.gz", hex_part(&layer.digest)))
        .collect();

    let manifest = serde_json::to_vec(&[ArchiveManifestEntry {
        config: config_name.clone(),
        repo_tags,
        layers: layer_names.clone(),
    }])?;

    let mut builder = tar::Builder::new(out);
    append_bytes(&mut builder, "manifest.json", &manifest)?;
    append_bytes(&mut builder, &config_name, &image.config_bytes)?;

    let mut written = Vec::with_capacity(layer_names.len());
    for (layer, name) in image.layers().iter().zip(&layer_names) {
        if written.contains(name) {
            continue;
        }
        let mut file = File::open(store.blob_path(&layer.digest)).map_err(|e| {
            io::Error::new(e.kind(), format!("layer blob {} unavailable: {e}", layer.digest))
        })?;
        let mut header = header_for(file.metadata()?.len());
        builder.append_data(&mut header, name, &mut file)?;
        written.push(name.clone());
    }

    builder.into_inner()
}

/// Bytes buffered between the archive writer and its reader.
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Stream a `docker save` archive through an in-process pipe.
///
/// The archive is written on a blocking thread as the returned reader is
/// consumed, so at most [`PIPE_CAPACITY`] bytes are held in memory. The join
/// handle reports write errors; dropping the reader ends the writer with
/// `BrokenPipe`.
///
/// Must be called from within a Tokio runtime.
pub fn stream_docker_archive(
    image: AssembledImage,
    repo_tags: Vec<String>,
    store: BlobStore,
) -> (DuplexStream, JoinHandle<io::Result<()>>) {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let handle = Handle::current();

    let task = tokio::task::spawn_blocking(move || {
        let out = BlockingWriter {
            inner: writer,
            handle,
        };
        write_docker_archive(&image, &repo_tags, &store, out)?.shutdown()
    });

    (reader, task)
}

/// Synchronous `Write` over an async writer. Only for blocking-pool threads.
struct BlockingWriter<W> {
    inner: W,
    handle: Handle,
}

impl<W: AsyncWrite + Unpin> BlockingWriter<W> {
    fn shutdown(mut self) -> io::Result<()> {
        self.handle.block_on(self.inner.shutdown())
    }
}

impl<W: AsyncWrite + Unpin> Write for BlockingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle.block_on(self.inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.block_on(self.inner.flush())
    }
}

fn header_for(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(REPRODUCIBLE_MTIME);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(size);
    header
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> io::Result<()> {
    let mut header = header_for(bytes.len() as u64);
    builder.append_data(&mut header, name, bytes)
}

/// Writes archives to a file path.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    output: PathBuf,
}

impl ArchiveWriter {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Write the archive to a temporary sibling file and rename it into place.
    pub async fn write(
        &self,
        image: &AssembledImage,
        repo_tags: &[String],
        store: &BlobStore,
    ) -> io::Result<u64> {
        let image = image.clone();
        let repo_tags = repo_tags.to_vec();
        let store = store.clone();
        let output = self.output.clone();

        let size = tokio::task::spawn_blocking(move || {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }

            let temp_path = output.with_extension("tar.tmp");
            let result = File::create(&temp_path)
                .and_then(|file| write_docker_archive(&image, &repo_tags, &store, file))
                .and_then(|mut file| {
                    file.flush()?;
                    file.sync_all()?;
                    Ok(file.metadata()?.len())
                })
                .and_then(|size| fs::rename(&temp_path, &output).map(|()| size));

            if result.is_err() {
                fs::remove_file(&temp_path).ok();
            }
            result
        })
        .await
        .map_err(io::Error::other)??;

        info!(output = %self.output.display(), size = size, "Archive written");

        Ok(size)
    }
}
