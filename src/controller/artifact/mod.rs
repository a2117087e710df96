//! # Artifact Fetching
//!
//! Downloads a gzip-compressed tar archive from the resolved artifact URL
//! and extracts it into a destination directory, entry by entry. Extraction
//! is restrictive: absolute entry paths and `..` traversal are rejected
//! before anything is written, only directory and regular-file entries are
//! accepted, and when a sub-path is configured only entries below it are
//! materialized. Regular files pass through the decryptor (if any) exactly
//! once, during extraction.

use crate::controller::decrypt::Decryptor;
use crate::controller::error::ReconcileError;
use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};

/// Download the archive at `url` and extract it below `dest`, decrypting
/// regular files within the retained subtree.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    sub_path: Option<&str>,
    decryptor: Option<Box<dyn Decryptor>>,
    dest: &Path,
) -> Result<(), ReconcileError> {
    let span = info_span!("artifact.fetch", artifact.url = url);
    async move {
        let staging = tempfile::NamedTempFile::new()
            .context("failed to create download staging file")
            .map_err(ReconcileError::Fatal)?;
        let archive_path = staging.path().to_path_buf();

        download(client, url, &archive_path)
            .await
            .map_err(ReconcileError::Fatal)?;

        let dest = dest.to_path_buf();
        let sub_path = sub_path.map(PathBuf::from);
        // extraction and decryption are blocking work
        tokio::task::spawn_blocking(move || {
            extract_archive(&archive_path, &dest, sub_path.as_deref(), decryptor.as_deref())
        })
        .await
        .map_err(|e| ReconcileError::Fatal(anyhow!("archive extraction task failed: {e}")))?
        .map_err(ReconcileError::Fatal)?;

        Ok(())
    }
    .instrument(span)
    .await
}

/// Stream the archive to `target`, verifying size and gzip magic bytes.
async fn download(client: &reqwest::Client, url: &str, target: &Path) -> Result<()> {
    info!("downloading artifact from {}", url);

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to download artifact from {url}"))?;
    if !response.status().is_success() {
        bail!(
            "artifact download failed: HTTP {} from {}",
            response.status(),
            url
        );
    }

    let expected_size = response.content_length();
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("failed to create staging file {}", target.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("failed to read chunk from download stream")?;
        downloaded += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .context("failed to write chunk to staging file")?;
    }
    file.flush().await.context("failed to flush staging file")?;
    drop(file);

    if let Some(expected) = expected_size {
        if downloaded != expected {
            bail!("partial download: expected {expected} bytes, got {downloaded}");
        }
    }
    if downloaded == 0 {
        bail!("downloaded artifact is empty");
    }

    let mut magic = [0u8; 2];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(target).context("failed to reopen staging file")?;
        file.read_exact(&mut magic)
            .context("downloaded artifact is too short to be a gzip stream")?;
    }
    if magic != [0x1f, 0x8b] {
        bail!(
            "invalid artifact format: expected gzip, got magic bytes {:02x}{:02x}",
            magic[0],
            magic[1]
        );
    }

    debug!("downloaded {} bytes from {}", downloaded, url);
    Ok(())
}

/// Extract the gzip'ed tar archive at `archive` into `dest`.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    sub_path: Option<&Path>,
    decryptor: Option<&dyn Decryptor>,
) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create destination {}", dest.display()))?;

    for entry in archive.entries().context("failed to read archive entries")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let raw_path = entry
            .path()
            .context("archive entry has unreadable path")?
            .into_owned();
        if raw_path == Path::new(".") || raw_path == Path::new("./") {
            continue;
        }

        let rel_path = sanitize_entry_path(&raw_path)?;
        if let Some(sub_path) = sub_path {
            if !rel_path.starts_with(sub_path) {
                continue;
            }
        }
        let full_path = dest.join(&rel_path);

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&full_path)
                    .with_context(|| format!("failed to create directory {}", full_path.display()))?;
            }
            EntryType::Regular => {
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create parent directory {}", parent.display())
                    })?;
                }
                // size comes from the untrusted header; let the copy grow
                // the buffer instead of preallocating a forged claim
                let mut data = Vec::new();
                std::io::copy(&mut entry, &mut data)
                    .with_context(|| format!("failed to read archive entry {}", rel_path.display()))?;
                if let Some(decryptor) = decryptor {
                    data = decryptor.decrypt(&data, &rel_path)?;
                }
                std::fs::write(&full_path, &data)
                    .with_context(|| format!("failed to write {}", full_path.display()))?;
            }
            other => bail!(
                "unsupported tar entry type {:?} for {}",
                other,
                rel_path.display()
            ),
        }
    }

    Ok(())
}

/// Reject absolute paths and any `..` traversal before anything touches the
/// filesystem.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        bail!(
            "archive must not contain entries with absolute paths ({})",
            path.display()
        );
    }
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => bail!(
                "archive must not contain entries with parent path segments ({})",
                path.display()
            ),
            Component::RootDir | Component::Prefix(_) => bail!(
                "archive must not contain entries with absolute paths ({})",
                path.display()
            ),
        }
    }
    Ok(clean)
}
