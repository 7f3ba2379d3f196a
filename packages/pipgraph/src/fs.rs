//! Filesystem operations tailored to the engine core.
//!
//! All filesystem access funnels through this module. Inside it we refer
//! to `std::fs` or `tokio::fs` by fully qualified path to make it
//! maximally clear what we are using; outside it, nothing touches the
//! filesystem directly.
//!
//! Content hashing of large files runs on the blocking pool; everything
//! else uses `tokio::fs` directly.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use tap::TapFallible;
use tokio::{io::AsyncWriteExt, task::spawn_blocking};
use tracing::{instrument, trace};

use crate::hash::ContentHash;

/// The default level of concurrency for parallel file operations
/// (verification hashing, bundle table writes, sideband checks).
pub const DEFAULT_CONCURRENCY: usize = 10;

/// The kind of a directory member, as recorded in membership fingerprints.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum MemberKind {
    File,
    Directory,
    Other,
}

impl MemberKind {
    /// Stable single-byte tag used in membership fingerprints.
    pub const fn tag(self) -> u8 {
        match self {
            MemberKind::File => b'f',
            MemberKind::Directory => b'd',
            MemberKind::Other => b'o',
        }
    }
}

/// One member of a directory listing.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DirMember {
    pub name: String,
    pub kind: MemberKind,
}

/// Read the full contents of a file.
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read file: {path:?}")),
    }
}

/// Read the full contents of a file, erroring if it does not exist.
#[instrument]
pub async fn must_read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Read the full contents of a file as UTF-8.
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_utf8(path: &Path) -> Result<Option<String>> {
    match read(path).await? {
        Some(bytes) => String::from_utf8(bytes)
            .with_context(|| format!("file is not UTF-8: {path:?}"))
            .map(Some),
        None => Ok(None),
    }
}

/// Write the buffer to the file, creating parent directories as needed.
#[instrument(skip(content))]
pub async fn write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent dirs: {parent:?}"))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create file: {path:?}"))?;
    file.write_all(content)
        .await
        .with_context(|| format!("write file: {path:?}"))?;
    file.flush().await.with_context(|| format!("flush: {path:?}"))?;
    trace!(?path, bytes = content.len(), "wrote file");
    Ok(())
}

/// Write the buffer to a sibling temporary name, then rename over the
/// target. Readers never observe a partially written file.
#[instrument(skip(content))]
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = sibling_with_suffix(path, ".tmp");
    write(&tmp, content).await?;
    rename(&tmp, path).await
}

/// Rename `src` to `dst`.
#[instrument]
pub async fn rename(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename {src:?} to {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "renamed"))
}

/// Remove a file if it exists. Returns whether anything was removed.
#[instrument]
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove file: {path:?}")),
    }
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
}

/// Report whether anything exists at the path.
pub async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Report whether a file exists at the path.
pub async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Report whether a directory exists at the path.
pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Hash the contents of the file at the path.
/// Returns `None` if the file does not exist.
///
/// Hashing streams the file on the blocking pool rather than loading it
/// into memory; spec and config files are small but engine deployment
/// binaries are not.
#[instrument]
pub async fn hash_file(path: &Path) -> Result<Option<ContentHash>> {
    let path = path.to_owned();
    spawn_blocking(move || hash_file_sync(&path))
        .await
        .context("join task")?
}

fn hash_file_sync(path: &Path) -> Result<Option<ContentHash>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("open file: {path:?}")),
    };

    let mut reader = std::io::BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let bytes = std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("hash file: {path:?}"))?;

    let hash = ContentHash::from_bytes(*hasher.finalize().as_bytes());
    trace!(?path, %hash, bytes, "hashed file");
    Ok(Some(hash))
}

/// Hash the contents of the file at the path, erroring if it does not exist.
#[instrument]
pub async fn must_hash_file(path: &Path) -> Result<ContentHash> {
    hash_file(path)
        .await?
        .ok_or_eyre(format!("file does not exist: {path:?}"))
}

/// List the immediate members of a directory.
/// Returns `None` if the directory does not exist.
///
/// Order is whatever the OS yields; callers that fingerprint memberships
/// sort case-insensitively first.
#[instrument]
pub async fn list_dir(dir: &Path) -> Result<Option<Vec<DirMember>>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("list dir: {dir:?}")),
    };

    let mut members = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read dir entry in {dir:?}"))?
    {
        let kind = match entry.file_type().await {
            Ok(ty) if ty.is_dir() => MemberKind::Directory,
            Ok(ty) if ty.is_file() => MemberKind::File,
            Ok(_) => MemberKind::Other,
            Err(err) => {
                return Err(err).with_context(|| format!("stat member: {:?}", entry.path()));
            }
        };
        members.push(DirMember {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
        });
    }
    Ok(Some(members))
}

/// Realize `src` at `dst` by hard link where the filesystem allows it,
/// falling back to a copy.
#[instrument]
pub async fn hard_link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await?;
    }
    remove_file_if_exists(dst).await?;
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => {
            trace!(?src, ?dst, "hard linked");
            Ok(())
        }
        Err(err) => {
            trace!(?err, ?src, ?dst, "hard link failed, copying");
            tokio::fs::copy(src, dst)
                .await
                .with_context(|| format!("copy {src:?} to {dst:?}"))
                .map(|_| ())
        }
    }
}

/// Derive a sibling path by appending a suffix to the file name.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
