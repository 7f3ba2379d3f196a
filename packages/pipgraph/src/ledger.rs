//! The invocation ledger: an append-only, tab-separated record of
//! recent builds for tooling.
//!
//! The ledger lives at a well-known per-user location and is shared by
//! every engine process for that user, so appends are guarded by a
//! cross-process lock. Each line starts with an integer version; readers
//! skip lines whose version they don't know, which keeps old tools
//! working against new engines. Retention is bounded: once capacity is
//! reached the oldest entries fall off.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use itertools::Itertools;
use jiff::Timestamp;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use crate::fs;

/// Record format version written by this engine.
const LEDGER_VERSION: u32 = 0;

/// Maximum entries retained.
const LEDGER_CAPACITY: usize = 256;

/// Ledger file name.
pub const LEDGER_FILE_NAME: &str = "builds.tsv";

/// One build's entry in the ledger.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InvocationRecord {
    pub session_id: Uuid,
    pub start_time: Timestamp,
    pub primary_config_file: PathBuf,
    pub logs_folder: PathBuf,
    pub engine_version: String,
    pub engine_bin_folder: PathBuf,
    pub engine_commit_id: Option<String>,
}

impl InvocationRecord {
    fn to_line(&self) -> String {
        [
            LEDGER_VERSION.to_string(),
            self.session_id.to_string(),
            self.start_time.to_string(),
            self.primary_config_file.to_string_lossy().into_owned(),
            self.logs_folder.to_string_lossy().into_owned(),
            self.engine_version.clone(),
            self.engine_bin_folder.to_string_lossy().into_owned(),
            self.engine_commit_id.clone().unwrap_or_default(),
        ]
        .join("\t")
    }

    /// Parse a version-0 line. `None` for unknown versions or malformed
    /// lines; the reader is forward-compatible.
    fn parse(line: &str) -> Option<InvocationRecord> {
        let mut fields = line.split('\t');
        let version: u32 = fields.next()?.parse().ok()?;
        if version != LEDGER_VERSION {
            return None;
        }
        let session_id = fields.next()?.parse().ok()?;
        let start_time = fields.next()?.parse().ok()?;
        let primary_config_file = PathBuf::from(fields.next()?);
        let logs_folder = PathBuf::from(fields.next()?);
        let engine_version = fields.next()?.to_owned();
        let engine_bin_folder = PathBuf::from(fields.next()?);
        let engine_commit_id = match fields.next()? {
            "" => None,
            commit => Some(commit.to_owned()),
        };
        Some(InvocationRecord {
            session_id,
            start_time,
            primary_config_file,
            logs_folder,
            engine_version,
            engine_bin_folder,
            engine_commit_id,
        })
    }
}

/// Handle to the per-user ledger file.
#[derive(Clone, Debug)]
pub struct InvocationLedger {
    path: PathBuf,
}

impl InvocationLedger {
    /// Open the ledger at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The conventional per-user location.
    pub fn default_for_user() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .ok_or_eyre("cannot determine the user's home directory")?;
        Ok(Self::at(
            PathBuf::from(home).join(".pipgraph").join(LEDGER_FILE_NAME),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, enforcing bounded retention.
    ///
    /// The whole read-modify-write runs under a cross-process lock so
    /// concurrent builds interleave cleanly.
    #[instrument(skip(self, record))]
    pub async fn append(&self, record: &InvocationRecord) -> Result<()> {
        let line = record.to_line();
        let path = self.path.clone();
        let _guard = self.lock().await?;

        let existing = fs::read_utf8(&path).await?.unwrap_or_default();
        let mut lines: Vec<&str> = existing.lines().filter(|l| !l.is_empty()).collect();
        lines.push(&line);
        if lines.len() > LEDGER_CAPACITY {
            let drop_count = lines.len() - LEDGER_CAPACITY;
            lines.drain(..drop_count);
        }

        let content = lines.iter().join("\n") + "\n";
        fs::write_atomic(&path, content.as_bytes()).await?;
        trace!(?path, entries = lines.len(), "appended ledger entry");
        Ok(())
    }

    /// Read all parseable entries, oldest first. Unknown-version lines
    /// are skipped.
    #[instrument(skip(self))]
    pub async fn read_entries(&self) -> Result<Vec<InvocationRecord>> {
        let Some(content) = fs::read_utf8(&self.path).await? else {
            return Ok(Vec::new());
        };
        let mut skipped = 0usize;
        let entries = content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let parsed = InvocationRecord::parse(line);
                if parsed.is_none() {
                    skipped += 1;
                }
                parsed
            })
            .collect();
        if skipped > 0 {
            trace!(skipped, "skipped unparseable ledger lines");
        }
        Ok(entries)
    }

    /// Cross-process lock guarding the ledger file.
    async fn lock(&self) -> Result<fslock::LockFile> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let lock_path = fs::sibling_with_suffix(&self.path, ".lock");
        spawn_blocking(move || -> Result<fslock::LockFile> {
            let mut lock = fslock::LockFile::open(&lock_path)
                .with_context(|| format!("open ledger lock: {lock_path:?}"))?;
            lock.lock().context("lock ledger")?;
            Ok(lock)
        })
        .await
        .context("join task")?
        .inspect_err(|err| warn!(?err, "ledger lock failed"))
    }
}
