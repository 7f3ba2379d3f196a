//! Filesystem change-journal integration.
//!
//! When the host filesystem exposes a change journal, verification can
//! skip per-file hashing entirely: a journal scan over the recorded
//! volume set either attests "no changes" or yields the set of
//! possibly-changed paths to re-check. The journal's save state is
//! correlated to the input-tracker record through an atomic save token
//! embedded in both; a token mismatch means the checkpoint describes
//! some other record, and the tracker must start fresh.

use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};

use color_eyre::{Result, eyre::Context};
use tap::Pipe;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    fs,
    wire::{WireReader, WireWriter},
};

const CHECKPOINT_MAGIC: u32 = 0x4A43_4B50; // "JCKP"

/// Operating state of the change-journal tracker.
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::Display)]
pub enum TrackerMode {
    /// Journal available and recording identities for this invocation.
    Tracking,
    /// No journal on this host (or explicitly turned off).
    Disabled,
    /// A tracker was deserialized from a previous run but is not
    /// recording; it must be reconciled against the input tracker's save
    /// token before use.
    LoadedNotTracking,
}

/// Paths the journal reports as possibly changed since the checkpoint.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PossiblyChanged {
    /// Case-folded absolute paths of possibly-changed files.
    pub files: BTreeSet<String>,
    /// Case-folded absolute paths of possibly-changed directories.
    pub directories: BTreeSet<String>,
    /// Whether the sets are exhaustive. A scan that hit its time limit
    /// reports `false`, and the verifier treats everything as suspect.
    pub complete: bool,
}

/// Result of scanning the journal from a checkpoint.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ScanOutcome {
    /// Nothing under the tracked volumes changed; inputs are attested
    /// without any file reads.
    NoChanges,
    /// Some paths possibly changed; re-verify just those.
    Changed(PossiblyChanged),
    /// The journal could not answer (wrapped records, time limit, read
    /// error). Verification falls back to full hashing.
    Unavailable,
}

/// Capability interface over a host filesystem's change journal.
///
/// Implementations are OS-specific and injected by the embedding binary;
/// the core ships only the disabled implementation. Scans are bounded by
/// the caller-provided time limit and must degrade to
/// [`ScanOutcome::Unavailable`] rather than block past it.
pub trait ChangeJournal: Send + Sync {
    /// The journal's current position, recorded into checkpoints.
    fn cursor(&self) -> u64;

    /// Record a path's identity so later scans cover it.
    fn track_path(&self, path: &Path);

    /// Scan from `since_cursor` to the current position.
    fn scan(&self, since_cursor: u64, time_limit: Option<Duration>) -> Result<ScanOutcome>;
}

/// The always-unavailable journal used when the host has none.
#[derive(Debug, Default)]
pub struct DisabledJournal;

impl ChangeJournal for DisabledJournal {
    fn cursor(&self) -> u64 {
        0
    }

    fn track_path(&self, _path: &Path) {}

    fn scan(&self, _since_cursor: u64, _time_limit: Option<Duration>) -> Result<ScanOutcome> {
        Ok(ScanOutcome::Unavailable)
    }
}

/// The tracker pairing a journal with the atomic save token that ties its
/// checkpoints to an input-tracker record.
#[derive(Clone)]
pub struct ChangeJournalTracker {
    mode: TrackerMode,
    save_token: Uuid,
    journal: Option<Arc<dyn ChangeJournal>>,
}

impl std::fmt::Debug for ChangeJournalTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeJournalTracker")
            .field("mode", &self.mode)
            .field("save_token", &self.save_token)
            .field("journal", &self.journal.as_ref().map(|_| "<journal>"))
            .finish()
    }
}

impl ChangeJournalTracker {
    /// A tracker with no journal at all.
    pub fn disabled() -> Self {
        Self {
            mode: TrackerMode::Disabled,
            save_token: Uuid::nil(),
            journal: None,
        }
    }

    /// A live tracker recording under a fresh save token.
    pub fn tracking(journal: Arc<dyn ChangeJournal>) -> Self {
        Self {
            mode: TrackerMode::Tracking,
            save_token: Uuid::new_v4(),
            journal: Some(journal),
        }
    }

    /// A tracker reconstructed from a checkpoint written by a previous
    /// invocation. Not yet recording.
    pub fn loaded(journal: Arc<dyn ChangeJournal>, save_token: Uuid) -> Self {
        Self {
            mode: TrackerMode::LoadedNotTracking,
            save_token,
            journal: Some(journal),
        }
    }

    pub fn mode(&self) -> TrackerMode {
        self.mode
    }

    pub fn save_token(&self) -> Uuid {
        self.save_token
    }

    /// Whether a scan may stand in for file verification against a record
    /// saved under `record_token`.
    pub fn can_attest(&self, record_token: Uuid) -> bool {
        matches!(self.mode, TrackerMode::Tracking | TrackerMode::LoadedNotTracking)
            && self.journal.is_some()
            && self.save_token == record_token
    }

    /// Reconcile against the token read from an input-tracker record.
    /// A mismatch forces a fresh tracker: the old checkpoint describes
    /// some other record and cannot attest anything.
    pub fn reconcile(self, record_token: Uuid) -> Self {
        if self.save_token == record_token {
            return self;
        }
        debug!(
            loaded = %self.save_token,
            record = %record_token,
            "journal save token mismatch; starting a fresh tracker"
        );
        match self.journal {
            Some(journal) => Self::tracking(journal),
            None => Self::disabled(),
        }
    }

    /// Begin recording under a new save token for the current invocation.
    pub fn start_fresh(self) -> Self {
        match self.journal {
            Some(journal) => Self::tracking(journal),
            None => Self::disabled(),
        }
    }

    /// Record a path's identity, when tracking.
    pub fn track_path(&self, path: &Path) {
        if self.mode == TrackerMode::Tracking {
            if let Some(journal) = &self.journal {
                journal.track_path(path);
            }
        }
    }

    /// The journal's current cursor, for checkpointing.
    pub fn cursor(&self) -> u64 {
        self.journal.as_ref().map(|j| j.cursor()).unwrap_or(0)
    }

    /// Scan from a checkpoint cursor. Errors downgrade to
    /// [`ScanOutcome::Unavailable`]; a failed scan must never fail the
    /// build.
    #[instrument(skip(self))]
    pub fn scan(&self, since_cursor: u64, time_limit: Option<Duration>) -> ScanOutcome {
        let Some(journal) = &self.journal else {
            return ScanOutcome::Unavailable;
        };
        match journal.scan(since_cursor, time_limit) {
            Ok(outcome) => {
                trace!(?outcome, "journal scan complete");
                outcome
            }
            Err(err) => {
                warn!(?err, "journal scan failed; treating as unavailable");
                ScanOutcome::Unavailable
            }
        }
    }
}

/// A persisted journal position correlated to an input-tracker record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct JournalCheckpoint {
    pub save_token: Uuid,
    pub cursor: u64,
}

impl JournalCheckpoint {
    /// Write the checkpoint file. Overwrites atomically; the file is
    /// rewritten on every invocation that verifies the record.
    #[instrument]
    pub async fn write(&self, path: &Path) -> Result<()> {
        let mut writer = WireWriter::new();
        writer.put_u32(CHECKPOINT_MAGIC);
        writer.put_token(&self.save_token);
        writer.put_u64(self.cursor);
        fs::write_atomic(path, writer.as_bytes())
            .await
            .context("write journal checkpoint")
    }

    /// Read a checkpoint file. Returns `None` when missing or corrupt;
    /// a bad checkpoint is equivalent to no checkpoint.
    #[instrument]
    pub async fn read(path: &Path) -> Result<Option<JournalCheckpoint>> {
        let Some(bytes) = fs::read(path).await? else {
            return Ok(None);
        };
        match Self::decode(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(err) => {
                warn!(?err, ?path, "corrupt journal checkpoint; ignoring");
                Ok(None)
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<JournalCheckpoint> {
        let mut reader = WireReader::new(bytes);
        let magic = reader.get_u32()?;
        if magic != CHECKPOINT_MAGIC {
            color_eyre::eyre::bail!("bad checkpoint magic: {magic:#010x}");
        }
        JournalCheckpoint {
            save_token: reader.get_token()?,
            cursor: reader.get_u64()?,
        }
        .pipe(Ok)
    }
}
