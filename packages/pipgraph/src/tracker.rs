//! The input tracker: records every input consumed while a graph is
//! constructed, and verifies those inputs on later runs.
//!
//! During construction the tracker records file reads, existence probes,
//! and directory enumerations; environment variables and mount bindings
//! are supplied at serialization time. On a later run, the verifier
//! decides whether the recorded inputs still describe the current
//! workspace — consulting the change journal first so an unchanged
//! workspace verifies without a single file read.
//!
//! Registration is concurrent; two registrations of the same path must
//! agree under the transition rules below or the build fails with a
//! programming-error diagnostic.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use color_eyre::{Result, eyre::bail};
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    bundle::{self, BundleFileKind},
    case,
    config::{EvaluationFilter, FORCE_INVALIDATE_CACHED_GRAPH, UNSET_VARIABLE_MARKER},
    fingerprint::{CompositeGraphFingerprint, GraphFingerprintPair},
    fs::{self, DirMember},
    hash::ContentHash,
    journal::{ChangeJournalTracker, JournalCheckpoint, ScanOutcome},
    wire::{WireReader, WireWriter},
};

/// At most this many mismatches are logged per verification; the rest
/// are counted silently.
const MISMATCH_REPORT_LIMIT: usize = 5;

/// Why a graph could not be reused.
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::Display)]
pub enum GraphCacheMissReason {
    /// Nothing to check against: no record on disk.
    NoPreviousRunToCheck,
    BuildEngineChanged,
    ConfigFileChanged,
    QualifierChanged,
    EvaluationFilterChanged,
    /// Fingerprints differ in a dimension without its own category
    /// (salts, host identity, directory layout).
    FingerprintChanged,
    /// One or more spec files or enumerated directories changed.
    SpecFileChanges,
    EnvironmentVariableChanged,
    MountChanged,
    /// Verification itself failed (I/O error, incomplete record,
    /// cancellation); never a hard error.
    CheckFailed,
    /// Forced by the invalidation environment variable.
    ForcedMiss,
    /// A worker asked its orchestrator for a graph fingerprint and got
    /// none.
    NoFingerprintFromMaster,
}

impl GraphCacheMissReason {
    /// Whether this miss still allows patching a reloaded graph.
    pub fn allows_partial_reuse(self) -> bool {
        matches!(self, GraphCacheMissReason::SpecFileChanges)
    }
}

/// Result of verifying recorded inputs against the current workspace.
#[derive(Clone, Debug)]
pub struct InputMatchResult {
    pub matches: bool,
    pub miss_reason: Option<GraphCacheMissReason>,
    /// The first input that did not match, for the user-facing
    /// diagnostic.
    pub first_miss_identifier: Option<String>,
    /// How many files were actually probed or hashed.
    pub files_checked: usize,
    pub unchanged_paths: Vec<String>,
    pub changed_paths: Vec<String>,
    /// Whether `changed_paths` is exhaustive, or verification stopped at
    /// the first definite mismatch.
    pub is_changed_path_set_complete: bool,
}

impl InputMatchResult {
    fn matched(files_checked: usize, unchanged: Vec<String>) -> Self {
        Self {
            matches: true,
            miss_reason: None,
            first_miss_identifier: None,
            files_checked,
            unchanged_paths: unchanged,
            changed_paths: Vec::new(),
            is_changed_path_set_complete: true,
        }
    }

    fn miss(reason: GraphCacheMissReason, identifier: impl Into<String>) -> Self {
        Self {
            matches: false,
            miss_reason: Some(reason),
            first_miss_identifier: Some(identifier.into()),
            files_checked: 0,
            unchanged_paths: Vec::new(),
            changed_paths: Vec::new(),
            is_changed_path_set_complete: false,
        }
    }
}

/// Options controlling the verifier.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// Keep checking after the first definite mismatch so
    /// `changed_paths` comes out complete.
    pub check_all_possibly_changed_paths: bool,
    /// Wall-clock budget for the journal scan; exceeding it degrades to
    /// "possibly changed everything".
    pub journal_time_limit: Option<Duration>,
    pub concurrency: usize,
    pub cancel: CancellationToken,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            check_all_possibly_changed_paths: false,
            journal_time_limit: Some(Duration::from_secs(30)),
            concurrency: fs::DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }
}

/// Everything the verifier compares a record against.
pub struct VerifyContext<'a> {
    /// Snapshot of the current process environment.
    pub current_env: &'a HashMap<String, String>,
    /// Current mount bindings as `(name, root path)` pairs.
    pub current_mounts: &'a [(String, String)],
    pub current_fingerprints: &'a GraphFingerprintPair,
    pub journal: &'a ChangeJournalTracker,
    /// Checkpoint loaded from the previous run, if any.
    pub checkpoint: Option<JournalCheckpoint>,
    /// Where to rewrite the checkpoint after a successful match.
    pub checkpoint_path: Option<&'a Path>,
}

#[derive(Clone, Debug)]
struct FileRecord {
    /// Original (case-preserved) absolute path string.
    path: String,
    hash: ContentHash,
}

/// The serialized tracker state: everything the verifier needs from the
/// previous run, and the body of the bundle's `PreviousInputs` file.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PreviousInputs {
    /// The exact composite fingerprint of the producing run.
    pub fingerprint: CompositeGraphFingerprint,
    /// The producing run's compatible-overall digest, carried alongside
    /// the composite so filter-compatible reuse can be decided without
    /// recomputing salts.
    pub compatible_overall: crate::hash::Fingerprint,
    pub was_any_directory_enumerated: bool,
    pub all_directories_accounted_for: bool,
    /// `(name, value)`; unset variables carry the unset sentinel value.
    pub env_vars: Vec<(String, String)>,
    /// `(mount name, root path)`.
    pub mounts: Vec<(String, String)>,
    pub save_token: Uuid,
    /// `(path, hash)`, sorted case-insensitively by path.
    pub files: Vec<(String, ContentHash)>,
    /// `(path, membership fingerprint)`, sorted case-insensitively.
    pub directories: Vec<(String, ContentHash)>,
}

impl PreviousInputs {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.fingerprint.to_wire(&mut w);
        w.put_fingerprint(&self.compatible_overall);
        w.put_bool(self.was_any_directory_enumerated);
        w.put_bool(self.all_directories_accounted_for);
        w.put_u32(self.env_vars.len() as u32);
        for (key, value) in &self.env_vars {
            w.put_str(key);
            w.put_str(value);
        }
        w.put_u32(self.mounts.len() as u32);
        for (name, root) in &self.mounts {
            w.put_str(name);
            w.put_str(root);
        }
        w.put_token(&self.save_token);
        w.put_u32(self.files.len() as u32);
        for (path, hash) in &self.files {
            w.put_str(path);
            w.put_hash(hash);
        }
        w.put_u32(self.directories.len() as u32);
        for (path, hash) in &self.directories {
            w.put_str(path);
            w.put_hash(hash);
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let fingerprint = CompositeGraphFingerprint::from_wire(&mut r)?;
        let compatible_overall = r.get_fingerprint()?;
        let was_any_directory_enumerated = r.get_bool()?;
        let all_directories_accounted_for = r.get_bool()?;

        let env_count = r.get_u32()? as usize;
        let mut env_vars = Vec::with_capacity(env_count);
        for _ in 0..env_count {
            env_vars.push((r.get_str()?, r.get_str()?));
        }

        let mount_count = r.get_u32()? as usize;
        let mut mounts = Vec::with_capacity(mount_count);
        for _ in 0..mount_count {
            mounts.push((r.get_str()?, r.get_str()?));
        }

        let save_token = r.get_token()?;

        let file_count = r.get_u32()? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            files.push((r.get_str()?, r.get_hash()?));
        }

        let dir_count = r.get_u32()? as usize;
        let mut directories = Vec::with_capacity(dir_count);
        for _ in 0..dir_count {
            directories.push((r.get_str()?, r.get_hash()?));
        }

        Ok(Self {
            fingerprint,
            compatible_overall,
            was_any_directory_enumerated,
            all_directories_accounted_for,
            env_vars,
            mounts,
            save_token,
            files,
            directories,
        })
    }
}

/// Records graph-construction inputs for one invocation.
pub struct InputTracker {
    input_hashes: DashMap<String, FileRecord>,
    directory_fingerprints: DashMap<String, FileRecord>,
    journal: ChangeJournalTracker,
    save_token: Uuid,
    any_directory_enumerated: AtomicBool,
    all_directories_accounted_for: AtomicBool,
}

impl std::fmt::Debug for InputTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputTracker")
            .field("files", &self.input_hashes.len())
            .field("directories", &self.directory_fingerprints.len())
            .field("save_token", &self.save_token)
            .finish()
    }
}

impl InputTracker {
    pub fn new(journal: ChangeJournalTracker) -> Self {
        let save_token = match journal.save_token() {
            token if token.is_nil() => Uuid::new_v4(),
            token => token,
        };
        Self {
            input_hashes: DashMap::new(),
            directory_fingerprints: DashMap::new(),
            journal,
            save_token,
            any_directory_enumerated: AtomicBool::new(false),
            all_directories_accounted_for: AtomicBool::new(true),
        }
    }

    pub fn save_token(&self) -> Uuid {
        self.save_token
    }

    pub fn journal(&self) -> &ChangeJournalTracker {
        &self.journal
    }

    pub fn files_recorded(&self) -> usize {
        self.input_hashes.len()
    }

    /// Hash the file's current content and record it. The file's
    /// identity is also added to the change tracker when enabled.
    #[instrument(skip(self))]
    pub async fn register_file_access(&self, path: &Path) -> Result<ContentHash> {
        let hash = fs::hash_file(path)
            .await?
            .unwrap_or(ContentHash::ABSENT_FILE);
        self.register_file_access_with_hash(path, hash).await?;
        Ok(hash)
    }

    /// Record a file access whose content hash is already known (the
    /// front-end's content table hashes source files once).
    #[instrument(skip(self))]
    pub async fn register_file_access_with_hash(
        &self,
        path: &Path,
        hash: ContentHash,
    ) -> Result<()> {
        self.journal.track_path(path);
        self.record_file(path, hash).await
    }

    /// Record the result of an existence probe.
    #[instrument(skip(self))]
    pub async fn probe_file_or_directory_existence(&self, path: &Path) -> Result<bool> {
        let exists = fs::exists(path).await;
        let marker = if exists {
            ContentHash::EXISTENT_FILE_PROBE
        } else {
            ContentHash::ABSENT_FILE
        };
        self.journal.track_path(path);
        self.record_file(path, marker).await?;
        Ok(exists)
    }

    async fn record_file(&self, path: &Path, new: ContentHash) -> Result<()> {
        let original = path.to_string_lossy().into_owned();
        let key = case::fold(&original);

        let conflict = match self.input_hashes.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(FileRecord {
                    path: original.clone(),
                    hash: new,
                });
                None
            }
            Entry::Occupied(mut entry) => {
                let old = entry.get().hash;
                match transition(old, new) {
                    Some(merged) => {
                        entry.get_mut().hash = merged;
                        None
                    }
                    None => Some(old),
                }
            }
        };

        if let Some(old) = conflict {
            // Programming error: dump existing, new, and a fresh on-disk
            // hash so the conflicting registration can be found.
            let on_disk = fs::hash_file(path)
                .await
                .ok()
                .flatten()
                .unwrap_or(ContentHash::ABSENT_FILE);
            bail!(
                "conflicting input registrations for {original:?}: \
                 existing {old:?}, new {new:?}, on disk {on_disk:?}"
            );
        }
        Ok(())
    }

    /// Record a fingerprint of the directory's membership. When `members`
    /// is `None` the directory is enumerated here.
    ///
    /// An enumeration failure does not fail the build; it clears
    /// `all_directories_accounted_for`, which forces a miss on the next
    /// run.
    #[instrument(skip(self, members))]
    pub async fn track_directory(
        &self,
        path: &Path,
        members: Option<&[DirMember]>,
    ) -> Result<()> {
        self.any_directory_enumerated.store(true, Ordering::SeqCst);
        self.journal.track_path(path);

        let fingerprint = match members {
            Some(members) => fingerprint_directory(members),
            None => match fs::list_dir(path).await {
                Ok(Some(members)) => fingerprint_directory(&members),
                Ok(None) => ContentHash::ABSENT_FILE,
                Err(err) => {
                    warn!(?err, ?path, "directory could not be fingerprinted");
                    self.all_directories_accounted_for
                        .store(false, Ordering::SeqCst);
                    return Ok(());
                }
            },
        };

        let original = path.to_string_lossy().into_owned();
        let key = case::fold(&original);
        match self.directory_fingerprints.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(FileRecord {
                    path: original,
                    hash: fingerprint,
                });
            }
            Entry::Occupied(entry) => {
                if entry.get().hash != fingerprint {
                    // A membership change raced construction; keep the
                    // first fingerprint so the next run misses and
                    // re-evaluates.
                    warn!(path = %entry.get().path, "directory membership changed during construction");
                }
            }
        }
        Ok(())
    }

    /// Capture the serializable record for this run.
    pub fn capture(
        &self,
        fingerprints: &GraphFingerprintPair,
        env_vars: &[(String, Option<String>)],
        mounts: &[(String, String)],
    ) -> PreviousInputs {
        let mut files: Vec<(String, ContentHash)> = self
            .input_hashes
            .iter()
            .map(|entry| (entry.value().path.clone(), entry.value().hash))
            .collect();
        files.sort_by(|a, b| case::cmp(&a.0, &b.0));

        let mut directories: Vec<(String, ContentHash)> = self
            .directory_fingerprints
            .iter()
            .map(|entry| (entry.value().path.clone(), entry.value().hash))
            .collect();
        directories.sort_by(|a, b| case::cmp(&a.0, &b.0));

        let mut env_vars: Vec<(String, String)> = env_vars
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    value.clone().unwrap_or_else(|| UNSET_VARIABLE_MARKER.to_owned()),
                )
            })
            .collect();
        env_vars.sort_by(|a, b| case::cmp(&a.0, &b.0));

        let mut mounts = mounts.to_vec();
        mounts.sort_by(|a, b| case::cmp(&a.0, &b.0));

        PreviousInputs {
            fingerprint: fingerprints.exact.clone(),
            compatible_overall: fingerprints.compatible.overall,
            was_any_directory_enumerated: self.any_directory_enumerated.load(Ordering::SeqCst),
            all_directories_accounted_for: self
                .all_directories_accounted_for
                .load(Ordering::SeqCst),
            env_vars,
            mounts,
            save_token: self.save_token,
            files,
            directories,
        }
    }

    /// Serialize tracker state to `path` (enveloped) and persist the
    /// journal checkpoint under the tracker's atomic save token.
    #[instrument(skip(self, fingerprints, env_vars, mounts))]
    pub async fn write_to_file(
        &self,
        path: &Path,
        fingerprints: &GraphFingerprintPair,
        env_vars: &[(String, Option<String>)],
        mounts: &[(String, String)],
        journal_checkpoint_path: &Path,
    ) -> Result<()> {
        let body = self.capture(fingerprints, env_vars, mounts).encode();
        let encoded =
            bundle::encode_file(BundleFileKind::PreviousInputs, &self.save_token, &body, false)?;
        fs::write(path, &encoded).await?;

        JournalCheckpoint {
            save_token: self.save_token,
            cursor: self.journal.cursor(),
        }
        .write(journal_checkpoint_path)
        .await
    }

    /// The central verifier: decide whether the recorded inputs still
    /// describe the current workspace.
    ///
    /// Ordering matters and is fixed: fingerprint, completeness flag,
    /// environment, mounts, journal attestation, file hashes, directory
    /// memberships. I/O problems downgrade to a `CheckFailed` miss,
    /// never a hard error.
    #[instrument(skip_all)]
    pub async fn check_if_available_inputs_match_previous_run(
        previous: &PreviousInputs,
        ctx: VerifyContext<'_>,
        options: &VerifyOptions,
    ) -> InputMatchResult {
        // An explicit override forces a miss before anything is read.
        if ctx
            .current_env
            .keys()
            .any(|key| case::eq(key, FORCE_INVALIDATE_CACHED_GRAPH))
        {
            return InputMatchResult::miss(
                GraphCacheMissReason::ForcedMiss,
                FORCE_INVALIDATE_CACHED_GRAPH,
            );
        }

        // 1. Composite fingerprint: compatible first, then exact.
        if let Some(result) = compare_fingerprints(previous, ctx.current_fingerprints) {
            return result;
        }

        // 2. An incomplete enumeration record cannot be verified.
        if !previous.all_directories_accounted_for {
            return InputMatchResult::miss(
                GraphCacheMissReason::CheckFailed,
                "directory enumerations were not fully recorded",
            );
        }

        // 3. Environment variables.
        let folded_env: HashMap<String, &str> = ctx
            .current_env
            .iter()
            .map(|(key, value)| (case::fold(key), value.as_str()))
            .collect();
        for (key, recorded) in &previous.env_vars {
            let matches = match folded_env.get(&case::fold(key)) {
                Some(current) => case::eq(current, recorded),
                None => recorded == UNSET_VARIABLE_MARKER,
            };
            if !matches {
                return InputMatchResult::miss(
                    GraphCacheMissReason::EnvironmentVariableChanged,
                    key.clone(),
                );
            }
        }

        // 4. Mount bindings.
        let folded_mounts: HashMap<String, &str> = ctx
            .current_mounts
            .iter()
            .map(|(name, root)| (case::fold(name), root.as_str()))
            .collect();
        for (name, recorded_root) in &previous.mounts {
            let matches = match folded_mounts.get(&case::fold(name)) {
                Some(current_root) => case::eq(current_root, recorded_root),
                None => false,
            };
            if !matches {
                return InputMatchResult::miss(
                    GraphCacheMissReason::MountChanged,
                    name.clone(),
                );
            }
        }

        // 5–6. Journal attestation under the record's save token.
        let mut possibly_changed: Option<(BTreeSet<String>, BTreeSet<String>)> = None;
        if let Some(checkpoint) = ctx.checkpoint {
            if checkpoint.save_token == previous.save_token
                && ctx.journal.can_attest(previous.save_token)
            {
                match ctx.journal.scan(checkpoint.cursor, options.journal_time_limit) {
                    ScanOutcome::NoChanges => {
                        debug!("journal attests no changes; skipping file verification");
                        let unchanged =
                            previous.files.iter().map(|(p, _)| p.clone()).collect();
                        finalize_checkpoint(previous, &ctx).await;
                        return InputMatchResult::matched(0, unchanged);
                    }
                    ScanOutcome::Changed(changed) if changed.complete => {
                        possibly_changed = Some((changed.files, changed.directories));
                    }
                    ScanOutcome::Changed(_) | ScanOutcome::Unavailable => {
                        // Degrades to checking everything.
                    }
                }
            }
        }

        // 7. File content verification, bounded parallelism,
        // short-circuiting on the first definite mismatch.
        let candidates: Vec<(usize, String, ContentHash)> = previous
            .files
            .iter()
            .enumerate()
            .filter(|(_, (path, _))| match &possibly_changed {
                Some((files, _)) => files.contains(&case::fold(path)),
                None => true,
            })
            .map(|(i, (path, hash))| (i, path.clone(), *hash))
            .collect();

        let attested: Vec<String> = previous
            .files
            .iter()
            .filter(|(path, _)| match &possibly_changed {
                Some((files, _)) => !files.contains(&case::fold(path)),
                None => false,
            })
            .map(|(path, _)| path.clone())
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let reported = Arc::new(AtomicUsize::new(0));
        let check_all = options.check_all_possibly_changed_paths;
        let cancel = options.cancel.clone();

        let outcomes = stream::iter(candidates)
            .map(|(index, path, recorded)| {
                let stop = Arc::clone(&stop);
                let reported = Arc::clone(&reported);
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return FileOutcome::Cancelled;
                    }
                    if stop.load(Ordering::SeqCst) && !check_all {
                        return FileOutcome::Skipped;
                    }
                    match verify_file(&path, recorded).await {
                        Ok(true) => FileOutcome::Unchanged(path),
                        Ok(false) => {
                            if !check_all {
                                stop.store(true, Ordering::SeqCst);
                            }
                            if reported.fetch_add(1, Ordering::SeqCst) < MISMATCH_REPORT_LIMIT {
                                debug!(%path, "input file changed since the previous run");
                            }
                            FileOutcome::Changed(index, path)
                        }
                        Err(err) => {
                            stop.store(true, Ordering::SeqCst);
                            warn!(?err, %path, "input verification failed");
                            FileOutcome::Failed(index, path)
                        }
                    }
                }
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut unchanged: Vec<String> = attested;
        let mut changed: Vec<(usize, String)> = Vec::new();
        let mut failed: Option<(usize, String)> = None;
        let mut skipped = 0usize;
        let mut cancelled = false;
        let mut files_checked = 0usize;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Unchanged(path) => {
                    files_checked += 1;
                    unchanged.push(path);
                }
                FileOutcome::Changed(index, path) => {
                    files_checked += 1;
                    changed.push((index, path));
                }
                FileOutcome::Failed(index, path) => {
                    files_checked += 1;
                    let replace = failed.as_ref().map(|(i, _)| index < *i).unwrap_or(true);
                    if replace {
                        failed = Some((index, path));
                    }
                }
                FileOutcome::Skipped => skipped += 1,
                FileOutcome::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            return InputMatchResult::miss(GraphCacheMissReason::CheckFailed, "cancelled");
        }
        if let Some((_, path)) = failed {
            return InputMatchResult::miss(GraphCacheMissReason::CheckFailed, path);
        }
        if !changed.is_empty() {
            changed.sort_by_key(|(index, _)| *index);
            let first = changed[0].1.clone();
            return InputMatchResult {
                matches: false,
                miss_reason: Some(GraphCacheMissReason::SpecFileChanges),
                first_miss_identifier: Some(first),
                files_checked,
                unchanged_paths: unchanged,
                changed_paths: changed.into_iter().map(|(_, path)| path).collect(),
                is_changed_path_set_complete: skipped == 0,
            };
        }

        // 8. Directory membership verification.
        for (path, recorded) in &previous.directories {
            if let Some((_, dirs)) = &possibly_changed {
                if !dirs.contains(&case::fold(path)) {
                    continue;
                }
            }
            let current = match fs::list_dir(Path::new(path)).await {
                Ok(Some(members)) => fingerprint_directory(&members),
                Ok(None) => ContentHash::ABSENT_FILE,
                Err(err) => {
                    warn!(?err, %path, "directory verification failed");
                    return InputMatchResult::miss(GraphCacheMissReason::CheckFailed, path.clone());
                }
            };
            if current != *recorded {
                trace!(%path, "directory membership changed");
                return InputMatchResult {
                    matches: false,
                    miss_reason: Some(GraphCacheMissReason::SpecFileChanges),
                    first_miss_identifier: Some(path.clone()),
                    files_checked,
                    unchanged_paths: unchanged,
                    changed_paths: vec![path.clone()],
                    is_changed_path_set_complete: false,
                };
            }
        }

        // 9. In sync: rewrite the journal checkpoint under the current
        // atomic save token.
        finalize_checkpoint(previous, &ctx).await;
        InputMatchResult::matched(files_checked, unchanged)
    }
}

enum FileOutcome {
    Unchanged(String),
    Changed(usize, String),
    Failed(usize, String),
    Skipped,
    Cancelled,
}

/// Verify one recorded file: existence against the markers, content
/// hash otherwise. `Ok(true)` means unchanged.
async fn verify_file(path: &str, recorded: ContentHash) -> Result<bool> {
    let path = Path::new(path);
    if recorded == ContentHash::ABSENT_FILE {
        return Ok(!fs::exists(path).await);
    }
    if recorded == ContentHash::EXISTENT_FILE_PROBE {
        return Ok(fs::exists(path).await);
    }
    match fs::hash_file(path).await? {
        Some(hash) => Ok(hash == recorded),
        None => Ok(false),
    }
}

async fn finalize_checkpoint(previous: &PreviousInputs, ctx: &VerifyContext<'_>) {
    let Some(path) = ctx.checkpoint_path else {
        return;
    };
    let checkpoint = JournalCheckpoint {
        save_token: previous.save_token,
        cursor: ctx.journal.cursor(),
    };
    if let Err(err) = checkpoint.write(path).await {
        warn!(?err, ?path, "failed to rewrite journal checkpoint");
    }
}

/// Step 1 of the verifier: the ordered fingerprint comparison.
/// `None` means the fingerprints are reuse-compatible.
fn compare_fingerprints(
    previous: &PreviousInputs,
    current: &GraphFingerprintPair,
) -> Option<InputMatchResult> {
    let prev = &previous.fingerprint;

    if previous.compatible_overall != current.compatible.overall {
        let (reason, identifier) = if prev.build_engine != current.exact.build_engine {
            (GraphCacheMissReason::BuildEngineChanged, "buildEngine")
        } else if prev.config_file != current.exact.config_file {
            (GraphCacheMissReason::ConfigFileChanged, "configFiles")
        } else if prev.qualifier != current.exact.qualifier {
            (GraphCacheMissReason::QualifierChanged, "qualifiers")
        } else {
            (GraphCacheMissReason::FingerprintChanged, "overall")
        };
        return Some(InputMatchResult::miss(reason, identifier));
    }

    if prev.overall == current.exact.overall {
        return None;
    }

    // Only the filter moved. A narrower filter is served by the broader
    // previous graph.
    let unfiltered = EvaluationFilter::unfiltered();
    let previous_filter = prev.evaluation_filter.as_ref().unwrap_or(&unfiltered);
    let current_filter = current
        .exact
        .evaluation_filter
        .as_ref()
        .unwrap_or(&unfiltered);
    if current_filter.is_satisfied_by(previous_filter) {
        None
    } else {
        Some(InputMatchResult::miss(
            GraphCacheMissReason::EvaluationFilterChanged,
            "evaluationFilter",
        ))
    }
}

/// Merge a new registration into an existing one, or `None` when the
/// transition is illegal.
///
/// Legal transitions for one path within a run:
/// - probe → real hash (the probe later became a read)
/// - real hash → probe (the real hash is kept)
/// - probe → probe, absent → absent, equal real → real
///
/// Absent never mixes with any present variant, and two different real
/// hashes never merge.
fn transition(old: ContentHash, new: ContentHash) -> Option<ContentHash> {
    if old == new {
        return Some(old);
    }
    let old_absent = old == ContentHash::ABSENT_FILE;
    let new_absent = new == ContentHash::ABSENT_FILE;
    if old_absent || new_absent {
        return None;
    }
    if old == ContentHash::EXISTENT_FILE_PROBE {
        return Some(new);
    }
    if new == ContentHash::EXISTENT_FILE_PROBE {
        return Some(old);
    }
    None
}

/// Fingerprint a directory's membership: entries ordered
/// case-insensitively by name, each contributing its name and kind.
pub fn fingerprint_directory(members: &[DirMember]) -> ContentHash {
    let mut sorted: Vec<&DirMember> = members.iter().collect();
    sorted.sort_by(|a, b| case::cmp(&a.name, &b.name));

    let mut hasher = blake3::Hasher::new();
    for member in sorted {
        hasher.update(member.name.as_bytes());
        hasher.update(&[0x00, member.kind.tag(), 0x01]);
    }
    ContentHash::from_bytes(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;
    use tempfile::TempDir;

    use super::*;
    use crate::journal::{ChangeJournal, PossiblyChanged};

    fn real(n: u8) -> ContentHash {
        ContentHash::from_buffer([n])
    }

    #[test_case(ContentHash::EXISTENT_FILE_PROBE, real(1), Some(real(1)); "probe_becomes_read")]
    #[test_case(real(1), ContentHash::EXISTENT_FILE_PROBE, Some(real(1)); "read_then_probe_keeps_hash")]
    #[test_case(ContentHash::EXISTENT_FILE_PROBE, ContentHash::EXISTENT_FILE_PROBE, Some(ContentHash::EXISTENT_FILE_PROBE); "probe_probe")]
    #[test_case(real(1), real(1), Some(real(1)); "equal_reads")]
    #[test_case(ContentHash::ABSENT_FILE, ContentHash::ABSENT_FILE, Some(ContentHash::ABSENT_FILE); "absent_absent")]
    #[test_case(real(1), real(2), None; "conflicting_reads")]
    #[test_case(ContentHash::ABSENT_FILE, real(1), None; "absent_to_present")]
    #[test_case(real(1), ContentHash::ABSENT_FILE, None; "present_to_absent")]
    #[test_case(ContentHash::ABSENT_FILE, ContentHash::EXISTENT_FILE_PROBE, None; "absent_to_probe")]
    #[test]
    fn transitions(old: ContentHash, new: ContentHash, expect: Option<ContentHash>) {
        pretty_assert_eq!(transition(old, new), expect);
    }

    fn empty_pair() -> GraphFingerprintPair {
        use crate::hash::Fingerprint;
        let composite = |filter: Option<EvaluationFilter>| CompositeGraphFingerprint {
            overall: Fingerprint::from_buffer(b"overall"),
            build_engine: Fingerprint::from_buffer(b"engine"),
            config_file: Fingerprint::from_buffer(b"config"),
            qualifier: Fingerprint::from_buffer(b"qualifier"),
            filter: Fingerprint::from_buffer(b"filter"),
            evaluation_filter: filter,
        };
        GraphFingerprintPair {
            exact: composite(Some(EvaluationFilter::unfiltered())),
            compatible: composite(None),
        }
    }

    fn tracker() -> InputTracker {
        InputTracker::new(ChangeJournalTracker::disabled())
    }

    fn record_for(tracker: &InputTracker, pair: &GraphFingerprintPair) -> PreviousInputs {
        tracker.capture(pair, &[], &[])
    }

    fn context<'a>(
        env: &'a HashMap<String, String>,
        mounts: &'a [(String, String)],
        pair: &'a GraphFingerprintPair,
        journal: &'a ChangeJournalTracker,
    ) -> VerifyContext<'a> {
        VerifyContext {
            current_env: env,
            current_mounts: mounts,
            current_fingerprints: pair,
            journal,
            checkpoint: None,
            checkpoint_path: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn conflicting_registrations_fail_the_build() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input");
        fs::write(&path, b"v1").await.unwrap();

        let tracker = tracker();
        tracker.register_file_access(&path).await.unwrap();
        let err = tracker
            .register_file_access_with_hash(&path, real(9))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("conflicting input registrations"), "{text}");
        assert!(text.contains("on disk"), "{text}");
    }

    #[tokio::test]
    async fn probe_then_read_records_the_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input");
        fs::write(&path, b"content").await.unwrap();

        let tracker = tracker();
        assert!(tracker.probe_file_or_directory_existence(&path).await.unwrap());
        let hash = tracker.register_file_access(&path).await.unwrap();

        let record = record_for(&tracker, &empty_pair());
        pretty_assert_eq!(record.files.len(), 1);
        pretty_assert_eq!(record.files[0].1, hash);
    }

    #[tokio::test]
    async fn capture_sorts_case_insensitively() {
        let dir = TempDir::new().unwrap();
        for name in ["b.dsc", "A.dsc", "c.dsc"] {
            fs::write(&dir.path().join(name), b"x").await.unwrap();
        }

        let tracker = tracker();
        for name in ["c.dsc", "b.dsc", "A.dsc"] {
            tracker
                .register_file_access(&dir.path().join(name))
                .await
                .unwrap();
        }

        let record = record_for(&tracker, &empty_pair());
        let names: Vec<&str> = record
            .files
            .iter()
            .map(|(p, _)| Path::new(p).file_name().unwrap().to_str().unwrap())
            .collect();
        pretty_assert_eq!(names, vec!["A.dsc", "b.dsc", "c.dsc"]);
    }

    #[tokio::test]
    async fn previous_inputs_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input");
        fs::write(&path, b"content").await.unwrap();

        let tracker = tracker();
        tracker.register_file_access(&path).await.unwrap();
        tracker.track_directory(dir.path(), None).await.unwrap();

        let record = tracker.capture(
            &empty_pair(),
            &[("FOO".into(), Some("bar".into())), ("GONE".into(), None)],
            &[("SourceRoot".into(), "/repo/src".into())],
        );
        let decoded = PreviousInputs::decode(&record.encode()).unwrap();
        pretty_assert_eq!(decoded, record);
        pretty_assert_eq!(
            decoded.env_vars,
            vec![
                ("FOO".to_owned(), "bar".to_owned()),
                ("GONE".to_owned(), UNSET_VARIABLE_MARKER.to_owned()),
            ]
        );
        assert!(decoded.was_any_directory_enumerated);
        assert!(decoded.all_directories_accounted_for);
    }

    #[tokio::test]
    async fn empty_record_matches_when_dimensions_match() {
        let pair = empty_pair();
        let record = record_for(&tracker(), &pair);
        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();

        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        assert!(result.matches);
        pretty_assert_eq!(result.files_checked, 0);
    }

    #[tokio::test]
    async fn forced_invalidation_misses_first() {
        let pair = empty_pair();
        let record = record_for(&tracker(), &pair);
        let env: HashMap<String, String> =
            [(FORCE_INVALIDATE_CACHED_GRAPH.to_owned(), "1".to_owned())].into();
        let journal = ChangeJournalTracker::disabled();

        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(result.miss_reason, Some(GraphCacheMissReason::ForcedMiss));
    }

    #[tokio::test]
    async fn env_change_reports_variable_name() {
        let pair = empty_pair();
        let tracker = tracker();
        let record = tracker.capture(&pair, &[("FOO".into(), Some("bar".into()))], &[]);

        let env: HashMap<String, String> = [("FOO".to_owned(), "baz".to_owned())].into();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::EnvironmentVariableChanged)
        );
        pretty_assert_eq!(result.first_miss_identifier.as_deref(), Some("FOO"));
    }

    #[tokio::test]
    async fn unset_marker_matches_absent_variable() {
        let pair = empty_pair();
        let tracker = tracker();
        let record = tracker.capture(&pair, &[("GONE".into(), None)], &[]);

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        assert!(result.matches);
    }

    #[tokio::test]
    async fn mount_change_reports_mount_name() {
        let pair = empty_pair();
        let tracker = tracker();
        let record = tracker.capture(&pair, &[], &[("SourceRoot".into(), "/repo/src".into())]);

        let env = HashMap::new();
        let mounts = [("SourceRoot".to_owned(), "/elsewhere".to_owned())];
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &mounts, &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(result.miss_reason, Some(GraphCacheMissReason::MountChanged));
        pretty_assert_eq!(result.first_miss_identifier.as_deref(), Some("SourceRoot"));
    }

    #[tokio::test]
    async fn file_change_is_a_spec_file_miss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spec.dsc");
        fs::write(&path, b"v1").await.unwrap();

        let pair = empty_pair();
        let tracker = tracker();
        tracker.register_file_access(&path).await.unwrap();
        let record = record_for(&tracker, &pair);

        fs::write(&path, b"v2").await.unwrap();
        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::SpecFileChanges)
        );
        pretty_assert_eq!(
            result.first_miss_identifier.as_deref(),
            Some(path.to_string_lossy().as_ref())
        );
        pretty_assert_eq!(result.changed_paths.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_workspace_matches_and_counts_checks() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.dsc");
        let b = dir.path().join("b.dsc");
        fs::write(&a, b"a").await.unwrap();
        fs::write(&b, b"b").await.unwrap();

        let pair = empty_pair();
        let tracker = tracker();
        tracker.register_file_access(&a).await.unwrap();
        tracker.register_file_access(&b).await.unwrap();
        tracker.track_directory(dir.path(), None).await.unwrap();
        let record = record_for(&tracker, &pair);

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        assert!(result.matches);
        pretty_assert_eq!(result.files_checked, 2);
        pretty_assert_eq!(result.unchanged_paths.len(), 2);
    }

    #[tokio::test]
    async fn absent_marker_mismatches_when_file_appears() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appears");

        let pair = empty_pair();
        let tracker = tracker();
        assert!(!tracker.probe_file_or_directory_existence(&path).await.unwrap());
        let record = record_for(&tracker, &pair);

        fs::write(&path, b"now exists").await.unwrap();
        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::SpecFileChanges)
        );
    }

    #[tokio::test]
    async fn directory_membership_change_is_detected() {
        let dir = TempDir::new().unwrap();
        fs::write(&dir.path().join("a.dsc"), b"a").await.unwrap();

        let pair = empty_pair();
        let tracker = tracker();
        tracker.track_directory(dir.path(), None).await.unwrap();
        let record = record_for(&tracker, &pair);

        fs::write(&dir.path().join("b.dsc"), b"b").await.unwrap();
        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::SpecFileChanges)
        );
    }

    #[tokio::test]
    async fn incomplete_enumeration_record_misses() {
        let pair = empty_pair();
        let tracker = tracker();
        let mut record = record_for(&tracker, &pair);
        record.all_directories_accounted_for = false;

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(result.miss_reason, Some(GraphCacheMissReason::CheckFailed));
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_categorized() {
        let pair = empty_pair();
        let record = record_for(&tracker(), &pair);

        let mut other = empty_pair();
        other.exact.build_engine = crate::hash::Fingerprint::from_buffer(b"new engine");
        other.compatible.overall = crate::hash::Fingerprint::from_buffer(b"moved");

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &other, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::BuildEngineChanged)
        );
    }

    #[tokio::test]
    async fn narrower_filter_reuses_broader_graph() {
        // Previous run evaluated modules {m1, m2}; the new run asks for
        // {m1} only. Same compatible overall, different exact.
        let mut previous_pair = empty_pair();
        let mut broad = EvaluationFilter::unfiltered();
        broad.module_names.extend(["m1".to_owned(), "m2".to_owned()]);
        previous_pair.exact.evaluation_filter = Some(broad);
        previous_pair.exact.overall = crate::hash::Fingerprint::from_buffer(b"broad overall");
        let record = record_for(&tracker(), &previous_pair);

        let mut current = empty_pair();
        let mut narrow = EvaluationFilter::unfiltered();
        narrow.module_names.insert("m1".to_owned());
        current.exact.evaluation_filter = Some(narrow);
        current.exact.overall = crate::hash::Fingerprint::from_buffer(b"narrow overall");

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &current, &journal),
            &VerifyOptions::default(),
        )
        .await;
        assert!(result.matches, "narrower filter should reuse: {result:?}");

        // The reverse direction misses.
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record_for(&tracker(), &current),
            context(&env, &[], &previous_pair, &journal),
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::EvaluationFilterChanged)
        );
    }

    /// A journal whose scan outcome is scripted by the test.
    struct ScriptedJournal {
        outcome: ScanOutcome,
        cursor: u64,
    }

    impl ChangeJournal for ScriptedJournal {
        fn cursor(&self) -> u64 {
            self.cursor
        }

        fn track_path(&self, _path: &Path) {}

        fn scan(&self, _since: u64, _limit: Option<Duration>) -> Result<ScanOutcome> {
            Ok(self.outcome.clone())
        }
    }

    #[test_log::test(tokio::test)]
    async fn journal_no_changes_skips_file_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spec.dsc");
        fs::write(&path, b"v1").await.unwrap();

        let pair = empty_pair();
        let journal_impl = Arc::new(ScriptedJournal {
            outcome: ScanOutcome::NoChanges,
            cursor: 10,
        });
        let journal = ChangeJournalTracker::tracking(journal_impl);

        let tracker = InputTracker::new(journal.clone());
        tracker.register_file_access(&path).await.unwrap();
        let record = record_for(&tracker, &pair);

        // Change the file after capture; the journal (scripted to report
        // nothing) attests the record anyway, with zero reads.
        fs::write(&path, b"v2").await.unwrap();

        let checkpoint_path = dir.path().join("checkpoint");
        let env = HashMap::new();
        let ctx = VerifyContext {
            current_env: &env,
            current_mounts: &[],
            current_fingerprints: &pair,
            journal: &journal,
            checkpoint: Some(JournalCheckpoint {
                save_token: record.save_token,
                cursor: 3,
            }),
            checkpoint_path: Some(&checkpoint_path),
        };
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            ctx,
            &VerifyOptions::default(),
        )
        .await;
        assert!(result.matches);
        pretty_assert_eq!(result.files_checked, 0);

        // The checkpoint was rewritten under the record's token at the
        // journal's current cursor.
        let rewritten = JournalCheckpoint::read(&checkpoint_path).await.unwrap().unwrap();
        pretty_assert_eq!(rewritten.save_token, record.save_token);
        pretty_assert_eq!(rewritten.cursor, 10);
    }

    #[test_log::test(tokio::test)]
    async fn journal_restricts_checks_to_possibly_changed() {
        let dir = TempDir::new().unwrap();
        let touched = dir.path().join("touched.dsc");
        let untouched = dir.path().join("untouched.dsc");
        fs::write(&touched, b"v1").await.unwrap();
        fs::write(&untouched, b"v1").await.unwrap();

        let pair = empty_pair();
        let changed = PossiblyChanged {
            files: [case::fold(&touched.to_string_lossy())].into_iter().collect(),
            directories: BTreeSet::new(),
            complete: true,
        };
        let journal_impl = Arc::new(ScriptedJournal {
            outcome: ScanOutcome::Changed(changed),
            cursor: 10,
        });
        let journal = ChangeJournalTracker::tracking(journal_impl);

        let tracker = InputTracker::new(journal.clone());
        tracker.register_file_access(&touched).await.unwrap();
        tracker.register_file_access(&untouched).await.unwrap();
        let record = record_for(&tracker, &pair);

        let env = HashMap::new();
        let ctx = VerifyContext {
            current_env: &env,
            current_mounts: &[],
            current_fingerprints: &pair,
            journal: &journal,
            checkpoint: Some(JournalCheckpoint {
                save_token: record.save_token,
                cursor: 3,
            }),
            checkpoint_path: None,
        };
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            ctx,
            &VerifyOptions::default(),
        )
        .await;
        assert!(result.matches);
        // Only the possibly-changed file was actually hashed.
        pretty_assert_eq!(result.files_checked, 1);
        pretty_assert_eq!(result.unchanged_paths.len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_token_mismatch_falls_back_to_hashing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spec.dsc");
        fs::write(&path, b"v1").await.unwrap();

        let pair = empty_pair();
        let journal_impl = Arc::new(ScriptedJournal {
            outcome: ScanOutcome::NoChanges,
            cursor: 10,
        });
        let journal = ChangeJournalTracker::tracking(journal_impl);

        let tracker = InputTracker::new(journal.clone());
        tracker.register_file_access(&path).await.unwrap();
        let record = record_for(&tracker, &pair);

        fs::write(&path, b"v2").await.unwrap();

        let env = HashMap::new();
        let ctx = VerifyContext {
            current_env: &env,
            current_mounts: &[],
            current_fingerprints: &pair,
            journal: &journal,
            // Token disagrees with the record: journal cannot attest.
            checkpoint: Some(JournalCheckpoint {
                save_token: Uuid::new_v4(),
                cursor: 3,
            }),
            checkpoint_path: None,
        };
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            ctx,
            &VerifyOptions::default(),
        )
        .await;
        pretty_assert_eq!(
            result.miss_reason,
            Some(GraphCacheMissReason::SpecFileChanges)
        );
    }

    #[tokio::test]
    async fn check_all_reports_every_changed_path() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..4 {
            let path = dir.path().join(format!("spec{i}.dsc"));
            fs::write(&path, b"v1").await.unwrap();
            paths.push(path);
        }

        let pair = empty_pair();
        let tracker = tracker();
        for path in &paths {
            tracker.register_file_access(path).await.unwrap();
        }
        let record = record_for(&tracker, &pair);

        for path in &paths {
            fs::write(path, b"v2").await.unwrap();
        }

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        let options = VerifyOptions {
            check_all_possibly_changed_paths: true,
            ..Default::default()
        };
        let result = InputTracker::check_if_available_inputs_match_previous_run(
            &record,
            context(&env, &[], &pair, &journal),
            &options,
        )
        .await;
        pretty_assert_eq!(result.changed_paths.len(), 4);
        assert!(result.is_changed_path_set_complete);
    }

    #[tokio::test]
    async fn rerunning_verification_does_not_alter_the_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spec.dsc");
        fs::write(&path, b"v1").await.unwrap();

        let pair = empty_pair();
        let tracker = tracker();
        tracker.register_file_access(&path).await.unwrap();
        let record = record_for(&tracker, &pair);
        let encoded = record.encode();

        let env = HashMap::new();
        let journal = ChangeJournalTracker::disabled();
        for _ in 0..2 {
            let result = InputTracker::check_if_available_inputs_match_previous_run(
                &record,
                context(&env, &[], &pair, &journal),
                &VerifyOptions::default(),
            )
            .await;
            assert!(result.matches);
        }
        pretty_assert_eq!(record.encode(), encoded);
    }

    #[tokio::test]
    async fn write_to_file_persists_record_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spec.dsc");
        fs::write(&path, b"v1").await.unwrap();

        let pair = empty_pair();
        let tracker = tracker();
        tracker.register_file_access(&path).await.unwrap();

        let record_path = dir.path().join("PreviousInputs");
        let checkpoint_path = dir.path().join("PreviousInputsJournalCheckpoint");
        tracker
            .write_to_file(&record_path, &pair, &[], &[], &checkpoint_path)
            .await
            .unwrap();

        let bytes = fs::read(&record_path).await.unwrap().unwrap();
        let decoded = bundle::decode_file(BundleFileKind::PreviousInputs, &bytes).unwrap();
        pretty_assert_eq!(decoded.save_token, tracker.save_token());
        let inputs = PreviousInputs::decode(&decoded.body).unwrap();
        pretty_assert_eq!(inputs.files.len(), 1);

        let checkpoint = JournalCheckpoint::read(&checkpoint_path).await.unwrap().unwrap();
        pretty_assert_eq!(checkpoint.save_token, tracker.save_token());
    }
}
