//! Sideband-file examination.
//!
//! Pips that declare shared opaque output directories record every path
//! they write into a per-pip sideband file. When those files are
//! trustworthy, scrubbing the opaque directories up front is unnecessary:
//! deletion of each pip's previous outputs is postponed until just before
//! that pip runs again. The examiner decides whether that trust holds.
//!
//! Every failure here downgrades to eager deletion; nothing in this
//! module is fatal.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::bail};
use futures::{StreamExt, stream};
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::EvaluationFilter,
    fs,
    hash::Fingerprint,
    pips::{Pip, PipGraph, PipId},
    wire::{WireReader, WireWriter},
};

const SIDEBAND_MAGIC: u32 = 0x5342_4E44; // "SBND"

/// How many sideband files are examined concurrently.
const EXAMINE_CONCURRENCY: usize = 8;

/// A per-pip record of writes performed under shared opaque roots.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SidebandFile {
    pub semi_stable_hash: u64,
    pub static_fingerprint: Fingerprint,
    /// Absolute paths the pip wrote, in write order.
    pub paths: Vec<String>,
}

impl SidebandFile {
    /// The fixed file name for a pip's sideband record.
    pub fn file_name(semi_stable_hash: u64) -> String {
        format!("Pip{semi_stable_hash:016X}.sideband")
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(Self::file_name(self.semi_stable_hash))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = WireWriter::new();
        body.put_u64(self.semi_stable_hash);
        body.put_fingerprint(&self.static_fingerprint);
        body.put_u32(self.paths.len() as u32);
        for path in &self.paths {
            body.put_str(path);
        }
        let body = body.into_bytes();

        let mut w = WireWriter::new();
        w.put_u32(SIDEBAND_MAGIC);
        w.put_u32(checksum(&body));
        w.put_raw(&body);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let magic = r.get_u32()?;
        if magic != SIDEBAND_MAGIC {
            bail!("bad sideband magic: {magic:#010x}");
        }
        let expected = r.get_u32()?;
        let body = &bytes[bytes.len() - r.remaining()..];
        if checksum(body) != expected {
            bail!("sideband checksum mismatch");
        }

        let mut r = WireReader::new(body);
        let semi_stable_hash = r.get_u64()?;
        let static_fingerprint = r.get_fingerprint()?;
        let count = r.get_u32()? as usize;
        let mut paths = Vec::with_capacity(count);
        for _ in 0..count {
            paths.push(r.get_str()?);
        }
        Ok(Self {
            semi_stable_hash,
            static_fingerprint,
            paths,
        })
    }

    pub async fn write(&self, dir: &Path) -> Result<()> {
        fs::write(&self.path_in(dir), &self.encode()).await
    }
}

fn checksum(body: &[u8]) -> u32 {
    let digest = blake3::hash(body);
    u32::from_le_bytes(digest.as_bytes()[..4].try_into().unwrap())
}

/// Why one pip's sideband file could not be trusted.
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::Display)]
pub enum SidebandFailure {
    FileNotFound,
    ChecksumMismatch,
    MetadataMismatch,
}

/// The examiner's verdict.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum SidebandDecision {
    /// Scrub shared opaque outputs before scheduling.
    EagerDeletion {
        /// The pip and failure that broke trust, when one did (lazy
        /// deletion may also simply be disabled or unconfigured).
        cause: Option<(PipId, SidebandFailure)>,
    },
    /// Trust holds: deletion is postponed per-pip. Extraneous sideband
    /// files (owned by no pip in the current graph) and the paths they
    /// reference are deleted lazily.
    LazyDeletion {
        extraneous_files: Vec<PathBuf>,
        referenced_paths: Vec<PathBuf>,
    },
}

/// Decides whether recorded writes under shared opaque directories can
/// be trusted.
pub struct SidebandExaminer<'a> {
    pub lazy_deletion_enabled: bool,
    pub sideband_directory: Option<&'a Path>,
    pub filter: &'a EvaluationFilter,
}

impl SidebandExaminer<'_> {
    /// Examine the graph's shared-opaque process pips.
    #[instrument(skip_all)]
    pub async fn examine(&self, graph: &PipGraph) -> SidebandDecision {
        let Some(dir) = self.sideband_directory else {
            debug!("no sideband directory configured; deleting eagerly");
            return SidebandDecision::EagerDeletion { cause: None };
        };
        if !self.lazy_deletion_enabled {
            debug!("lazy deletion disabled; deleting eagerly");
            return SidebandDecision::EagerDeletion { cause: None };
        }

        let selected: Vec<(PipId, &Pip)> = graph
            .shared_opaque_process_pips()
            .filter(|(_, pip)| self.passes_filter(pip))
            .collect();

        let failures = stream::iter(selected.iter())
            .map(|(id, pip)| async move {
                match examine_one(dir, pip).await {
                    Ok(()) => None,
                    Err(failure) => Some((*id, failure)),
                }
            })
            .buffer_unordered(EXAMINE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        if let Some((id, failure)) = failures.into_iter().flatten().next() {
            warn!(pip = ?id, %failure, "sideband file is untrustworthy; deleting eagerly");
            return SidebandDecision::EagerDeletion {
                cause: Some((id, failure)),
            };
        }

        let (extraneous_files, referenced_paths) = self.collect_extraneous(dir, graph).await;
        debug!(
            pips = selected.len(),
            extraneous = extraneous_files.len(),
            "sideband files verified; postponing deletion"
        );
        SidebandDecision::LazyDeletion {
            extraneous_files,
            referenced_paths,
        }
    }

    fn passes_filter(&self, pip: &Pip) -> bool {
        self.filter.is_unfiltered()
            || self
                .filter
                .module_names
                .contains(&pip.provenance.module_name)
    }

    /// Sideband files on disk that no pip in the current graph owns,
    /// plus the paths they reference.
    async fn collect_extraneous(
        &self,
        dir: &Path,
        graph: &PipGraph,
    ) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let owned: BTreeSet<String> = graph
            .shared_opaque_process_pips()
            .map(|(_, pip)| SidebandFile::file_name(pip.semi_stable_hash))
            .collect();

        let members = match fs::list_dir(dir).await {
            Ok(Some(members)) => members,
            Ok(None) => return (Vec::new(), Vec::new()),
            Err(err) => {
                warn!(?err, ?dir, "could not enumerate sideband directory");
                return (Vec::new(), Vec::new());
            }
        };

        let mut extraneous = Vec::new();
        let mut referenced = Vec::new();
        for member in members {
            if !member.name.ends_with(".sideband") || owned.contains(&member.name) {
                continue;
            }
            let path = dir.join(&member.name);
            match fs::read(&path).await {
                Ok(Some(bytes)) => {
                    if let Ok(record) = SidebandFile::decode(&bytes) {
                        referenced.extend(record.paths.iter().map(PathBuf::from));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    trace!(?err, ?path, "unreadable extraneous sideband file");
                }
            }
            extraneous.push(path);
        }
        extraneous.sort();
        referenced.sort();
        (extraneous, referenced)
    }
}

/// Verify one pip's sideband file: present, checksum intact, and its
/// recorded identity matches the pip.
async fn examine_one(dir: &Path, pip: &Pip) -> std::result::Result<(), SidebandFailure> {
    let path = dir.join(SidebandFile::file_name(pip.semi_stable_hash));
    let bytes = match fs::read(&path).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(SidebandFailure::FileNotFound),
        Err(err) => {
            warn!(?err, ?path, "sideband read failed");
            return Err(SidebandFailure::FileNotFound);
        }
    };

    let record = match SidebandFile::decode(&bytes) {
        Ok(record) => record,
        Err(err) => {
            trace!(?err, ?path, "sideband decode failed");
            return Err(SidebandFailure::ChecksumMismatch);
        }
    };

    if record.semi_stable_hash != pip.semi_stable_hash
        || record.static_fingerprint != pip.static_fingerprint
    {
        return Err(SidebandFailure::MetadataMismatch);
    }
    Ok(())
}
