//! The serialized graph bundle: the versioned, multi-file on-disk
//! representation of a fully constructed pip graph.
//!
//! Every file carries a fixed envelope `{magic, name, version,
//! atomic-save-token, checksum}`; the checksum covers the envelope header
//! and the body, so truncation or tampering reads as "no previous run",
//! never as an error. Table files are written in parallel; the
//! `PreviousInputs` file is written to an intermediate name and moved to
//! its final name only after every other file has committed — presence at
//! the final name is the bundle's commit flag.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    case,
    config::ConfigState,
    fs,
    hash::{ContentHash, Fingerprint, FingerprintBuilder},
    mounts::MountExpander,
    paths::{NameTable, PathTable},
    pips::PipGraph,
    wire::{WireReader, WireWriter},
};

const BUNDLE_MAGIC: u32 = 0x5049_5042; // "PIPB"

/// Suffix for the not-yet-committed previous-inputs file.
pub const INTERMEDIATE_SUFFIX: &str = ".intermediate";

/// The typed files making up a bundle. File names on disk are fixed.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum BundleFileKind {
    PathTable,
    StringTable,
    SymbolTable,
    QualifierTable,
    PipTable,
    PipGraph,
    PipGraphId,
    DirectedGraph,
    MountPathExpander,
    HistoricTableSizes,
    ConfigState,
    PreviousInputs,
    PreviousInputsJournalCheckpoint,
}

impl BundleFileKind {
    /// On-disk file name within a bundle directory.
    pub fn file_name(self) -> &'static str {
        match self {
            BundleFileKind::PathTable => "PathTable",
            BundleFileKind::StringTable => "StringTable",
            BundleFileKind::SymbolTable => "SymbolTable",
            BundleFileKind::QualifierTable => "QualifierTable",
            BundleFileKind::PipTable => "PipTable",
            BundleFileKind::PipGraph => "PipGraph",
            BundleFileKind::PipGraphId => "PipGraphId",
            BundleFileKind::DirectedGraph => "DirectedGraph",
            BundleFileKind::MountPathExpander => "MountPathExpander",
            BundleFileKind::HistoricTableSizes => "HistoricTableSizes",
            BundleFileKind::ConfigState => "ConfigState",
            BundleFileKind::PreviousInputs => "PreviousInputs",
            BundleFileKind::PreviousInputsJournalCheckpoint => "PreviousInputsJournalCheckpoint",
        }
    }

    /// Current body version for this file kind.
    pub fn current_version(self) -> u32 {
        match self {
            BundleFileKind::PreviousInputs => 5,
            _ => 1,
        }
    }

    pub fn path_in(self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// Checksum over the envelope header and body: the first four bytes of
/// the Blake3 digest, little-endian.
fn checksum(name: &str, version: u32, token: &Uuid, compressed: bool, body: &[u8]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&BUNDLE_MAGIC.to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.update(&version.to_le_bytes());
    hasher.update(token.as_bytes());
    hasher.update(&[compressed as u8]);
    hasher.update(body);
    let digest = hasher.finalize();
    u32::from_le_bytes(digest.as_bytes()[..4].try_into().unwrap())
}

/// Encode one bundle file: envelope followed by the (optionally
/// zstd-compressed) body.
pub fn encode_file(
    kind: BundleFileKind,
    token: &Uuid,
    body: &[u8],
    compress: bool,
) -> Result<Vec<u8>> {
    let body = if compress {
        zstd::stream::encode_all(body, 0).context("compress body")?
    } else {
        body.to_vec()
    };

    let name = kind.file_name();
    let version = kind.current_version();
    let mut writer = WireWriter::new();
    writer.put_u32(BUNDLE_MAGIC);
    writer.put_str(name);
    writer.put_u32(version);
    writer.put_token(token);
    writer.put_bool(compress);
    writer.put_u32(checksum(name, version, token, compress, &body));
    writer.put_raw(&body);
    Ok(writer.into_bytes())
}

/// A decoded bundle file: its envelope fields and verified body.
#[derive(Debug)]
pub struct DecodedFile {
    pub version: u32,
    pub save_token: Uuid,
    pub body: Vec<u8>,
}

/// Decode and verify one bundle file.
///
/// Returns `None` — equivalent to "no previous run" — when the magic,
/// name, checksum, or version doesn't hold up. Corruption is never an
/// error here.
pub fn decode_file(kind: BundleFileKind, bytes: &[u8]) -> Option<DecodedFile> {
    let decoded = (|| -> Result<DecodedFile> {
        let mut reader = WireReader::new(bytes);
        let magic = reader.get_u32()?;
        if magic != BUNDLE_MAGIC {
            color_eyre::eyre::bail!("bad magic: {magic:#010x}");
        }
        let name = reader.get_str()?;
        if name != kind.file_name() {
            color_eyre::eyre::bail!("name mismatch: expected {:?}, found {name:?}", kind.file_name());
        }
        let version = reader.get_u32()?;
        if version > kind.current_version() {
            color_eyre::eyre::bail!("version {version} is newer than supported");
        }
        let save_token = reader.get_token()?;
        let compressed = reader.get_bool()?;
        let expected = reader.get_u32()?;
        let body = &bytes[bytes.len() - reader.remaining()..];
        if checksum(&name, version, &save_token, compressed, body) != expected {
            color_eyre::eyre::bail!("checksum mismatch");
        }
        let body = if compressed {
            zstd::stream::decode_all(body).context("decompress body")?
        } else {
            body.to_vec()
        };
        Ok(DecodedFile {
            version,
            save_token,
            body,
        })
    })();

    match decoded {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(?err, kind = %kind, "bundle file failed verification; treating as no previous run");
            None
        }
    }
}

/// Write one bundle file into a directory.
#[instrument(skip(body))]
pub async fn write_file(
    dir: &Path,
    kind: BundleFileKind,
    token: &Uuid,
    body: &[u8],
    compress: bool,
) -> Result<()> {
    let encoded = encode_file(kind, token, body, compress)?;
    fs::write(&kind.path_in(dir), &encoded).await
}

/// Read and verify one bundle file from a directory.
/// `None` when the file is missing or fails verification.
#[instrument]
pub async fn read_file(dir: &Path, kind: BundleFileKind) -> Result<Option<DecodedFile>> {
    let Some(bytes) = fs::read(&kind.path_in(dir)).await? else {
        return Ok(None);
    };
    Ok(decode_file(kind, &bytes))
}

/// Table size history: one row per table per build, newest last.
///
/// Used as a heuristic when deciding whether a reloaded in-memory
/// context is still worth carrying: reuse is disallowed once the most
/// recent total size exceeds [`HISTORIC_GROWTH_LIMIT`] times the oldest
/// recorded size. The doubling rule is a tunable, not a law.
pub const HISTORIC_GROWTH_LIMIT: u64 = 2;

/// Number of builds retained in the history.
const HISTORIC_BUILDS_KEPT: usize = 10;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TableSizeRow {
    pub table: String,
    pub count: u64,
    pub size_in_bytes: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct BuildTableSizes {
    pub tables: Vec<TableSizeRow>,
}

impl BuildTableSizes {
    pub fn total_bytes(&self) -> u64 {
        self.tables.iter().map(|row| row.size_in_bytes).sum()
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct HistoricTableSizes {
    builds: Vec<BuildTableSizes>,
}

impl HistoricTableSizes {
    pub fn record(&mut self, build: BuildTableSizes) {
        self.builds.push(build);
        if self.builds.len() > HISTORIC_BUILDS_KEPT {
            self.builds.remove(0);
        }
    }

    pub fn builds(&self) -> &[BuildTableSizes] {
        &self.builds
    }

    /// Whether a reloaded in-memory context may be reused, per the
    /// growth heuristic.
    pub fn allows_context_reuse(&self) -> bool {
        let (Some(oldest), Some(latest)) = (self.builds.first(), self.builds.last()) else {
            return true;
        };
        latest.total_bytes() <= oldest.total_bytes().saturating_mul(HISTORIC_GROWTH_LIMIT)
    }
}

/// Descriptor presented to the content cache: one content hash per
/// bundle file, plus trace metadata about the producing invocation.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct PipGraphCacheDescriptor {
    /// File-kind name → content hash of the encoded file.
    pub files: BTreeMap<String, ContentHash>,
    /// Free-form provenance (engine version, session id) for tooling.
    pub trace_info: String,
}

impl PipGraphCacheDescriptor {
    /// The graph-content fingerprint: descriptor entries hashed in
    /// case-insensitive key order.
    pub fn content_fingerprint(&self) -> Fingerprint {
        let mut entries: Vec<(&String, &ContentHash)> = self.files.iter().collect();
        entries.sort_by(|a, b| case::cmp(a.0, b.0));

        let mut b = FingerprintBuilder::new();
        for (name, hash) in entries {
            b.add_hash(name, hash);
        }
        b.finish_fingerprint()
    }
}

/// The in-memory form of a graph bundle.
#[derive(Debug)]
pub struct GraphBundle {
    pub path_table: PathTable,
    pub string_table: NameTable,
    pub symbol_table: NameTable,
    pub qualifier_table: NameTable,
    pub pip_graph: PipGraph,
    pub mounts: MountExpander,
    pub historic_sizes: HistoricTableSizes,
    pub config_state: ConfigState,
}

impl GraphBundle {
    /// Record this build's table sizes into the history.
    pub fn record_table_sizes(&mut self) {
        let build = BuildTableSizes {
            tables: vec![
                TableSizeRow {
                    table: "PathTable".into(),
                    count: self.path_table.len() as u64,
                    size_in_bytes: self.path_table.size_in_bytes(),
                },
                TableSizeRow {
                    table: "StringTable".into(),
                    count: self.string_table.len() as u64,
                    size_in_bytes: self.string_table.size_in_bytes(),
                },
                TableSizeRow {
                    table: "SymbolTable".into(),
                    count: self.symbol_table.len() as u64,
                    size_in_bytes: self.symbol_table.size_in_bytes(),
                },
                TableSizeRow {
                    table: "QualifierTable".into(),
                    count: self.qualifier_table.len() as u64,
                    size_in_bytes: self.qualifier_table.size_in_bytes(),
                },
                TableSizeRow {
                    table: "PipTable".into(),
                    count: self.pip_graph.table.len() as u64,
                    size_in_bytes: (self.pip_graph.table.len() as u64) * 64,
                },
            ],
        };
        self.historic_sizes.record(build);
    }

    /// Serialize the bundle into `dir`.
    ///
    /// All table files are written in parallel. The previous-inputs body
    /// (already encoded by the input tracker) is written to its
    /// intermediate name alongside them and moved to the final name only
    /// after everything else has committed.
    #[instrument(skip(self, previous_inputs_body))]
    pub async fn save(
        &self,
        dir: &Path,
        token: &Uuid,
        compress: bool,
        previous_inputs_body: &[u8],
    ) -> Result<()> {
        fs::create_dir_all(dir).await?;

        let mut jobs: Vec<(BundleFileKind, Vec<u8>)> = vec![
            (BundleFileKind::PathTable, {
                let mut w = WireWriter::new();
                self.path_table.to_wire(&mut w);
                w.into_bytes()
            }),
            (BundleFileKind::StringTable, {
                let mut w = WireWriter::new();
                self.string_table.to_wire(&mut w);
                w.into_bytes()
            }),
            (BundleFileKind::SymbolTable, {
                let mut w = WireWriter::new();
                self.symbol_table.to_wire(&mut w);
                w.into_bytes()
            }),
            (BundleFileKind::QualifierTable, {
                let mut w = WireWriter::new();
                self.qualifier_table.to_wire(&mut w);
                w.into_bytes()
            }),
            (
                BundleFileKind::PipTable,
                serde_json::to_vec(&self.pip_graph.table).context("encode pip table")?,
            ),
            (
                BundleFileKind::DirectedGraph,
                serde_json::to_vec(&self.pip_graph.graph).context("encode directed graph")?,
            ),
            (
                BundleFileKind::PipGraphId,
                self.pip_graph.id.as_bytes().to_vec(),
            ),
            (BundleFileKind::MountPathExpander, {
                let mut w = WireWriter::new();
                self.mounts.to_wire(&mut w);
                w.into_bytes()
            }),
            (
                BundleFileKind::HistoricTableSizes,
                serde_json::to_vec(&self.historic_sizes).context("encode historic sizes")?,
            ),
            (
                BundleFileKind::ConfigState,
                serde_json::to_vec(&self.config_state).context("encode config state")?,
            ),
        ];

        // PipGraph binds the graph identity to its parts; its body is the
        // id plus the content hashes of the table and edge files.
        let pip_graph_body = {
            let mut w = WireWriter::new();
            w.put_token(&self.pip_graph.id);
            let table_body = &jobs
                .iter()
                .find(|(k, _)| *k == BundleFileKind::PipTable)
                .expect("pip table job exists")
                .1;
            let graph_body = &jobs
                .iter()
                .find(|(k, _)| *k == BundleFileKind::DirectedGraph)
                .expect("directed graph job exists")
                .1;
            w.put_hash(&ContentHash::from_buffer(table_body));
            w.put_hash(&ContentHash::from_buffer(graph_body));
            w.into_bytes()
        };
        jobs.push((BundleFileKind::PipGraph, pip_graph_body));

        let final_inputs = BundleFileKind::PreviousInputs.path_in(dir);
        let intermediate_inputs = fs::sibling_with_suffix(&final_inputs, INTERMEDIATE_SUFFIX);

        let write_tables = try_join_all(
            jobs.iter()
                .map(|(kind, body)| write_file(dir, *kind, token, body, compress)),
        );
        let write_inputs = async {
            let encoded =
                encode_file(BundleFileKind::PreviousInputs, token, previous_inputs_body, compress)?;
            fs::write(&intermediate_inputs, &encoded).await
        };

        match tokio::try_join!(write_tables, write_inputs) {
            Ok(_) => {}
            Err(err) => {
                // A failed commit must not leave a half-written marker.
                let _ = fs::remove_file_if_exists(&intermediate_inputs).await;
                return Err(err);
            }
        }

        fs::rename(&intermediate_inputs, &final_inputs).await?;
        debug!(?dir, "bundle committed");
        Ok(())
    }

    /// Load a bundle from `dir`.
    ///
    /// Returns `None` — no previous run — if any file is missing or
    /// fails verification, or if the previous-inputs file is absent from
    /// its final name. A stray intermediate previous-inputs file is
    /// cleaned up.
    #[instrument]
    pub async fn load(dir: &Path) -> Result<Option<(GraphBundle, Vec<u8>)>> {
        let final_inputs = BundleFileKind::PreviousInputs.path_in(dir);
        let intermediate_inputs = fs::sibling_with_suffix(&final_inputs, INTERMEDIATE_SUFFIX);
        if fs::remove_file_if_exists(&intermediate_inputs).await? {
            warn!(?intermediate_inputs, "removed uncommitted previous-inputs file");
        }

        let Some(previous_inputs) = read_file(dir, BundleFileKind::PreviousInputs).await? else {
            return Ok(None);
        };

        // Table loads run concurrently; the pip-graph assembly below
        // consumes the table and edge futures rather than re-reading.
        let (
            path_table,
            string_table,
            symbol_table,
            qualifier_table,
            pip_table,
            directed_graph,
            graph_id,
            mounts_file,
            historic,
            config_state,
        ) = tokio::try_join!(
            read_file(dir, BundleFileKind::PathTable),
            read_file(dir, BundleFileKind::StringTable),
            read_file(dir, BundleFileKind::SymbolTable),
            read_file(dir, BundleFileKind::QualifierTable),
            read_file(dir, BundleFileKind::PipTable),
            read_file(dir, BundleFileKind::DirectedGraph),
            read_file(dir, BundleFileKind::PipGraphId),
            read_file(dir, BundleFileKind::MountPathExpander),
            read_file(dir, BundleFileKind::HistoricTableSizes),
            read_file(dir, BundleFileKind::ConfigState),
        )?;

        let (
            Some(path_table),
            Some(string_table),
            Some(symbol_table),
            Some(qualifier_table),
            Some(pip_table),
            Some(directed_graph),
            Some(graph_id),
            Some(mounts_file),
            Some(historic),
            Some(config_state),
        ) = (
            path_table,
            string_table,
            symbol_table,
            qualifier_table,
            pip_table,
            directed_graph,
            graph_id,
            mounts_file,
            historic,
            config_state,
        )
        else {
            return Ok(None);
        };

        let path_table = PathTable::from_wire(&mut WireReader::new(&path_table.body))
            .context("decode path table")?;
        let string_table = NameTable::from_wire(&mut WireReader::new(&string_table.body))
            .context("decode string table")?;
        let symbol_table = NameTable::from_wire(&mut WireReader::new(&symbol_table.body))
            .context("decode symbol table")?;
        let qualifier_table = NameTable::from_wire(&mut WireReader::new(&qualifier_table.body))
            .context("decode qualifier table")?;

        let mut table: crate::pips::PipTable =
            serde_json::from_slice(&pip_table.body).context("decode pip table")?;
        table.rebuild_index();
        let graph: crate::pips::DirectedGraph =
            serde_json::from_slice(&directed_graph.body).context("decode directed graph")?;

        let Ok(id_bytes) = <[u8; 16]>::try_from(graph_id.body.as_slice()) else {
            warn!("pip graph id file has wrong size; treating as no previous run");
            return Ok(None);
        };
        let id = Uuid::from_bytes(id_bytes);

        let mounts = MountExpander::from_wire(&mut WireReader::new(&mounts_file.body), &path_table)
            .context("decode mount expander")?;
        let historic_sizes: HistoricTableSizes =
            serde_json::from_slice(&historic.body).context("decode historic sizes")?;
        let config_state: ConfigState =
            serde_json::from_slice(&config_state.body).context("decode config state")?;

        Ok(Some((
            GraphBundle {
                path_table,
                string_table,
                symbol_table,
                qualifier_table,
                pip_graph: PipGraph { id, table, graph },
                mounts,
                historic_sizes,
                config_state,
            },
            previous_inputs.body,
        )))
    }

    /// Build the content-cache descriptor for an on-disk bundle: the
    /// content hash of each encoded file, keyed by kind name.
    #[instrument]
    pub async fn describe(dir: &Path, trace_info: String) -> Result<PipGraphCacheDescriptor> {
        use strum::IntoEnumIterator;

        let mut files = BTreeMap::new();
        for kind in BundleFileKind::iter() {
            if kind == BundleFileKind::PreviousInputsJournalCheckpoint {
                // The checkpoint is rewritten per-invocation and is not
                // part of the transferable graph content.
                continue;
            }
            if let Some(hash) = fs::hash_file(&kind.path_in(dir)).await? {
                files.insert(kind.file_name().to_owned(), hash);
            }
        }
        Ok(PipGraphCacheDescriptor { files, trace_info })
    }
}
