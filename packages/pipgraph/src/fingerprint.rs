//! Composite graph fingerprints.
//!
//! Before evaluation begins, the engine computes a fingerprint that
//! identifies the graph an invocation *would* produce: configuration
//! files, qualifiers, the evaluation filter, the engine's own binaries,
//! and a handful of environment salts. Two fingerprints are produced —
//! the *exact* one includes the current filter, while the *compatible*
//! one replaces it with the unfiltered hash, so a graph evaluated under
//! one filter can serve a later build asking for a subset.

use std::path::{Path, PathBuf};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt, stream};
use itertools::Itertools;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument};

use crate::{
    case,
    config::{EngineConfiguration, EvaluationFilter},
    fs,
    hash::{Fingerprint, FingerprintBuilder},
    wire::{WireReader, WireWriter},
};

/// Canonical text hashed as the filter dimension of a compatible
/// fingerprint.
const UNFILTERED_FILTER_TEXT: &str = "values:[];roots:[];modules:[]";

/// The composite fingerprint identifying a would-be graph.
///
/// `overall` binds the four dimension fingerprints together with the
/// version, host, and salt inputs; the dimensions are kept individually
/// so a verifier can categorize which one moved.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CompositeGraphFingerprint {
    pub overall: Fingerprint,
    pub build_engine: Fingerprint,
    pub config_file: Fingerprint,
    pub qualifier: Fingerprint,
    pub filter: Fingerprint,
    /// The filter this graph was evaluated under, carried so a later run
    /// can decide whether its own filter is a subset. `None` on
    /// compatible fingerprints.
    pub evaluation_filter: Option<EvaluationFilter>,
}

impl CompositeGraphFingerprint {
    pub fn to_wire(&self, writer: &mut WireWriter) {
        writer.put_fingerprint(&self.overall);
        writer.put_fingerprint(&self.build_engine);
        writer.put_fingerprint(&self.config_file);
        writer.put_fingerprint(&self.qualifier);
        writer.put_fingerprint(&self.filter);
        let blob = self
            .evaluation_filter
            .as_ref()
            .map(|f| serde_json::to_string(f).expect("filter serializes"))
            .unwrap_or_default();
        writer.put_str(&blob);
    }

    pub fn from_wire(reader: &mut WireReader<'_>) -> Result<Self> {
        let overall = reader.get_fingerprint()?;
        let build_engine = reader.get_fingerprint()?;
        let config_file = reader.get_fingerprint()?;
        let qualifier = reader.get_fingerprint()?;
        let filter = reader.get_fingerprint()?;
        let blob = reader.get_str()?;
        let evaluation_filter = if blob.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&blob).context("decode evaluation filter blob")?)
        };
        Ok(Self {
            overall,
            build_engine,
            config_file,
            qualifier,
            filter,
            evaluation_filter,
        })
    }
}

/// The `(exact, compatible)` fingerprint pair for one invocation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct GraphFingerprintPair {
    pub exact: CompositeGraphFingerprint,
    pub compatible: CompositeGraphFingerprint,
}

/// A computed pair plus the human-readable trace of every element that
/// contributed. The trace is kept as a separate record, not attached to
/// the fingerprints themselves.
#[derive(Clone, Debug)]
pub struct ComputedGraphFingerprints {
    pub pair: GraphFingerprintPair,
    pub trace: Vec<(String, String)>,
}

impl ComputedGraphFingerprints {
    /// Render the trace listing, one `name = hash` line per element.
    pub fn render_trace(&self) -> String {
        self.trace
            .iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .join("\n")
    }
}

/// Host attributes folded into the overall fingerprint.
#[derive(Clone, Eq, PartialEq, Debug, Builder)]
pub struct HostIdentity {
    pub os: String,
    pub cpu_arch: String,
    pub elevated: bool,
}

impl HostIdentity {
    /// The current host. Elevation is supplied by the embedding binary,
    /// which knows how it was launched.
    pub fn current(elevated: bool) -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            cpu_arch: std::env::consts::ARCH.to_owned(),
            elevated,
        }
    }
}

/// Produces the composite fingerprint pair for an invocation.
#[derive(Builder)]
pub struct GraphFingerprinter<'a> {
    config: &'a EngineConfiguration,
    host: HostIdentity,
    /// Test-injected salt; production callers leave it unset.
    debug_salt: Option<String>,
}

impl GraphFingerprinter<'_> {
    /// Compute the `(exact, compatible)` pair.
    ///
    /// Any I/O error while hashing a config file or the engine
    /// deployment invalidates the computation; the caller treats an
    /// error as an immediate miss.
    #[instrument(skip(self))]
    pub async fn compute(&self) -> Result<ComputedGraphFingerprints> {
        let build_engine = self.build_engine_fingerprint().await?;
        let config_file = self.config_files_fingerprint().await?;
        let qualifier = self.qualifier_fingerprint();

        let filter = &self.config.evaluation_filter;
        let exact_filter = Fingerprint::from_buffer(filter.canonical().as_bytes());
        let unfiltered = Fingerprint::from_buffer(UNFILTERED_FILTER_TEXT.as_bytes());

        let (exact_overall, trace) =
            self.overall(&build_engine, &config_file, &qualifier, &exact_filter, true);
        let (compatible_overall, _) =
            self.overall(&build_engine, &config_file, &qualifier, &unfiltered, false);

        let exact = CompositeGraphFingerprint {
            overall: exact_overall,
            build_engine,
            config_file,
            qualifier,
            filter: exact_filter,
            evaluation_filter: Some(filter.clone()),
        };
        let compatible = CompositeGraphFingerprint {
            overall: compatible_overall,
            build_engine,
            config_file,
            qualifier,
            filter: unfiltered,
            evaluation_filter: None,
        };

        debug!(exact = %exact.overall, compatible = %compatible.overall, "computed graph fingerprints");
        Ok(ComputedGraphFingerprints {
            pair: GraphFingerprintPair { exact, compatible },
            trace,
        })
    }

    fn overall(
        &self,
        build_engine: &Fingerprint,
        config_file: &Fingerprint,
        qualifier: &Fingerprint,
        filter: &Fingerprint,
        with_trace: bool,
    ) -> (Fingerprint, Vec<(String, String)>) {
        let config = self.config;
        let mut b = FingerprintBuilder::new();
        b.add_fingerprint("buildEngine", build_engine);
        b.add_fingerprint("configFiles", config_file);
        b.add_fingerprint("qualifiers", qualifier);
        b.add_fingerprint("filter", filter);
        b.add_text("engineVersion", &config.engine_version);
        b.add_text("hostOs", &self.host.os);
        b.add_text("cpuArchitecture", &self.host.cpu_arch);
        b.add_bool("elevated", self.host.elevated);
        b.add_text(
            "objectDirectory",
            &config.object_directory.to_string_lossy(),
        );
        b.add_text("tempDirectory", &config.temp_directory.to_string_lossy());
        b.add_text(
            "sourceDirectory",
            &config.source_directory.to_string_lossy(),
        );
        b.add_text(
            "substTarget",
            &config
                .subst_target
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        b.add_bool("compressGraphFiles", config.compress_graph_files);
        b.add_bool("skipHashSourceFiles", config.skip_hash_source_files);
        b.add_bool("usePipStaticFingerprints", config.use_pip_static_fingerprints);
        if config.use_pip_static_fingerprints {
            if let Some(salt) = &config.extra_fingerprint_salt {
                b.add_text("extraFingerprintSalt", salt);
            }
        }
        if let Some(salt) = &config.cache_salt {
            b.add_text("cacheSalt", salt);
        }
        if let Some(salt) = &self.debug_salt {
            b.add_text("debugSalt", salt);
        }

        let (fingerprint, trace) = b.finish();
        if with_trace { (fingerprint, trace) } else { (fingerprint, Vec::new()) }
    }

    /// Hash of every top-level config file's content, in case-insensitive
    /// filename order.
    async fn config_files_fingerprint(&self) -> Result<Fingerprint> {
        let mut files: Vec<&PathBuf> = self.config.all_config_files().collect();
        files.sort_by(|a, b| case::cmp(&a.to_string_lossy(), &b.to_string_lossy()));

        let mut b = FingerprintBuilder::new();
        for file in files {
            let hash = fs::must_hash_file(file)
                .await
                .with_context(|| format!("hash config file: {file:?}"))?;
            b.add_hash(&file.to_string_lossy(), &hash);
        }
        Ok(b.finish_fingerprint())
    }

    /// The build-engine identity: the explicit commit id when supplied,
    /// otherwise the content hash of every engine deployment file.
    async fn build_engine_fingerprint(&self) -> Result<Fingerprint> {
        if let Some(commit) = &self.config.engine_commit_id {
            let mut b = FingerprintBuilder::new();
            b.add_text("commitId", commit);
            return Ok(b.finish_fingerprint());
        }

        let bin_dir = self.config.engine_bin_directory.clone();
        let mut deployment = spawn_blocking(move || collect_files(&bin_dir))
            .await
            .context("join task")??;
        deployment.sort_by(|a, b| case::cmp(&a.to_string_lossy(), &b.to_string_lossy()));

        let hashes = stream::iter(deployment.iter())
            .map(|path| async move {
                let hash = fs::must_hash_file(path)
                    .await
                    .with_context(|| format!("hash engine file: {path:?}"))?;
                Ok::<_, color_eyre::Report>((path, hash))
            })
            .buffered(fs::DEFAULT_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;

        let mut b = FingerprintBuilder::new();
        for (path, hash) in hashes {
            b.add_hash(&path.to_string_lossy(), &hash);
        }
        Ok(b.finish_fingerprint())
    }

    fn qualifier_fingerprint(&self) -> Fingerprint {
        let mut b = FingerprintBuilder::new();
        for qualifier in self.config.sorted_qualifiers() {
            b.add_text("qualifier", &qualifier.canonical());
        }
        b.finish_fingerprint()
    }
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("walk deployment: {dir:?}"))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::config::Qualifier;

    fn config(dir: &TempDir) -> EngineConfiguration {
        let root = dir.path();
        std::fs::write(root.join("config.bc"), b"config v1").unwrap();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin").join("engine"), b"binary").unwrap();
        EngineConfiguration::builder()
            .config_file(root.join("config.bc"))
            .object_directory(root.join("obj"))
            .temp_directory(root.join("tmp"))
            .source_directory(root.to_path_buf())
            .engine_cache_directory(root.join("cache"))
            .engine_bin_directory(root.join("bin"))
            .engine_version("0.1.0".into())
            .qualifiers(vec![Qualifier::new([("configuration", "debug")])])
            .build()
    }

    fn fingerprinter(config: &EngineConfiguration) -> GraphFingerprinter<'_> {
        GraphFingerprinter::builder()
            .config(config)
            .host(HostIdentity::current(false))
            .build()
    }

    #[tokio::test]
    async fn identical_inputs_produce_identical_fingerprints() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let a = fingerprinter(&config).compute().await.unwrap();
        let b = fingerprinter(&config).compute().await.unwrap();
        pretty_assert_eq!(a.pair, b.pair);
    }

    #[tokio::test]
    async fn config_content_change_moves_config_dimension() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let before = fingerprinter(&config).compute().await.unwrap();

        std::fs::write(dir.path().join("config.bc"), b"config v2").unwrap();
        let after = fingerprinter(&config).compute().await.unwrap();

        assert_ne!(before.pair.exact.config_file, after.pair.exact.config_file);
        assert_ne!(before.pair.exact.overall, after.pair.exact.overall);
        pretty_assert_eq!(before.pair.exact.build_engine, after.pair.exact.build_engine);
    }

    #[tokio::test]
    async fn filter_only_affects_exact() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        let unfiltered = fingerprinter(&config).compute().await.unwrap();

        config.evaluation_filter.module_names.insert("m1".into());
        let filtered = fingerprinter(&config).compute().await.unwrap();

        assert_ne!(
            unfiltered.pair.exact.overall,
            filtered.pair.exact.overall
        );
        pretty_assert_eq!(
            unfiltered.pair.compatible.overall,
            filtered.pair.compatible.overall
        );
    }

    #[tokio::test]
    async fn commit_id_replaces_deployment_hashing() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.engine_commit_id = Some("abc123".into());
        let a = fingerprinter(&config).compute().await.unwrap();

        // Changing the deployed binary is invisible under a commit id.
        std::fs::write(dir.path().join("bin").join("engine"), b"binary v2").unwrap();
        let b = fingerprinter(&config).compute().await.unwrap();
        pretty_assert_eq!(a.pair.exact.build_engine, b.pair.exact.build_engine);
    }

    #[tokio::test]
    async fn debug_salt_moves_overall_only() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let plain = fingerprinter(&config).compute().await.unwrap();
        let salted = GraphFingerprinter::builder()
            .config(&config)
            .host(HostIdentity::current(false))
            .debug_salt("salty".into())
            .build()
            .compute()
            .await
            .unwrap();

        assert_ne!(plain.pair.exact.overall, salted.pair.exact.overall);
        pretty_assert_eq!(plain.pair.exact.config_file, salted.pair.exact.config_file);
    }

    #[tokio::test]
    async fn missing_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.config_file = dir.path().join("missing.bc");
        assert!(fingerprinter(&config).compute().await.is_err());
    }

    #[tokio::test]
    async fn trace_names_every_dimension() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let computed = fingerprinter(&config).compute().await.unwrap();
        let trace = computed.render_trace();
        for name in ["buildEngine", "configFiles", "qualifiers", "filter"] {
            assert!(trace.contains(name), "trace missing {name}: {trace}");
        }
    }

    #[tokio::test]
    async fn composite_wire_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.evaluation_filter.value_names.insert("v".into());
        let computed = fingerprinter(&config).compute().await.unwrap();

        let mut writer = WireWriter::new();
        computed.pair.exact.to_wire(&mut writer);
        let bytes = writer.into_bytes();
        let restored =
            CompositeGraphFingerprint::from_wire(&mut WireReader::new(&bytes)).unwrap();
        pretty_assert_eq!(restored, computed.pair.exact);
    }
}
