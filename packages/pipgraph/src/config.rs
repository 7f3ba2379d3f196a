//! Invocation configuration consumed by the graph-reuse core.
//!
//! The spec-language front-end owns the full configuration surface; this
//! module models only the slice that affects graph identity and reuse:
//! qualifiers, the evaluation filter, directory layout, and the flags
//! folded into the composite fingerprint.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
};

use bon::Builder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Environment variable that forces a graph miss regardless of inputs.
pub const FORCE_INVALIDATE_CACHED_GRAPH: &str = "ForceInvalidateCachedGraph";

/// Environment variable adding a debug salt to the overall fingerprint.
pub const DEBUG_GRAPH_FINGERPRINT_SALT: &str = "DebugGraphFingerprintSalt";

/// Environment variable: minimum build duration before optional
/// optimization data is serialized.
pub const POST_EXEC_OPTIMIZE_THRESHOLD: &str = "PostExecOptimizeThreshold";

/// Sentinel recorded for an environment variable that was consulted but
/// unset. Literal and byte-stable; it appears in on-disk tracker records.
pub const UNSET_VARIABLE_MARKER: &str = "[[UnsetEnvironmentVariable]]";

/// Well-known file names under the engine-cache directory.
pub mod cache_paths {
    pub const RUNNING_TIME_TABLE: &str = "RunningTimeTable";
    pub const HISTORIC_METADATA_CACHE: &str = "HistoricMetadataCache";
    pub const PRESERVE_OUTPUTS_SALT: &str = "PreserveOutputsSalt.txt";
}

/// The role this engine instance plays in a build.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize, strum::Display,
)]
pub enum EngineRole {
    /// Single-machine build; no peers.
    #[default]
    Single,
    /// Distributed build coordinator.
    Orchestrator,
    /// Distributed build worker; reuses the orchestrator's graph.
    Worker,
}

/// A build qualifier: an ordered set of name/value pairs such as
/// `configuration=debug;platform=x64`.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Qualifier(BTreeMap<String, String>);

impl Qualifier {
    pub fn new(pairs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Canonical text form: keys sorted, `name=value` joined with `;`.
    pub fn canonical(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).join(";")
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// The evaluation filter: which values, spec roots, and modules the
/// front-end was asked to evaluate. An empty filter evaluates everything.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct EvaluationFilter {
    pub value_names: BTreeSet<String>,
    pub value_roots: BTreeSet<PathBuf>,
    pub module_names: BTreeSet<String>,
}

impl EvaluationFilter {
    /// The unfiltered filter: everything gets evaluated.
    pub fn unfiltered() -> Self {
        Self::default()
    }

    /// Whether this filter evaluates the full build.
    pub fn is_unfiltered(&self) -> bool {
        self.value_names.is_empty() && self.value_roots.is_empty() && self.module_names.is_empty()
    }

    /// Whether a graph evaluated under `previous` contains everything this
    /// filter needs. An unfiltered previous run serves any filter; a
    /// filtered previous run serves only narrower (subset) filters.
    pub fn is_satisfied_by(&self, previous: &EvaluationFilter) -> bool {
        if previous.is_unfiltered() {
            return true;
        }
        if self.is_unfiltered() {
            return false;
        }
        self.value_names.is_subset(&previous.value_names)
            && self.value_roots.is_subset(&previous.value_roots)
            && self.module_names.is_subset(&previous.module_names)
    }

    /// Canonical description folded into the exact fingerprint: each
    /// dimension sorted (sets are already ordered) and labeled.
    pub fn canonical(&self) -> String {
        let roots = self
            .value_roots
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .join(",");
        format!(
            "values:[{}];roots:[{}];modules:[{}]",
            self.value_names.iter().join(","),
            roots,
            self.module_names.iter().join(","),
        )
    }
}

/// Paths and flags describing one invocation of the engine, as consumed
/// by the graph-reuse core.
#[derive(Clone, Debug, Builder)]
pub struct EngineConfiguration {
    /// The primary configuration file of the build.
    pub config_file: PathBuf,
    /// Additional top-level config files whose content hashes feed the
    /// composite fingerprint.
    #[builder(default)]
    pub additional_config_files: Vec<PathBuf>,
    pub object_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub source_directory: PathBuf,
    /// On-disk home of serialized graph bundles.
    pub engine_cache_directory: PathBuf,
    /// Root of the deployed engine binaries, hashed into the build-engine
    /// fingerprint when no commit id is available.
    pub engine_bin_directory: PathBuf,
    pub engine_version: String,
    /// Explicit build-commit identity; supplied for official deployments,
    /// absent for dev builds (which hash the deployment instead).
    pub engine_commit_id: Option<String>,
    #[builder(default)]
    pub qualifiers: Vec<Qualifier>,
    #[builder(default)]
    pub evaluation_filter: EvaluationFilter,
    pub subst_target: Option<PathBuf>,
    #[builder(default)]
    pub compress_graph_files: bool,
    #[builder(default)]
    pub skip_hash_source_files: bool,
    #[builder(default)]
    pub use_pip_static_fingerprints: bool,
    /// Extra fingerprint salts, only folded in when
    /// `use_pip_static_fingerprints` is set.
    pub extra_fingerprint_salt: Option<String>,
    pub cache_salt: Option<String>,
    #[builder(default)]
    pub role: EngineRole,
    /// Whether a reloaded graph may be patched when only specs changed.
    #[builder(default)]
    pub allow_partial_reuse: bool,
    /// Lazy deletion of shared-opaque outputs (see the sideband examiner).
    #[builder(default)]
    pub lazy_shared_opaque_deletion: bool,
    /// Directory holding per-pip sideband files, when configured.
    pub sideband_directory: Option<PathBuf>,
    /// Explicit on-disk graph override; disables engine-cache reuse.
    pub graph_path_override: Option<PathBuf>,
    /// The unsafe "preserve outputs" option; governs the lifetime of the
    /// preserve-outputs salt file.
    #[builder(default)]
    pub unsafe_preserve_outputs: bool,
    pub logs_directory: Option<PathBuf>,
}

impl EngineConfiguration {
    /// Qualifiers in canonical (sorted) order for fingerprinting.
    pub fn sorted_qualifiers(&self) -> Vec<&Qualifier> {
        self.qualifiers.iter().sorted().collect()
    }

    /// All top-level config files, primary first.
    pub fn all_config_files(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.config_file).chain(self.additional_config_files.iter())
    }
}

/// The slice of configuration persisted inside a bundle so a reloaded
/// graph can describe the invocation that produced it.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfigState {
    pub config_file: PathBuf,
    pub qualifiers: Vec<Qualifier>,
    pub evaluation_filter: EvaluationFilter,
    pub subst_target: Option<PathBuf>,
    pub engine_version: String,
}

impl ConfigState {
    pub fn capture(config: &EngineConfiguration) -> Self {
        Self {
            config_file: config.config_file.clone(),
            qualifiers: config.qualifiers.clone(),
            evaluation_filter: config.evaluation_filter.clone(),
            subst_target: config.subst_target.clone(),
            engine_version: config.engine_version.clone(),
        }
    }
}
