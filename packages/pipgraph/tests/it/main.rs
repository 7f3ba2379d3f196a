//! Integration tests for the graph-reuse core.
//!
//! Each test drives a small on-disk workspace through real invocations:
//! a primary config file, a deployed "engine binary", and a directory of
//! spec files that the test evaluator turns into one pip each.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use tempfile::TempDir;

use pipgraph::{
    bundle::HistoricTableSizes,
    cache::{CacheFacade, LocalContentCache},
    config::{ConfigState, EngineConfiguration, Qualifier},
    engine::{Engine, EvaluatedGraph, GraphEvaluator, PatchedGraph},
    fs,
    hash::{ContentHash, Fingerprint},
    ledger::InvocationLedger,
    mounts::{Mount, MountExpander},
    paths::{NameTable, PathTable},
    patch::PatchablePipGraph,
    pips::{DirectedGraphBuilder, Pip, PipGraph, PipKind, PipTable, Provenance},
    tracker::InputTracker,
};

pub mod protocol;
pub mod reuse;

/// An on-disk workspace: config file, engine deployment, and specs.
pub struct Fixture {
    pub dir: TempDir,
    pub config: EngineConfiguration,
}

impl Fixture {
    pub async fn new() -> Fixture {
        let dir = TempDir::new().expect("create workspace");
        let root = dir.path();

        fs::write(&root.join("config.bc"), b"root config v1")
            .await
            .expect("write config");
        fs::write(&root.join("bin").join("engine"), b"engine binary v1")
            .await
            .expect("write engine binary");
        fs::write(&root.join("specs").join("alpha.dsc"), b"pips of alpha v1")
            .await
            .expect("write spec");
        fs::write(&root.join("specs").join("beta.dsc"), b"pips of beta v1")
            .await
            .expect("write spec");

        let config = EngineConfiguration::builder()
            .config_file(root.join("config.bc"))
            .object_directory(root.join("obj"))
            .temp_directory(root.join("tmp"))
            .source_directory(root.join("specs"))
            .engine_cache_directory(root.join("engine-cache"))
            .engine_bin_directory(root.join("bin"))
            .engine_version("0.1.0".into())
            .qualifiers(vec![Qualifier::new([("configuration", "debug")])])
            .allow_partial_reuse(true)
            .build();
        Fixture { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.root().join("specs")
    }

    pub fn engine(&self) -> Engine<LocalContentCache> {
        self.engine_with_config(self.config.clone())
    }

    pub fn engine_with_config(&self, config: EngineConfiguration) -> Engine<LocalContentCache> {
        let cas_root = self.root().join("shared-cache");
        let facade = CacheFacade::start(async move { LocalContentCache::open(&cas_root).await });
        let ledger = InvocationLedger::at(self.root().join("builds.tsv"));
        Engine::new(config, facade, ledger)
    }

    pub fn evaluator(&self) -> SpecDirEvaluator {
        SpecDirEvaluator {
            specs_dir: self.specs_dir(),
            config: self.config.clone(),
        }
    }

    /// The mount bindings this workspace presents on every invocation.
    pub fn mounts(&self) -> Vec<(String, String)> {
        vec![(
            "SourceRoot".to_owned(),
            self.specs_dir().to_string_lossy().into_owned(),
        )]
    }
}

/// A front-end stand-in: every `.dsc` file in the specs directory
/// becomes one process pip whose identity follows the file's content.
pub struct SpecDirEvaluator {
    pub specs_dir: PathBuf,
    pub config: EngineConfiguration,
}

impl SpecDirEvaluator {
    async fn read_specs(&self, tracker: &InputTracker) -> Result<Vec<(PathBuf, ContentHash)>> {
        tracker.track_directory(&self.specs_dir, None).await?;

        let mut specs = Vec::new();
        let members = fs::list_dir(&self.specs_dir)
            .await?
            .expect("specs directory exists");
        for member in members {
            if !member.name.ends_with(".dsc") {
                continue;
            }
            let path = self.specs_dir.join(&member.name);
            let hash = tracker.register_file_access(&path).await?;
            specs.push((path, hash));
        }
        specs.sort();
        Ok(specs)
    }

    fn pip_for(path: &Path, content: &ContentHash, path_table: &mut PathTable) -> Result<Pip> {
        let spec_file = path_table.intern(path)?;
        let name = path.file_name().expect("spec has a name").to_string_lossy();
        let mut semi_stable = [0u8; 8];
        semi_stable.copy_from_slice(&content.as_bytes()[..8]);
        Ok(Pip {
            semi_stable_hash: u64::from_le_bytes(semi_stable),
            static_fingerprint: Fingerprint::from_buffer(
                [name.as_bytes(), content.as_bytes()].concat(),
            ),
            kind: PipKind::Process {
                shared_opaque_roots: vec![],
            },
            provenance: Provenance {
                module_name: name.trim_end_matches(".dsc").to_owned(),
                spec_file,
            },
        })
    }
}

impl GraphEvaluator for SpecDirEvaluator {
    async fn evaluate(&self, tracker: &InputTracker) -> Result<EvaluatedGraph> {
        let specs = self.read_specs(tracker).await?;

        let mut path_table = PathTable::new();
        let src_root = path_table.intern(&self.specs_dir)?;
        let mut mounts = MountExpander::new();
        mounts
            .global_mut()
            .add(&path_table, Mount::readonly("SourceRoot", src_root))?;

        let mut string_table = NameTable::new();
        let mut table = PipTable::new();
        let mut builder = DirectedGraphBuilder::new();
        let mut previous = None;
        for (path, content) in &specs {
            let pip = Self::pip_for(path, content, &mut path_table)?;
            string_table.intern(&pip.provenance.module_name);
            let id = table.add(pip);
            builder.ensure_node(id);
            // Specs evaluate in order; each module consumes its
            // predecessor's outputs in this toy front-end.
            if let Some(prev) = previous {
                builder.add_edge(prev, id);
            }
            previous = Some(id);
        }

        Ok(EvaluatedGraph {
            bundle: pipgraph::bundle::GraphBundle {
                path_table,
                string_table,
                symbol_table: NameTable::new(),
                qualifier_table: NameTable::new(),
                pip_graph: PipGraph::seal(table, builder)?,
                mounts,
                historic_sizes: HistoricTableSizes::default(),
                config_state: ConfigState::capture(&self.config),
            },
            consumed_env_vars: vec!["PIPGRAPH_TEST_FLAVOR".to_owned()],
        })
    }

    async fn patch(
        &self,
        tracker: &InputTracker,
        mut graph: PatchablePipGraph,
        _changed_paths: &[String],
    ) -> Result<PatchedGraph> {
        // Re-emit everything; unchanged pips collapse onto their
        // reloaded identities by static fingerprint.
        let specs = self.read_specs(tracker).await?;
        let mut path_table = PathTable::new();
        let mut previous = None;
        for (path, content) in &specs {
            let pip = Self::pip_for(path, content, &mut path_table)?;
            let id = graph.add_pip(pip);
            if let Some(prev) = previous {
                graph.add_edge(prev, id);
            }
            previous = Some(id);
        }
        Ok(PatchedGraph {
            pip_graph: graph.seal()?,
            consumed_env_vars: vec!["PIPGRAPH_TEST_FLAVOR".to_owned()],
        })
    }
}
