//! The invocation driver: the control flow that ties the reuse core
//! together for one engine invocation.
//!
//! Order of operations: take the folder lock, append the invocation
//! ledger, compute the graph fingerprints, run the cache protocol, then
//! either install a reused graph or drive the front-end (full build or
//! patch) and publish the result. The sideband examiner runs before the
//! summary is returned so the scheduler knows whether output deletion is
//! eager or postponed.
//!
//! The spec-language front-end is an external collaborator, injected as
//! a [`GraphEvaluator`].

use std::{
    collections::HashMap,
    future::Future,
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    bundle::{BundleFileKind, GraphBundle},
    cache::{CacheFacade, CacheSession, ContentCache},
    carry::EngineStateCarry,
    config::{
        DEBUG_GRAPH_FINGERPRINT_SALT, EngineConfiguration, POST_EXEC_OPTIMIZE_THRESHOLD,
        cache_paths,
    },
    fingerprint::{ComputedGraphFingerprints, GraphFingerprinter, HostIdentity},
    fs,
    journal::{ChangeJournalTracker, JournalCheckpoint},
    ledger::{InvocationLedger, InvocationRecord},
    lock::FolderLock,
    mounts::MountExpander,
    patch::{PartialReuseCoordinator, PatchablePipGraph},
    paths::PathTable,
    pips::PipGraph,
    protocol::{GraphCacheProtocol, PeerClient, ProtocolOptions, ReuseDecision, ReuseSource},
    sideband::{SidebandDecision, SidebandExaminer},
    tracker::{GraphCacheMissReason, InputTracker},
};

/// How long an invocation waits for the output-directory lock.
const LOCK_TOTAL_WAIT: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A freshly evaluated graph plus the environment variables the
/// front-end consulted while evaluating.
pub struct EvaluatedGraph {
    pub bundle: GraphBundle,
    pub consumed_env_vars: Vec<String>,
}

/// The result of re-emitting changed modules into a patchable graph.
pub struct PatchedGraph {
    pub pip_graph: PipGraph,
    pub consumed_env_vars: Vec<String>,
}

/// The spec-language front-end, as the reuse core sees it.
pub trait GraphEvaluator: Send + Sync {
    /// Evaluate all specs into a fresh graph, registering every input
    /// with the tracker along the way.
    fn evaluate(
        &self,
        tracker: &InputTracker,
    ) -> impl Future<Output = Result<EvaluatedGraph>> + Send;

    /// Re-emit only the modules affected by `changed_paths` into the
    /// patchable graph.
    fn patch(
        &self,
        tracker: &InputTracker,
        graph: PatchablePipGraph,
        changed_paths: &[String],
    ) -> impl Future<Output = Result<PatchedGraph>> + Send;
}

/// How the invocation obtained its graph.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InvocationKind {
    FullReuse(ReuseSource),
    PartialReuse,
    FullBuild,
}

/// What one invocation produced. The graph itself moves into the state
/// carry for the next invocation.
#[derive(Debug)]
pub struct InvocationSummary {
    pub kind: InvocationKind,
    pub graph_id: Uuid,
    pub pip_count: usize,
    pub sideband: SidebandDecision,
    /// Why full reuse didn't happen, when it didn't.
    pub miss_reason: Option<GraphCacheMissReason>,
}

pub struct Engine<C: ContentCache> {
    config: EngineConfiguration,
    facade: CacheFacade<C>,
    ledger: InvocationLedger,
}

impl<C: ContentCache> Engine<C> {
    pub fn new(
        config: EngineConfiguration,
        facade: CacheFacade<C>,
        ledger: InvocationLedger,
    ) -> Self {
        Self {
            config,
            facade,
            ledger,
        }
    }

    pub fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    /// Run one invocation end to end.
    #[instrument(skip_all)]
    pub async fn run_invocation<E: GraphEvaluator, P: PeerClient>(
        &self,
        evaluator: &E,
        peer: Option<&P>,
        carry: &mut EngineStateCarry,
        journal: ChangeJournalTracker,
        current_mounts: &[(String, String)],
    ) -> Result<InvocationSummary> {
        let started = Instant::now();
        let _lock = FolderLock::take(
            &self.config.object_directory,
            LOCK_TOTAL_WAIT,
            LOCK_RETRY_INTERVAL,
        )
        .await?;

        if let Err(err) = self.ledger.append(&self.invocation_record()).await {
            warn!(?err, "failed to append the invocation ledger");
        }
        self.refresh_preserve_outputs_salt().await?;

        let current_env: HashMap<String, String> = std::env::vars().collect();
        let session = self.facade.create_for_context("engine-schedule").await?;

        let computed = match self.compute_fingerprints(&current_env).await {
            Ok(computed) => Some(computed),
            Err(err) => {
                // An unfingerprintable invocation cannot be looked up or
                // stored; it still builds.
                warn!(?err, "graph fingerprint computation failed; building without reuse");
                None
            }
        };

        let summary = match &computed {
            Some(computed) => {
                let protocol = GraphCacheProtocol::new(&self.config, &session, journal);
                let attempt = protocol
                    .try_reuse(
                        computed,
                        &current_env,
                        current_mounts,
                        peer,
                        &ProtocolOptions::default(),
                    )
                    .await?;

                match attempt.decision {
                    ReuseDecision::FullReuse { bundle, source } => {
                        // Prefer the carried in-memory context over the
                        // freshly deserialized tables when identities
                        // match.
                        let bundle = match carry.take_for(bundle.pip_graph.id) {
                            Some(carried) => carried,
                            None => *bundle,
                        };
                        self.finish_reused(bundle, source, carry).await
                    }
                    ReuseDecision::PartialReuse {
                        bundle,
                        verification,
                    } => {
                        match PartialReuseCoordinator::prepare(*bundle) {
                            Ok((patchable, shell)) => {
                                let tracker =
                                    InputTracker::new(attempt.journal.start_fresh());
                                let patched = evaluator
                                    .patch(&tracker, patchable, &verification.changed_paths)
                                    .await?;
                                let mut bundle = shell;
                                bundle.pip_graph = patched.pip_graph;
                                self.finish_built(
                                    bundle,
                                    tracker,
                                    patched.consumed_env_vars,
                                    Some(computed),
                                    &session,
                                    InvocationKind::PartialReuse,
                                    Some(GraphCacheMissReason::SpecFileChanges),
                                    carry,
                                )
                                .await?
                            }
                            Err(err) => {
                                debug!(?err, "partial reuse rejected; building from scratch");
                                self.full_build(
                                    evaluator,
                                    attempt.journal,
                                    Some(computed),
                                    &session,
                                    Some(GraphCacheMissReason::SpecFileChanges),
                                    carry,
                                )
                                .await?
                            }
                        }
                    }
                    ReuseDecision::NoReuse { reason } => {
                        self.full_build(
                            evaluator,
                            attempt.journal,
                            Some(computed),
                            &session,
                            Some(reason),
                            carry,
                        )
                        .await?
                    }
                }
            }
            None => {
                self.full_build(
                    evaluator,
                    journal,
                    None,
                    &session,
                    Some(GraphCacheMissReason::CheckFailed),
                    carry,
                )
                .await?
            }
        };

        self.record_running_time(started.elapsed(), &current_env).await;
        session.close();
        info!(kind = ?summary.kind, graph_id = %summary.graph_id, "invocation complete");
        Ok(summary)
    }

    async fn compute_fingerprints(
        &self,
        current_env: &HashMap<String, String>,
    ) -> Result<ComputedGraphFingerprints> {
        let debug_salt = current_env.get(DEBUG_GRAPH_FINGERPRINT_SALT).cloned();
        let fingerprinter = GraphFingerprinter::builder()
            .config(&self.config)
            .host(HostIdentity::current(false))
            .maybe_debug_salt(debug_salt)
            .build();
        fingerprinter.compute().await
    }

    async fn finish_reused(
        &self,
        bundle: GraphBundle,
        source: ReuseSource,
        carry: &mut EngineStateCarry,
    ) -> InvocationSummary {
        let sideband = self.examine_sideband(&bundle).await;
        let summary = InvocationSummary {
            kind: InvocationKind::FullReuse(source),
            graph_id: bundle.pip_graph.id,
            pip_count: bundle.pip_graph.table.len(),
            sideband,
            miss_reason: None,
        };
        carry.store(bundle);
        summary
    }

    async fn full_build<E: GraphEvaluator>(
        &self,
        evaluator: &E,
        journal: ChangeJournalTracker,
        computed: Option<&ComputedGraphFingerprints>,
        session: &CacheSession<C>,
        miss_reason: Option<GraphCacheMissReason>,
        carry: &mut EngineStateCarry,
    ) -> Result<InvocationSummary> {
        let tracker = InputTracker::new(journal.start_fresh());
        let evaluated = evaluator.evaluate(&tracker).await?;
        self.finish_built(
            evaluated.bundle,
            tracker,
            evaluated.consumed_env_vars,
            computed,
            session,
            InvocationKind::FullBuild,
            miss_reason,
            carry,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_built(
        &self,
        mut bundle: GraphBundle,
        tracker: InputTracker,
        consumed_env_vars: Vec<String>,
        computed: Option<&ComputedGraphFingerprints>,
        session: &CacheSession<C>,
        kind: InvocationKind,
        miss_reason: Option<GraphCacheMissReason>,
        carry: &mut EngineStateCarry,
    ) -> Result<InvocationSummary> {
        bundle.record_table_sizes();

        if let Some(computed) = computed {
            let env_records: Vec<(String, Option<String>)> = consumed_env_vars
                .iter()
                .map(|name| (name.clone(), std::env::var(name).ok()))
                .collect();
            let mount_records = mount_bindings(&bundle.mounts, &bundle.path_table);
            let inputs = tracker.capture(&computed.pair, &env_records, &mount_records);
            let body = inputs.encode();

            let dir = &self.config.engine_cache_directory;
            let save = bundle
                .save(
                    dir,
                    &tracker.save_token(),
                    self.config.compress_graph_files,
                    &body,
                )
                .await;
            match save {
                Ok(()) => {
                    let checkpoint = JournalCheckpoint {
                        save_token: tracker.save_token(),
                        cursor: tracker.journal().cursor(),
                    };
                    let checkpoint_path =
                        BundleFileKind::PreviousInputsJournalCheckpoint.path_in(dir);
                    if let Err(err) = checkpoint.write(&checkpoint_path).await {
                        warn!(?err, "failed to write the journal checkpoint");
                    }

                    GraphCacheProtocol::<C>::store_in_content_cache(
                        session,
                        dir,
                        &computed.pair.exact.overall,
                        format!("engine {}", self.config.engine_version),
                    )
                    .await;
                }
                Err(err) => {
                    // The build's correctness does not depend on saving.
                    warn!(?err, "failed to save the graph bundle");
                }
            }
        }

        let sideband = self.examine_sideband(&bundle).await;
        let summary = InvocationSummary {
            kind,
            graph_id: bundle.pip_graph.id,
            pip_count: bundle.pip_graph.table.len(),
            sideband,
            miss_reason,
        };
        carry.store(bundle);
        Ok(summary)
    }

    async fn examine_sideband(&self, bundle: &GraphBundle) -> SidebandDecision {
        let examiner = SidebandExaminer {
            lazy_deletion_enabled: self.config.lazy_shared_opaque_deletion,
            sideband_directory: self.config.sideband_directory.as_deref(),
            filter: &self.config.evaluation_filter,
        };
        examiner.examine(&bundle.pip_graph).await
    }

    fn invocation_record(&self) -> InvocationRecord {
        InvocationRecord {
            session_id: Uuid::new_v4(),
            start_time: jiff::Timestamp::now(),
            primary_config_file: self.config.config_file.clone(),
            logs_folder: self
                .config
                .logs_directory
                .clone()
                .unwrap_or_else(|| self.config.object_directory.join("logs")),
            engine_version: self.config.engine_version.clone(),
            engine_bin_folder: self.config.engine_bin_directory.clone(),
            engine_commit_id: self.config.engine_commit_id.clone(),
        }
    }

    /// Maintain the preserve-outputs salt file: a fresh GUID is minted
    /// when the unsafe option turns on, and the file is removed when it
    /// turns off so the next activation gets a new salt.
    async fn refresh_preserve_outputs_salt(&self) -> Result<()> {
        let path = self
            .config
            .engine_cache_directory
            .join(cache_paths::PRESERVE_OUTPUTS_SALT);
        if !self.config.unsafe_preserve_outputs {
            fs::remove_file_if_exists(&path).await?;
            return Ok(());
        }
        if fs::read(&path).await?.is_none() {
            let salt = Uuid::new_v4();
            fs::write(&path, salt.to_string().as_bytes())
                .await
                .context("write preserve-outputs salt")?;
            debug!(%salt, "minted preserve-outputs salt");
        }
        Ok(())
    }

    /// Serialize optional perf data when the build ran long enough to be
    /// worth it.
    async fn record_running_time(&self, elapsed: Duration, env: &HashMap<String, String>) {
        let threshold_secs: u64 = env
            .get(POST_EXEC_OPTIMIZE_THRESHOLD)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if elapsed < Duration::from_secs(threshold_secs) {
            return;
        }
        let path = self
            .config
            .engine_cache_directory
            .join(cache_paths::RUNNING_TIME_TABLE);
        let mut content = match fs::read_utf8(&path).await {
            Ok(existing) => existing.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "could not read the running-time table");
                return;
            }
        };
        content.push_str(&format!(
            "{}\t{}\n",
            jiff::Timestamp::now(),
            elapsed.as_millis()
        ));
        if let Err(err) = fs::write_atomic(&path, content.as_bytes()).await {
            warn!(?err, "could not update the running-time table");
        }
    }
}

/// The mount bindings recorded into a tracker record: every global-scope
/// mount's name and root path.
pub fn mount_bindings(mounts: &MountExpander, table: &PathTable) -> Vec<(String, String)> {
    mounts
        .global()
        .mounts()
        .iter()
        .map(|mount| {
            (
                mount.name.clone(),
                table.to_path_buf(mount.root).to_string_lossy().into_owned(),
            )
        })
        .collect()
}
