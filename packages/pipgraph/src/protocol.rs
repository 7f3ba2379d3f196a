//! The graph cache protocol: three lookups that turn a fingerprint into
//! a reusable bundle, or decide there is nothing to reuse.
//!
//! Tried in order, each gated by role:
//! 1. the engine cache (the local on-disk bundle from the previous run),
//! 2. the content cache (descriptor lookup plus file materialization),
//! 3. a peer query (workers asking the orchestrator which graph to use).
//!
//! Every candidate goes through the input tracker's verifier; the first
//! categorized miss is surfaced to the user exactly once.

use std::{collections::HashMap, future::Future, path::Path};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, info, instrument, warn};

use crate::{
    bundle::{BundleFileKind, GraphBundle, INTERMEDIATE_SUFFIX, PipGraphCacheDescriptor},
    cache::{CacheSession, ContentCache},
    config::{EngineConfiguration, EngineRole},
    fingerprint::ComputedGraphFingerprints,
    fs,
    hash::{ContentHash, Fingerprint},
    journal::{ChangeJournalTracker, JournalCheckpoint},
    tracker::{
        GraphCacheMissReason, InputMatchResult, InputTracker, PreviousInputs, VerifyContext,
        VerifyOptions,
    },
};

/// Where a reused bundle came from.
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::Display)]
pub enum ReuseSource {
    EngineCache,
    ContentCache,
    Peer,
}

/// What the protocol decided.
#[derive(Debug)]
pub enum ReuseDecision {
    /// The bundle can be used as-is; skip the front-end entirely.
    FullReuse {
        bundle: Box<GraphBundle>,
        source: ReuseSource,
    },
    /// Only spec files changed and partial reload is configured: hand
    /// the reloaded bundle to the partial-reuse coordinator.
    PartialReuse {
        bundle: Box<GraphBundle>,
        verification: InputMatchResult,
    },
    /// Build a new graph from scratch.
    NoReuse { reason: GraphCacheMissReason },
}

/// The protocol's result: the decision plus the change-journal tracker
/// to hand to the new invocation's input tracker (reconciled against
/// whatever record was examined).
pub struct ReuseAttempt {
    pub decision: ReuseDecision,
    pub journal: ChangeJournalTracker,
}

/// Peer capability used by workers: ask the orchestrator which graph it
/// built.
pub trait PeerClient: Send + Sync {
    fn graph_fingerprint(&self) -> impl Future<Output = Result<Option<Fingerprint>>> + Send;

    fn symlink_manifest_hash(&self) -> impl Future<Output = Result<Option<ContentHash>>> + Send;
}

/// The peer of a build that has none.
#[derive(Debug, Default)]
pub struct NoPeer;

impl PeerClient for NoPeer {
    async fn graph_fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(None)
    }

    async fn symlink_manifest_hash(&self) -> Result<Option<ContentHash>> {
        Ok(None)
    }
}

/// Options beyond configuration that gate individual tiers.
#[derive(Clone, Debug, Default)]
pub struct ProtocolOptions {
    /// In-memory flag: the carried engine state already holds this
    /// graph, so the on-disk engine-cache check is skipped.
    pub force_use_cached: bool,
    pub verify: VerifyOptions,
}

pub struct GraphCacheProtocol<'a, C: ContentCache> {
    config: &'a EngineConfiguration,
    session: &'a CacheSession<C>,
    journal: ChangeJournalTracker,
}

impl<'a, C: ContentCache> GraphCacheProtocol<'a, C> {
    pub fn new(
        config: &'a EngineConfiguration,
        session: &'a CacheSession<C>,
        journal: ChangeJournalTracker,
    ) -> Self {
        Self {
            config,
            session,
            journal,
        }
    }

    /// Run the three-tier lookup.
    #[instrument(skip_all)]
    pub async fn try_reuse<P: PeerClient>(
        self,
        fingerprints: &ComputedGraphFingerprints,
        current_env: &HashMap<String, String>,
        current_mounts: &[(String, String)],
        peer: Option<&P>,
        options: &ProtocolOptions,
    ) -> Result<ReuseAttempt> {
        let mut first_miss: Option<(GraphCacheMissReason, Option<String>)> = None;
        let mut journal = self.journal.clone();

        // Tier 1: the engine cache.
        let skip_engine_cache = self.config.graph_path_override.is_some()
            || self.config.role != EngineRole::Single
            || options.force_use_cached;
        if skip_engine_cache {
            debug!(
                override_set = self.config.graph_path_override.is_some(),
                role = %self.config.role,
                force_use_cached = options.force_use_cached,
                "skipping engine cache lookup"
            );
        } else {
            let (outcome, reconciled) = self
                .check_engine_cache(fingerprints, current_env, current_mounts, options)
                .await?;
            journal = reconciled;
            match outcome {
                EngineCacheOutcome::Hit(bundle) => {
                    return Ok(ReuseAttempt {
                        decision: ReuseDecision::FullReuse {
                            bundle,
                            source: ReuseSource::EngineCache,
                        },
                        journal,
                    });
                }
                EngineCacheOutcome::SpecsChanged(bundle, verification)
                    if self.config.allow_partial_reuse =>
                {
                    report_first_miss(
                        GraphCacheMissReason::SpecFileChanges,
                        verification.first_miss_identifier.as_deref(),
                    );
                    return Ok(ReuseAttempt {
                        decision: ReuseDecision::PartialReuse {
                            bundle,
                            verification,
                        },
                        journal,
                    });
                }
                EngineCacheOutcome::SpecsChanged(_, verification) => {
                    first_miss = Some((
                        GraphCacheMissReason::SpecFileChanges,
                        verification.first_miss_identifier,
                    ));
                }
                EngineCacheOutcome::Miss(reason, identifier) => {
                    first_miss = Some((reason, identifier));
                }
            }
        }

        // Tier 2: the content cache. Workers go through their peer first.
        if self.config.role != EngineRole::Worker {
            let input_fp = fingerprints.pair.exact.overall;
            if let Some(bundle) = self
                .fetch_from_content_cache(&input_fp, fingerprints, current_env, current_mounts, options)
                .await?
            {
                return Ok(ReuseAttempt {
                    decision: ReuseDecision::FullReuse {
                        bundle,
                        source: ReuseSource::ContentCache,
                    },
                    journal,
                });
            }
            if first_miss.is_none() {
                first_miss = Some((GraphCacheMissReason::FingerprintChanged, None));
            }
        }

        // Tier 3: the peer query, workers only.
        if self.config.role == EngineRole::Worker {
            let Some(peer) = peer else {
                let (reason, identifier) =
                    (GraphCacheMissReason::NoFingerprintFromMaster, None::<String>);
                report_first_miss(reason, identifier.as_deref());
                return Ok(ReuseAttempt {
                    decision: ReuseDecision::NoReuse { reason },
                    journal,
                });
            };
            match self.fetch_from_peer(peer).await? {
                Some(bundle) => {
                    return Ok(ReuseAttempt {
                        decision: ReuseDecision::FullReuse {
                            bundle,
                            source: ReuseSource::Peer,
                        },
                        journal,
                    });
                }
                None => {
                    first_miss = Some((GraphCacheMissReason::NoFingerprintFromMaster, None));
                }
            }
        }

        let (reason, identifier) =
            first_miss.unwrap_or((GraphCacheMissReason::NoPreviousRunToCheck, None));
        report_first_miss(reason, identifier.as_deref());
        debug!("graph fingerprint trace:\n{}", fingerprints.render_trace());
        Ok(ReuseAttempt {
            decision: ReuseDecision::NoReuse { reason },
            journal,
        })
    }

    async fn check_engine_cache(
        &self,
        fingerprints: &ComputedGraphFingerprints,
        current_env: &HashMap<String, String>,
        current_mounts: &[(String, String)],
        options: &ProtocolOptions,
    ) -> Result<(EngineCacheOutcome, ChangeJournalTracker)> {
        let dir = &self.config.engine_cache_directory;
        let Some((bundle, inputs_body)) = GraphBundle::load(dir).await? else {
            return Ok((
                EngineCacheOutcome::Miss(GraphCacheMissReason::NoPreviousRunToCheck, None),
                self.journal.clone().start_fresh(),
            ));
        };

        let previous = match PreviousInputs::decode(&inputs_body) {
            Ok(previous) => previous,
            Err(err) => {
                warn!(?err, "previous-inputs record is unreadable");
                return Ok((
                    EngineCacheOutcome::Miss(GraphCacheMissReason::NoPreviousRunToCheck, None),
                    self.journal.clone().start_fresh(),
                ));
            }
        };

        // A loaded journal whose token differs from the record cannot
        // attest it; reconcile before verification.
        let journal = self.journal.clone().reconcile(previous.save_token);

        let checkpoint_path =
            BundleFileKind::PreviousInputsJournalCheckpoint.path_in(dir);
        let checkpoint = JournalCheckpoint::read(&checkpoint_path).await?;

        let verification = InputTracker::check_if_available_inputs_match_previous_run(
            &previous,
            VerifyContext {
                current_env,
                current_mounts,
                current_fingerprints: &fingerprints.pair,
                journal: &journal,
                checkpoint,
                checkpoint_path: Some(&checkpoint_path),
            },
            &options.verify,
        )
        .await;

        if verification.matches {
            debug!(files_checked = verification.files_checked, "engine cache hit");
            return Ok((EngineCacheOutcome::Hit(Box::new(bundle)), journal));
        }

        let reason = verification
            .miss_reason
            .unwrap_or(GraphCacheMissReason::CheckFailed);
        if reason.allows_partial_reuse() {
            return Ok((
                EngineCacheOutcome::SpecsChanged(Box::new(bundle), verification),
                journal,
            ));
        }
        Ok((
            EngineCacheOutcome::Miss(reason, verification.first_miss_identifier),
            journal,
        ))
    }

    /// Look up a descriptor, materialize the referenced files into the
    /// engine cache directory, and verify the result.
    async fn fetch_from_content_cache(
        &self,
        fingerprint: &Fingerprint,
        fingerprints: &ComputedGraphFingerprints,
        current_env: &HashMap<String, String>,
        current_mounts: &[(String, String)],
        options: &ProtocolOptions,
    ) -> Result<Option<Box<GraphBundle>>> {
        let Some(descriptor) = self.session.try_lookup_two_phase(fingerprint).await? else {
            debug!(%fingerprint, "no descriptor in content cache");
            return Ok(None);
        };

        if !self.materialize_descriptor(&descriptor).await? {
            return Ok(None);
        }

        let dir = &self.config.engine_cache_directory;
        let Some((bundle, inputs_body)) = GraphBundle::load(dir).await? else {
            warn!("materialized bundle failed to load");
            return Ok(None);
        };

        // The descriptor was stored under the input fingerprint, but the
        // workspace may have moved since; the fetched record is verified
        // like any other candidate.
        let previous = match PreviousInputs::decode(&inputs_body) {
            Ok(previous) => previous,
            Err(err) => {
                warn!(?err, "fetched previous-inputs record is unreadable");
                return Ok(None);
            }
        };
        let journal = self.journal.clone().reconcile(previous.save_token);
        let verification = InputTracker::check_if_available_inputs_match_previous_run(
            &previous,
            VerifyContext {
                current_env,
                current_mounts,
                current_fingerprints: &fingerprints.pair,
                journal: &journal,
                checkpoint: None,
                checkpoint_path: None,
            },
            &options.verify,
        )
        .await;
        if !verification.matches {
            debug!(?verification.miss_reason, "fetched bundle failed verification");
            return Ok(None);
        }
        Ok(Some(Box::new(bundle)))
    }

    /// Materialize every file a descriptor references, committing the
    /// previous-inputs file through its intermediate name last.
    async fn materialize_descriptor(&self, descriptor: &PipGraphCacheDescriptor) -> Result<bool> {
        let dir = &self.config.engine_cache_directory;
        fs::create_dir_all(dir).await?;

        let previous_inputs_name = BundleFileKind::PreviousInputs.file_name();
        let mut inputs_hash = None;
        for (name, hash) in &descriptor.files {
            if name == previous_inputs_name {
                inputs_hash = Some(*hash);
                continue;
            }
            let target = dir.join(name);
            if !self.session.try_materialize(&target, hash).await? {
                warn!(%name, %hash, "content cache is missing a bundle file");
                return Ok(false);
            }
        }

        let Some(inputs_hash) = inputs_hash else {
            warn!("descriptor does not reference a previous-inputs file");
            return Ok(false);
        };
        let final_path = dir.join(previous_inputs_name);
        let intermediate = fs::sibling_with_suffix(&final_path, INTERMEDIATE_SUFFIX);
        if !self.session.try_materialize(&intermediate, &inputs_hash).await? {
            warn!("content cache is missing the previous-inputs file");
            return Ok(false);
        }
        fs::rename(&intermediate, &final_path).await?;
        Ok(true)
    }

    /// Worker path: ask the orchestrator for its graph fingerprint, then
    /// fetch that graph (and the symlink manifest) from the content
    /// cache. The fetched graph is used as-is; the orchestrator already
    /// verified inputs.
    async fn fetch_from_peer<P: PeerClient>(&self, peer: &P) -> Result<Option<Box<GraphBundle>>> {
        let Some(fingerprint) = peer.graph_fingerprint().await? else {
            debug!("orchestrator returned no graph fingerprint");
            return Ok(None);
        };

        let Some(descriptor) = self.session.try_lookup_two_phase(&fingerprint).await? else {
            warn!(%fingerprint, "orchestrator's graph descriptor is not in the content cache");
            return Ok(None);
        };
        if !self.materialize_descriptor(&descriptor).await? {
            return Ok(None);
        }

        if let Some(manifest_hash) = peer.symlink_manifest_hash().await? {
            let target = self.config.engine_cache_directory.join("SymlinkManifest");
            if !self.session.try_materialize(&target, &manifest_hash).await? {
                warn!(%manifest_hash, "symlink manifest is not in the content cache");
            }
        }

        let dir = &self.config.engine_cache_directory;
        match GraphBundle::load(dir).await? {
            Some((bundle, _)) => Ok(Some(Box::new(bundle))),
            None => {
                warn!("materialized peer bundle failed to load");
                Ok(None)
            }
        }
    }

    /// Publish a committed bundle to the content cache under both its
    /// input-based and content fingerprints.
    ///
    /// Storage failures are warnings: the build's correctness does not
    /// depend on the save. Returns whether the store completed.
    #[instrument(skip_all)]
    pub async fn store_in_content_cache(
        session: &CacheSession<C>,
        dir: &Path,
        input_fingerprint: &Fingerprint,
        trace_info: String,
    ) -> bool {
        let result = async {
            let mut descriptor = GraphBundle::describe(dir, trace_info).await?;
            for name in descriptor.files.keys().cloned().collect::<Vec<_>>() {
                let path = dir.join(&name);
                let hash = session.try_store_content(&path).await?;
                descriptor.files.insert(name, hash);
            }
            let content_fingerprint = descriptor.content_fingerprint();
            session
                .try_store_two_phase(input_fingerprint, &content_fingerprint, &descriptor)
                .await
                .context("store graph descriptor")
        }
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, "failed to store graph bundle in the content cache");
                false
            }
        }
    }
}

enum EngineCacheOutcome {
    Hit(Box<GraphBundle>),
    SpecsChanged(Box<GraphBundle>, InputMatchResult),
    Miss(GraphCacheMissReason, Option<String>),
}

/// The single user-facing miss diagnostic.
fn report_first_miss(reason: GraphCacheMissReason, identifier: Option<&str>) {
    info!(
        category = %reason,
        first_miss = identifier.unwrap_or("<none>"),
        "pip graph was not reused"
    );
}
