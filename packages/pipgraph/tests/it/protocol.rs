//! Protocol-level scenarios: environment and mount verification,
//! filter containment, the content-cache tier, and worker behavior.

use std::collections::HashMap;

use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;

use pipgraph::{
    cache::{CacheFacade, CacheSession, LocalContentCache},
    carry::EngineStateCarry,
    config::{EngineConfiguration, EngineRole, FORCE_INVALIDATE_CACHED_GRAPH},
    engine::InvocationKind,
    fingerprint::{ComputedGraphFingerprints, GraphFingerprinter, HostIdentity},
    fs,
    hash::{ContentHash, Fingerprint},
    journal::ChangeJournalTracker,
    protocol::{
        GraphCacheProtocol, NoPeer, PeerClient, ProtocolOptions, ReuseDecision, ReuseSource,
    },
    tracker::GraphCacheMissReason,
};

use crate::Fixture;

struct StaticPeer {
    fingerprint: Option<Fingerprint>,
    manifest: Option<ContentHash>,
}

impl PeerClient for StaticPeer {
    async fn graph_fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(self.fingerprint)
    }

    async fn symlink_manifest_hash(&self) -> Result<Option<ContentHash>> {
        Ok(self.manifest)
    }
}

async fn build_once(fixture: &Fixture) {
    let summary = fixture
        .engine()
        .run_invocation(
            &fixture.evaluator(),
            None::<&NoPeer>,
            &mut EngineStateCarry::new(),
            ChangeJournalTracker::disabled(),
            &fixture.mounts(),
        )
        .await
        .expect("build succeeds");
    pretty_assert_eq!(summary.kind, InvocationKind::FullBuild);
}

async fn session_for(fixture: &Fixture) -> CacheSession<LocalContentCache> {
    let cas_root = fixture.root().join("shared-cache");
    let facade = CacheFacade::start(async move { LocalContentCache::open(&cas_root).await });
    facade
        .create_for_context("test-protocol")
        .await
        .expect("open session")
}

async fn fingerprints_for(config: &EngineConfiguration) -> ComputedGraphFingerprints {
    GraphFingerprinter::builder()
        .config(config)
        .host(HostIdentity::current(false))
        .build()
        .compute()
        .await
        .expect("fingerprints compute")
}

async fn try_reuse(
    config: &EngineConfiguration,
    session: &CacheSession<LocalContentCache>,
    env: &HashMap<String, String>,
    mounts: &[(String, String)],
    peer: Option<&StaticPeer>,
) -> ReuseDecision {
    let computed = fingerprints_for(config).await;
    GraphCacheProtocol::new(config, session, ChangeJournalTracker::disabled())
        .try_reuse(&computed, env, mounts, peer, &ProtocolOptions::default())
        .await
        .expect("protocol runs")
        .decision
}

#[tokio::test]
async fn env_var_change_misses_with_variable_name() {
    let fixture = Fixture::new().await;
    build_once(&fixture).await;
    let session = session_for(&fixture).await;

    // The evaluator consulted this variable (it was unset); a value now
    // appearing invalidates the record.
    let env: HashMap<String, String> =
        [("PIPGRAPH_TEST_FLAVOR".to_owned(), "spicy".to_owned())].into();
    let decision = try_reuse(&fixture.config, &session, &env, &fixture.mounts(), None).await;

    let ReuseDecision::NoReuse { reason } = decision else {
        panic!("expected no reuse, got {decision:?}");
    };
    pretty_assert_eq!(reason, GraphCacheMissReason::EnvironmentVariableChanged);
}

#[tokio::test]
async fn mount_rebinding_misses() {
    let fixture = Fixture::new().await;
    build_once(&fixture).await;
    let session = session_for(&fixture).await;

    let mounts = [("SourceRoot".to_owned(), "/rebound/elsewhere".to_owned())];
    let decision =
        try_reuse(&fixture.config, &session, &HashMap::new(), &mounts, None).await;

    let ReuseDecision::NoReuse { reason } = decision else {
        panic!("expected no reuse, got {decision:?}");
    };
    pretty_assert_eq!(reason, GraphCacheMissReason::MountChanged);
}

#[tokio::test]
async fn forced_invalidation_misses() {
    let fixture = Fixture::new().await;
    build_once(&fixture).await;
    let session = session_for(&fixture).await;

    let env: HashMap<String, String> =
        [(FORCE_INVALIDATE_CACHED_GRAPH.to_owned(), "1".to_owned())].into();
    let decision = try_reuse(&fixture.config, &session, &env, &fixture.mounts(), None).await;

    let ReuseDecision::NoReuse { reason } = decision else {
        panic!("expected no reuse, got {decision:?}");
    };
    pretty_assert_eq!(reason, GraphCacheMissReason::ForcedMiss);
}

#[tokio::test]
async fn narrower_filter_reuses_the_broader_graph() {
    let fixture = Fixture::new().await;

    // Build under a filter covering both modules.
    let mut broad = fixture.config.clone();
    broad
        .evaluation_filter
        .module_names
        .extend(["alpha".to_owned(), "beta".to_owned()]);
    fixture
        .engine_with_config(broad)
        .run_invocation(
            &fixture.evaluator(),
            None::<&NoPeer>,
            &mut EngineStateCarry::new(),
            ChangeJournalTracker::disabled(),
            &fixture.mounts(),
        )
        .await
        .expect("build succeeds");

    // Ask for a subset: the broader graph serves it.
    let mut narrow = fixture.config.clone();
    narrow.evaluation_filter.module_names.insert("alpha".to_owned());
    let session = session_for(&fixture).await;
    let decision =
        try_reuse(&narrow, &session, &HashMap::new(), &fixture.mounts(), None).await;
    let ReuseDecision::FullReuse { source, .. } = decision else {
        panic!("expected full reuse, got {decision:?}");
    };
    pretty_assert_eq!(source, ReuseSource::EngineCache);

    // A disjoint filter does not.
    let mut disjoint = fixture.config.clone();
    disjoint
        .evaluation_filter
        .module_names
        .insert("gamma".to_owned());
    let decision =
        try_reuse(&disjoint, &session, &HashMap::new(), &fixture.mounts(), None).await;
    let ReuseDecision::NoReuse { reason } = decision else {
        panic!("expected no reuse, got {decision:?}");
    };
    pretty_assert_eq!(reason, GraphCacheMissReason::EvaluationFilterChanged);
}

#[tokio::test]
async fn content_cache_restores_a_scrubbed_engine_cache() {
    let fixture = Fixture::new().await;
    build_once(&fixture).await;

    // Scrub the local bundle; only the content cache still has it.
    tokio::fs::remove_dir_all(&fixture.config.engine_cache_directory)
        .await
        .unwrap();

    let session = session_for(&fixture).await;
    let decision = try_reuse(
        &fixture.config,
        &session,
        &HashMap::new(),
        &fixture.mounts(),
        None,
    )
    .await;
    let ReuseDecision::FullReuse { source, bundle } = decision else {
        panic!("expected full reuse, got {decision:?}");
    };
    pretty_assert_eq!(source, ReuseSource::ContentCache);
    pretty_assert_eq!(bundle.pip_graph.table.len(), 2);

    // Materialization rebuilt the engine cache, previous-inputs included.
    assert!(
        fs::exists(
            &pipgraph::bundle::BundleFileKind::PreviousInputs
                .path_in(&fixture.config.engine_cache_directory)
        )
        .await
    );
}

#[tokio::test]
async fn worker_without_orchestrator_fingerprint_misses() {
    let fixture = Fixture::new().await;
    build_once(&fixture).await;

    let mut worker = fixture.config.clone();
    worker.role = EngineRole::Worker;
    let session = session_for(&fixture).await;

    let peer = StaticPeer {
        fingerprint: None,
        manifest: None,
    };
    let decision = try_reuse(
        &worker,
        &session,
        &HashMap::new(),
        &fixture.mounts(),
        Some(&peer),
    )
    .await;
    let ReuseDecision::NoReuse { reason } = decision else {
        panic!("expected no reuse, got {decision:?}");
    };
    pretty_assert_eq!(reason, GraphCacheMissReason::NoFingerprintFromMaster);
}

#[tokio::test]
async fn worker_fetches_the_orchestrator_graph() {
    let fixture = Fixture::new().await;
    build_once(&fixture).await;

    // The orchestrator hands the worker its input fingerprint.
    let orchestrator_fp = fingerprints_for(&fixture.config).await.pair.exact.overall;

    let mut worker = fixture.config.clone();
    worker.role = EngineRole::Worker;
    worker.engine_cache_directory = fixture.root().join("worker-cache");
    let session = session_for(&fixture).await;

    let peer = StaticPeer {
        fingerprint: Some(orchestrator_fp),
        manifest: None,
    };
    let decision = try_reuse(
        &worker,
        &session,
        &HashMap::new(),
        &fixture.mounts(),
        Some(&peer),
    )
    .await;
    let ReuseDecision::FullReuse { source, bundle } = decision else {
        panic!("expected full reuse, got {decision:?}");
    };
    pretty_assert_eq!(source, ReuseSource::Peer);
    pretty_assert_eq!(bundle.pip_graph.table.len(), 2);
}
