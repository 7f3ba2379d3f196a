//! Engine-level reuse scenarios: cold build, no-op rebuild, spec
//! patching, and bundle tampering.

use pretty_assertions::assert_eq as pretty_assert_eq;

use pipgraph::{
    bundle::{BundleFileKind, INTERMEDIATE_SUFFIX},
    carry::EngineStateCarry,
    engine::{InvocationKind, InvocationSummary},
    fs,
    journal::{ChangeJournalTracker, JournalCheckpoint},
    ledger::InvocationLedger,
    protocol::{NoPeer, ReuseSource},
    tracker::GraphCacheMissReason,
};

use crate::Fixture;

async fn run(fixture: &Fixture, carry: &mut EngineStateCarry) -> InvocationSummary {
    fixture
        .engine()
        .run_invocation(
            &fixture.evaluator(),
            None::<&NoPeer>,
            carry,
            ChangeJournalTracker::disabled(),
            &fixture.mounts(),
        )
        .await
        .expect("invocation succeeds")
}

#[tokio::test]
async fn clean_cold_build_writes_bundle_and_ledger() {
    let fixture = Fixture::new().await;
    let summary = run(&fixture, &mut EngineStateCarry::new()).await;

    pretty_assert_eq!(summary.kind, InvocationKind::FullBuild);
    pretty_assert_eq!(
        summary.miss_reason,
        Some(GraphCacheMissReason::NoPreviousRunToCheck)
    );
    pretty_assert_eq!(summary.pip_count, 2);

    // The bundle committed: previous-inputs is at its final name with no
    // intermediate left behind.
    let cache_dir = &fixture.config.engine_cache_directory;
    let final_inputs = BundleFileKind::PreviousInputs.path_in(cache_dir);
    assert!(fs::exists(&final_inputs).await);
    assert!(!fs::exists(&fs::sibling_with_suffix(&final_inputs, INTERMEDIATE_SUFFIX)).await);
    assert!(fs::exists(&BundleFileKind::PipGraph.path_in(cache_dir)).await);

    // Exactly one version-0 ledger line.
    let ledger = InvocationLedger::at(fixture.root().join("builds.tsv"));
    let entries = ledger.read_entries().await.unwrap();
    pretty_assert_eq!(entries.len(), 1);
    let raw = fs::read_utf8(ledger.path()).await.unwrap().unwrap();
    assert!(raw.starts_with("0\t"));
}

#[tokio::test]
async fn noop_rebuild_reuses_the_engine_cache() {
    let fixture = Fixture::new().await;
    let first = run(&fixture, &mut EngineStateCarry::new()).await;

    let checkpoint_path = BundleFileKind::PreviousInputsJournalCheckpoint
        .path_in(&fixture.config.engine_cache_directory);
    let before = JournalCheckpoint::read(&checkpoint_path)
        .await
        .unwrap()
        .expect("checkpoint written by the first run");

    let second = run(&fixture, &mut EngineStateCarry::new()).await;
    pretty_assert_eq!(
        second.kind,
        InvocationKind::FullReuse(ReuseSource::EngineCache)
    );
    pretty_assert_eq!(second.graph_id, first.graph_id);
    pretty_assert_eq!(second.pip_count, first.pip_count);

    // The checkpoint survives under the existing atomic token.
    let after = JournalCheckpoint::read(&checkpoint_path)
        .await
        .unwrap()
        .expect("checkpoint still present");
    pretty_assert_eq!(after.save_token, before.save_token);
}

#[tokio::test]
async fn carried_context_serves_repeat_invocations() {
    let fixture = Fixture::new().await;
    let mut carry = EngineStateCarry::new();

    let first = run(&fixture, &mut carry).await;
    pretty_assert_eq!(carry.carried_graph_id(), Some(first.graph_id));

    let second = run(&fixture, &mut carry).await;
    pretty_assert_eq!(
        second.kind,
        InvocationKind::FullReuse(ReuseSource::EngineCache)
    );
    pretty_assert_eq!(carry.carried_graph_id(), Some(first.graph_id));
}

#[tokio::test]
async fn touched_spec_patches_the_graph() {
    let fixture = Fixture::new().await;
    let first = run(&fixture, &mut EngineStateCarry::new()).await;
    pretty_assert_eq!(first.pip_count, 2);

    fs::write(
        &fixture.specs_dir().join("alpha.dsc"),
        b"pips of alpha v2",
    )
    .await
    .unwrap();

    let second = run(&fixture, &mut EngineStateCarry::new()).await;
    pretty_assert_eq!(second.kind, InvocationKind::PartialReuse);
    pretty_assert_eq!(
        second.miss_reason,
        Some(GraphCacheMissReason::SpecFileChanges)
    );
    // Beta's pip kept its identity; alpha re-emitted as a fresh pip next
    // to its stale predecessor.
    pretty_assert_eq!(second.pip_count, 3);
    assert_ne!(second.graph_id, first.graph_id);

    // The patched graph was committed, so an untouched third run reuses
    // it outright.
    let third = run(&fixture, &mut EngineStateCarry::new()).await;
    pretty_assert_eq!(
        third.kind,
        InvocationKind::FullReuse(ReuseSource::EngineCache)
    );
    pretty_assert_eq!(third.graph_id, second.graph_id);
}

#[tokio::test]
async fn partial_reuse_disabled_builds_from_scratch() {
    let fixture = Fixture::new().await;
    run(&fixture, &mut EngineStateCarry::new()).await;

    fs::write(
        &fixture.specs_dir().join("alpha.dsc"),
        b"pips of alpha v2",
    )
    .await
    .unwrap();

    let mut config = fixture.config.clone();
    config.allow_partial_reuse = false;
    let summary = fixture
        .engine_with_config(config)
        .run_invocation(
            &fixture.evaluator(),
            None::<&NoPeer>,
            &mut EngineStateCarry::new(),
            ChangeJournalTracker::disabled(),
            &fixture.mounts(),
        )
        .await
        .unwrap();
    pretty_assert_eq!(summary.kind, InvocationKind::FullBuild);
    pretty_assert_eq!(summary.pip_count, 2);
}

#[tokio::test]
async fn tampered_bundle_reads_as_no_previous_run() {
    let fixture = Fixture::new().await;
    run(&fixture, &mut EngineStateCarry::new()).await;

    // Truncate the pip graph file by one byte.
    let path = BundleFileKind::PipGraph.path_in(&fixture.config.engine_cache_directory);
    let bytes = fs::read(&path).await.unwrap().unwrap();
    fs::write(&path, &bytes[..bytes.len() - 1]).await.unwrap();

    // Not fatal: the envelope checksum fails, the bundle is treated as
    // absent, and the build proceeds from scratch.
    let summary = run(&fixture, &mut EngineStateCarry::new()).await;
    pretty_assert_eq!(summary.kind, InvocationKind::FullBuild);
    pretty_assert_eq!(
        summary.miss_reason,
        Some(GraphCacheMissReason::NoPreviousRunToCheck)
    );
}

#[tokio::test]
async fn config_content_change_forces_full_build() {
    let fixture = Fixture::new().await;
    run(&fixture, &mut EngineStateCarry::new()).await;

    fs::write(&fixture.root().join("config.bc"), b"root config v2")
        .await
        .unwrap();

    let summary = run(&fixture, &mut EngineStateCarry::new()).await;
    pretty_assert_eq!(summary.kind, InvocationKind::FullBuild);
    pretty_assert_eq!(
        summary.miss_reason,
        Some(GraphCacheMissReason::ConfigFileChanged)
    );
}

#[tokio::test]
async fn compressed_bundles_round_trip() {
    let fixture = Fixture::new().await;
    let mut config = fixture.config.clone();
    config.compress_graph_files = true;

    let engine = fixture.engine_with_config(config.clone());
    let first = engine
        .run_invocation(
            &fixture.evaluator(),
            None::<&NoPeer>,
            &mut EngineStateCarry::new(),
            ChangeJournalTracker::disabled(),
            &fixture.mounts(),
        )
        .await
        .unwrap();
    pretty_assert_eq!(first.kind, InvocationKind::FullBuild);

    let engine = fixture.engine_with_config(config);
    let second = engine
        .run_invocation(
            &fixture.evaluator(),
            None::<&NoPeer>,
            &mut EngineStateCarry::new(),
            ChangeJournalTracker::disabled(),
            &fixture.mounts(),
        )
        .await
        .unwrap();
    pretty_assert_eq!(
        second.kind,
        InvocationKind::FullReuse(ReuseSource::EngineCache)
    );
}
