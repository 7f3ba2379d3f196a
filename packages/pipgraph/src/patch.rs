//! Partial graph reuse: patching a reloaded graph when only spec files
//! changed.
//!
//! The reloaded graph's pip table and directed graph are wrapped in a
//! patchable builder that exposes the same surface as a fresh builder.
//! For each pip the front-end re-emits, an identical pip already present
//! in the reloaded graph (by static fingerprint) keeps its pip id and
//! outgoing edges; everything else is added fresh. Sealing produces an
//! immutable graph under a new identity.

use std::collections::HashSet;

use color_eyre::{Result, eyre::bail};
use tracing::{debug, instrument, trace};

use crate::{
    bundle::GraphBundle,
    pips::{DirectedGraphBuilder, Pip, PipGraph, PipId},
};

/// Counters describing what patching did, for the build summary.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct PatchStats {
    pub reused: usize,
    pub added: usize,
}

/// A pip-graph builder layered over a reloaded graph.
pub struct PatchablePipGraph {
    table: crate::pips::PipTable,
    builder: DirectedGraphBuilder,
    /// Ids re-confirmed by the front-end this run.
    resubmitted: HashSet<PipId>,
    stats: PatchStats,
}

impl PatchablePipGraph {
    /// Submit a pip. Returns the reloaded pip's id when an identical pip
    /// already exists, preserving its outgoing edges; otherwise adds the
    /// pip as fresh.
    #[instrument(skip(self, pip))]
    pub fn add_pip(&mut self, pip: Pip) -> PipId {
        if let Some(existing) = self.table.find_by_fingerprint(&pip.static_fingerprint) {
            trace!(?existing, "reusing identical pip");
            self.resubmitted.insert(existing);
            self.stats.reused += 1;
            return existing;
        }
        let id = self.table.add(pip);
        self.builder.ensure_node(id);
        self.resubmitted.insert(id);
        self.stats.added += 1;
        id
    }

    /// Add a dependency edge between pips (fresh or reused).
    pub fn add_edge(&mut self, from: PipId, to: PipId) {
        self.builder.add_edge(from, to);
    }

    pub fn stats(&self) -> PatchStats {
        self.stats
    }

    /// Seal into an immutable pip graph with a fresh identity.
    #[instrument(skip(self))]
    pub fn seal(self) -> Result<PipGraph> {
        debug!(stats = ?self.stats, "sealing patched pip graph");
        PipGraph::seal(self.table, self.builder)
    }
}

/// Prepares partial reuse from a reloaded bundle.
pub struct PartialReuseCoordinator;

impl PartialReuseCoordinator {
    /// Wrap the reloaded graph in a patchable builder.
    ///
    /// Partial reuse is only legal when the reloaded in-memory context
    /// passes the historic-size heuristic; a context that has doubled
    /// since its oldest recorded build is rebuilt from scratch instead.
    ///
    /// The rest of the bundle (tables, mounts, config state) comes back
    /// alongside the builder with an empty pip graph in place; the
    /// caller reinstalls the sealed graph when patching finishes.
    #[instrument(skip(bundle))]
    pub fn prepare(mut bundle: GraphBundle) -> Result<(PatchablePipGraph, GraphBundle)> {
        if !bundle.historic_sizes.allows_context_reuse() {
            bail!("reloaded context exceeds the historic-size limit; rebuild required");
        }

        let pip_graph = std::mem::replace(
            &mut bundle.pip_graph,
            PipGraph {
                id: uuid::Uuid::nil(),
                table: crate::pips::PipTable::new(),
                graph: Default::default(),
            },
        );
        let PipGraph { table, graph, id } = pip_graph;
        debug!(%id, pips = table.len(), "prepared patchable graph");
        Ok((
            PatchablePipGraph {
                table,
                builder: DirectedGraphBuilder::from_existing(graph),
                resubmitted: HashSet::new(),
                stats: PatchStats::default(),
            },
            bundle,
        ))
    }
}
