//! The pip substrate: units of work and the DAG connecting them.
//!
//! The front-end and scheduler own pip semantics; the reuse core needs
//! just enough structure to serialize a graph, compare pips by static
//! fingerprint during patching, and select process pips for sideband
//! examination.

use std::collections::HashMap;

use color_eyre::{Result, eyre::bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{hash::Fingerprint, paths::PathId};

/// Identifier of a pip within one graph. Dense, issue-ordered.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct PipId(pub u32);

/// What kind of work a pip performs.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum PipKind {
    /// A sandboxed process. Carries the roots of any shared opaque output
    /// directories, whose contents are not statically known.
    Process { shared_opaque_roots: Vec<PathId> },
    CopyFile,
    WriteFile,
    SealDirectory,
}

/// Where a pip came from, for diagnostics and patching.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Provenance {
    pub module_name: String,
    pub spec_file: PathId,
}

/// A unit of work in the execution graph.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Pip {
    /// Hash that is stable across builds for "the same" pip; used in
    /// logs and sideband metadata.
    pub semi_stable_hash: u64,
    /// Full static fingerprint; two pips with equal fingerprints are
    /// interchangeable for graph patching.
    pub static_fingerprint: Fingerprint,
    pub kind: PipKind,
    pub provenance: Provenance,
}

impl Pip {
    /// Shared opaque directory roots, if this is a process pip that has
    /// any.
    pub fn shared_opaque_roots(&self) -> &[PathId] {
        match &self.kind {
            PipKind::Process {
                shared_opaque_roots,
            } => shared_opaque_roots,
            _ => &[],
        }
    }
}

/// Append-only table of pips, indexed by static fingerprint.
#[derive(Default, Debug, Serialize, Deserialize)]
pub struct PipTable {
    pips: Vec<Pip>,
    #[serde(skip)]
    by_fingerprint: HashMap<Fingerprint, PipId>,
}

impl PipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pips.is_empty()
    }

    /// Add a pip, issuing the next dense id.
    pub fn add(&mut self, pip: Pip) -> PipId {
        let id = PipId(self.pips.len() as u32);
        self.by_fingerprint.insert(pip.static_fingerprint, id);
        self.pips.push(pip);
        id
    }

    pub fn get(&self, id: PipId) -> Option<&Pip> {
        self.pips.get(id.0 as usize)
    }

    /// Find a pip with the given static fingerprint, if any.
    pub fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<PipId> {
        self.by_fingerprint.get(fingerprint).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PipId, &Pip)> {
        self.pips
            .iter()
            .enumerate()
            .map(|(i, pip)| (PipId(i as u32), pip))
    }

    /// Rebuild the fingerprint index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.by_fingerprint = self
            .pips
            .iter()
            .enumerate()
            .map(|(i, pip)| (pip.static_fingerprint, PipId(i as u32)))
            .collect();
    }
}

/// The dependency DAG over pip ids.
///
/// Built through [`DirectedGraphBuilder`] and immutable once sealed.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct DirectedGraph {
    out_edges: Vec<Vec<PipId>>,
    in_edges: Vec<Vec<PipId>>,
}

impl DirectedGraph {
    pub fn node_count(&self) -> usize {
        self.out_edges.len()
    }

    pub fn successors(&self, id: PipId) -> &[PipId] {
        self.out_edges
            .get(id.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn predecessors(&self, id: PipId) -> &[PipId] {
        self.in_edges
            .get(id.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Topological order over all nodes. Fails if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<PipId>> {
        let n = self.node_count();
        let mut indegree = vec![0usize; n];
        for targets in &self.out_edges {
            for t in targets {
                indegree[t.0 as usize] += 1;
            }
        }

        let mut ready: Vec<PipId> = (0..n as u32)
            .map(PipId)
            .filter(|id| indegree[id.0 as usize] == 0)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(id) = ready.pop() {
            order.push(id);
            for &next in self.successors(id) {
                indegree[next.0 as usize] -= 1;
                if indegree[next.0 as usize] == 0 {
                    ready.push(next);
                }
            }
        }

        if order.len() != n {
            bail!("pip graph contains a cycle");
        }
        Ok(order)
    }
}

/// Mutable builder for [`DirectedGraph`].
#[derive(Default, Debug)]
pub struct DirectedGraphBuilder {
    graph: DirectedGraph,
}

impl DirectedGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume building on top of a reloaded graph, keeping its edges.
    pub fn from_existing(graph: DirectedGraph) -> Self {
        Self { graph }
    }

    /// Ensure nodes exist up to and including `id`.
    pub fn ensure_node(&mut self, id: PipId) {
        let needed = id.0 as usize + 1;
        if self.graph.out_edges.len() < needed {
            self.graph.out_edges.resize(needed, Vec::new());
            self.graph.in_edges.resize(needed, Vec::new());
        }
    }

    /// Add a dependency edge `from → to`. Duplicate edges collapse.
    pub fn add_edge(&mut self, from: PipId, to: PipId) {
        self.ensure_node(from);
        self.ensure_node(to);
        let out = &mut self.graph.out_edges[from.0 as usize];
        if !out.contains(&to) {
            out.push(to);
            self.graph.in_edges[to.0 as usize].push(from);
        }
    }

    pub fn successors(&self, id: PipId) -> &[PipId] {
        self.graph.successors(id)
    }

    /// Seal into an immutable graph, validating acyclicity.
    pub fn seal(self) -> Result<DirectedGraph> {
        self.graph.topological_order()?;
        Ok(self.graph)
    }
}

/// A fully constructed, immutable pip graph with its identity.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipGraph {
    /// Per-graph identity; also keys the in-memory state carry.
    pub id: Uuid,
    pub table: PipTable,
    pub graph: DirectedGraph,
}

impl PipGraph {
    /// Seal a table and builder into a graph with a fresh identity.
    pub fn seal(table: PipTable, builder: DirectedGraphBuilder) -> Result<Self> {
        let mut builder = builder;
        if table.len() > 0 {
            builder.ensure_node(PipId(table.len() as u32 - 1));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            table,
            graph: builder.seal()?,
        })
    }

    /// Process pips owning shared opaque outputs.
    pub fn shared_opaque_process_pips(&self) -> impl Iterator<Item = (PipId, &Pip)> {
        self.table
            .iter()
            .filter(|(_, pip)| !pip.shared_opaque_roots().is_empty())
    }
}
