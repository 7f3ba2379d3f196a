//! The engine state carry: reusable in-memory tables across successive
//! invocations in the same host process.
//!
//! A long-running host may invoke the engine repeatedly; deserializing
//! the same tables each time is wasted work. The carry retains the last
//! invocation's in-memory context keyed by its graph identity. Ownership
//! is exclusive and transfers at most once per direction: the schedule
//! hands the context to the carry at the end of an invocation, and the
//! next invocation takes it back only if the graph identity matches.
//! A disposed context is invalidated so stale holders cannot allocate
//! against it.

use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::bundle::GraphBundle;

/// Holds at most one carried context between invocations.
#[derive(Debug, Default)]
pub struct EngineStateCarry {
    slot: Option<CarriedContext>,
}

#[derive(Debug)]
struct CarriedContext {
    graph_id: Uuid,
    bundle: GraphBundle,
}

impl EngineStateCarry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph identity of the carried context, if one is held.
    pub fn carried_graph_id(&self) -> Option<Uuid> {
        self.slot.as_ref().map(|c| c.graph_id)
    }

    /// Transfer a context from the schedule into the carry. A previously
    /// carried context is disposed.
    #[instrument(skip(self, bundle))]
    pub fn store(&mut self, bundle: GraphBundle) {
        if let Some(previous) = self.slot.take() {
            debug!(graph_id = %previous.graph_id, "disposing previously carried context");
            dispose(previous.bundle);
        }
        let graph_id = bundle.pip_graph.id;
        trace!(%graph_id, "carrying context");
        self.slot = Some(CarriedContext { graph_id, bundle });
    }

    /// Take the carried context if it holds the requested graph;
    /// otherwise dispose whatever is held and return `None`.
    #[instrument(skip(self))]
    pub fn take_for(&mut self, graph_id_to_reload: Uuid) -> Option<GraphBundle> {
        let carried = self.slot.take()?;
        if carried.graph_id == graph_id_to_reload {
            trace!(%graph_id_to_reload, "reusing carried context");
            return Some(carried.bundle);
        }
        debug!(
            carried = %carried.graph_id,
            requested = %graph_id_to_reload,
            "carried context does not match; disposing"
        );
        dispose(carried.bundle);
        None
    }

    /// Dispose the carried context, if any.
    pub fn clear(&mut self) {
        if let Some(carried) = self.slot.take() {
            dispose(carried.bundle);
        }
    }
}

/// Invalidate the context's tables before dropping, so any pointer that
/// escaped the ownership transfer fails on its next allocation instead
/// of silently mixing identifiers from a dead table.
fn dispose(bundle: GraphBundle) {
    bundle.path_table.invalidate();
    drop(bundle);
}
