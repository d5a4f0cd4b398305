//! Directed resource graph and the graph sync primitive.
//!
//! This crate holds the data structure the engine runs: vertices are shared
//! (`Arc`) values identified by a process-wide unique [`VertexId`], edges are
//! ordering dependencies. [`Graph::sync`] transforms one graph into another
//! with the minimal set of vertex additions and removals.

pub mod graph;
pub mod sync;

pub use graph::{reverse, Graph, Node, VertexId};
pub use sync::{SyncHandler, SyncPlan, SyncSummary};
