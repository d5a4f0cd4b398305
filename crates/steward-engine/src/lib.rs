//! Resource graph engine.
//!
//! This crate implements the Steward runtime core: it holds the running
//! resource graph, stages a candidate graph, merges the two with the minimal
//! set of worker restarts, and drives the per-resource workers through
//! start, pause, resume and shutdown.
//!
//! The usual cycle is:
//!
//! ```ignore
//! engine.load(graph)?;
//! engine.validate()?;
//! engine.commit().await?;
//! engine.resume()?;
//! // ... later
//! engine.pause(false).await?;
//! engine.load(next)?;
//! engine.validate()?;
//! engine.commit().await?;
//! engine.resume()?;
//! // ... finally
//! engine.shutdown().await?;
//! ```

pub mod config;
pub mod context;
mod control;
pub mod engine;
pub mod events;
pub mod loader;
pub mod meta;
pub mod registry;
pub mod resource;
pub mod resources;
pub mod semaphore;
pub mod state;
mod worker;

pub use config::{EngineConfig, STATE_DIR};
pub use context::{Init, WatchContext};
pub use engine::{validate_graph, Engine};
pub use events::{EngineEvent, EventEmitter};
pub use loader::{EdgeDecl, GraphFile};
pub use meta::MetaTable;
pub use registry::{default_registry, ResourceCtor, ResourceDecl, ResourceRegistry};
pub use resource::{
    downcast_ref, path_uid, ptr_uid, resources_equal, validate_resource, Edge, Resource,
    ResourceGraph,
};
pub use resources::{NoopRes, TimerRes};
pub use semaphore::SemaphoreRegistry;
pub use state::{State, WorkerPhase, WorkerStatus};
