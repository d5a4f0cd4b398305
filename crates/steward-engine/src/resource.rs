//! The resource capability trait and the engine-level checks built on it.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use steward_graph::Graph;
use steward_types::{MetaParams, PtrUid, ResUid, Result, StewardError};

use crate::context::{Init, WatchContext};

// ---------------------------------------------------------------------------
// Resource trait
// ---------------------------------------------------------------------------

/// A unit of desired state the engine keeps converged.
///
/// The engine calls `validate`, then `init` once per instance, then runs
/// `watch` on a worker for as long as the resource stays in the graph,
/// calling `check_apply` whenever `watch` reports an event. `cleanup` runs
/// after the worker has exited.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// The resource kind, e.g. `"file"`.
    fn kind(&self) -> &str;

    /// Unique name within its kind.
    fn name(&self) -> &str;

    fn meta_params(&self) -> &MetaParams;

    /// Check the resource's own parameters.
    fn validate(&self) -> Result<()>;

    async fn init(&self, init: Init) -> Result<()>;

    /// Event loop. Must call [`WatchContext::running`] once ready and
    /// [`WatchContext::event`] on every change. Returns when the context is
    /// done or on an unrecoverable error.
    async fn watch(&self, ctx: WatchContext) -> Result<()>;

    /// Idempotent converge step. Returns `true` when the state was already
    /// correct. With `apply == false` nothing may be changed.
    async fn check_apply(&self, cancel: CancellationToken, apply: bool) -> Result<bool>;

    async fn cleanup(&self) -> Result<()>;

    /// `Ok(())` when `other` describes the same desired state.
    fn cmp(&self, other: &dyn Resource) -> Result<()>;

    fn uids(&self) -> Vec<ResUid> {
        vec![ResUid::new(self.kind(), self.name())]
    }

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Display for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind(), self.name())
    }
}

impl fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind(), self.name())
    }
}

/// Downcast helper for `Resource::cmp` implementations.
pub fn downcast_ref<T: Resource>(res: &dyn Resource) -> Option<&T> {
    res.as_any().downcast_ref::<T>()
}

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// An ordering dependency between two resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub name: String,
    /// Whether a change upstream should notify the downstream resource.
    #[serde(default)]
    pub notify: bool,
}

impl Edge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notify: false,
        }
    }
}

pub type ResourceGraph = Graph<dyn Resource, Edge>;

// ---------------------------------------------------------------------------
// Engine-level helpers
// ---------------------------------------------------------------------------

pub fn ptr_uid(res: &dyn Resource) -> PtrUid {
    PtrUid::new(res.kind(), res.name())
}

/// Path-safe unique directory name for a resource: `kind-name` with every
/// byte outside `[A-Za-z0-9._-]` percent-encoded.
pub fn path_uid(res: &dyn Resource) -> String {
    let mut out = String::with_capacity(res.kind().len() + res.name().len() + 1);
    out.push_str(&escape_path(res.kind()));
    out.push('-');
    out.push_str(&escape_path(res.name()));
    out
}

fn escape_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Validation every resource goes through before it may run: identity
/// fields, meta-parameters, then the resource's own checks.
pub fn validate_resource(res: &dyn Resource) -> Result<()> {
    let fail = |message: String| StewardError::Validation {
        resource: res.to_string(),
        message,
    };
    if res.kind().is_empty() {
        return Err(fail("the kind is empty".into()));
    }
    if res.name().is_empty() {
        return Err(fail("the name is empty".into()));
    }
    res.meta_params()
        .validate()
        .map_err(|e| fail(e.to_string()))?;
    res.validate().map_err(|e| match e {
        StewardError::Validation { .. } => e,
        other => fail(other.to_string()),
    })
}

/// Whether two resources are interchangeable without restarting a worker.
pub fn resources_equal(a: &dyn Resource, b: &dyn Resource) -> bool {
    a.kind() == b.kind()
        && a.name() == b.name()
        && a.meta_params() == b.meta_params()
        && a.cmp(b).is_ok()
}
