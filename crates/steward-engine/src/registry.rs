//! Resource kind registry: turns declarations into resource instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use steward_types::{MetaParams, Result, StewardError};

use crate::resource::Resource;
use crate::resources::{NoopRes, TimerRes};

// ---------------------------------------------------------------------------
// ResourceDecl
// ---------------------------------------------------------------------------

/// A resource as written in a graph file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub meta: MetaParams,
    /// Kind-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ResourceDecl {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            meta: MetaParams::default(),
            params: serde_json::Value::Null,
        }
    }

    /// Decode `params` into a kind's parameter struct. Missing params decode
    /// to the default.
    pub fn decode_params<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.params.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.params.clone()).map_err(|e| StewardError::Validation {
            resource: format!("{}[{}]", self.kind, self.name),
            message: format!("bad params: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

pub type ResourceCtor = Box<dyn Fn(&ResourceDecl) -> Result<Arc<dyn Resource>> + Send + Sync>;

/// Maps a kind name to the constructor for that kind.
#[derive(Default)]
pub struct ResourceRegistry {
    ctors: HashMap<String, ResourceCtor>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, ctor: F)
    where
        F: Fn(&ResourceDecl) -> Result<Arc<dyn Resource>> + Send + Sync + 'static,
    {
        self.ctors.insert(kind.into(), Box::new(ctor));
    }

    pub fn has(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, decl: &ResourceDecl) -> Result<Arc<dyn Resource>> {
        let ctor = self
            .ctors
            .get(&decl.kind)
            .ok_or_else(|| StewardError::UnknownKind(decl.kind.clone()))?;
        ctor(decl)
    }
}

/// A registry with every built-in kind.
pub fn default_registry() -> ResourceRegistry {
    let mut registry = ResourceRegistry::new();
    registry.register(NoopRes::KIND, NoopRes::from_decl);
    registry.register(TimerRes::KIND, TimerRes::from_decl);
    registry
}
