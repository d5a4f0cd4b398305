//! Shared types, errors, identity and meta-parameters for the Steward engine.
//!
//! This crate provides the foundational types used across all other Steward crates:
//! - `StewardError`: unified error taxonomy
//! - `ResUid` / `PtrUid`: structural resource identity that survives graph regeneration
//! - `MetaParams`: engine-level knobs every resource carries
//! - `MetaState`: per-identity state that outlives a single graph generation

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unified error type for all Steward subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StewardError {
    // === Engine Setup Errors ===
    #[error("the program name is empty")]
    EmptyProgram,

    #[error("the hostname is empty")]
    EmptyHostname,

    #[error("the prefix of `{0}` is invalid")]
    InvalidPrefix(String),

    #[error("can't create prefix `{path}`: {source}")]
    Prefix {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === Graph Lifecycle Errors ===
    #[error("can't overwrite pending graph, use abort")]
    PendingGraphExists,

    #[error("there is no pending graph")]
    NoPendingGraph,

    #[error("already paused")]
    AlreadyPaused,

    #[error("already resumed")]
    AlreadyResumed,

    #[error("error running graph sync: {0}")]
    GraphSync(Box<StewardError>),

    // === Graph Structure Errors ===
    #[error("graph `{graph}` contains a cycle")]
    GraphCycle { graph: String },

    #[error("vertex {0} does not exist")]
    MissingVertex(u64),

    #[error("resource `{0}` appears more than once in the graph")]
    DuplicateResource(String),

    #[error("edge references unknown resource `{0}`")]
    UnknownEdgeEndpoint(String),

    // === Resource Lifecycle Errors ===
    #[error("{resource} did not Validate: {message}")]
    Validation { resource: String, message: String },

    #[error("{resource} did not Init: {message}")]
    Init { resource: String, message: String },

    #[error("{resource} did not Cleanup: {message}")]
    Cleanup { resource: String, message: String },

    #[error("the state for {0} already exists")]
    StateExists(String),

    #[error("invalid meta params: {0}")]
    MetaParams(String),

    #[error("invalid semaphore id `{0}`")]
    Semaphore(String),

    #[error("unknown resource kind `{0}`")]
    UnknownKind(String),

    #[error("the worker is closed")]
    Closed,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<StewardError>),

    #[error("{0}")]
    Other(String),
}

fn join_errors(errors: &[StewardError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StewardError {
    /// Returns `true` if the error only means that the worker is already gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, StewardError::Closed)
    }

    /// Returns `true` for the benign "already paused" / "already resumed" signals.
    pub fn is_state_mismatch(&self) -> bool {
        matches!(
            self,
            StewardError::AlreadyPaused | StewardError::AlreadyResumed
        )
    }

    /// Fold a list of errors into a single result: none is `Ok`, one is
    /// returned as-is, more are wrapped in [`StewardError::Multiple`].
    pub fn collect(mut errors: Vec<StewardError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StewardError::Multiple(errors)),
        }
    }
}

/// A convenience alias for `Result<T, StewardError>`.
pub type Result<T> = std::result::Result<T, StewardError>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity a resource advertises for matching against other resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResUid {
    pub kind: String,
    pub name: String,
}

impl ResUid {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.name)
    }
}

/// Structural key for a resource, derived from kind+name.
///
/// Two distinct resource instances across graph generations share a
/// `PtrUid` when they describe the same thing, which is what the
/// meta-state table is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PtrUid {
    pub kind: String,
    pub name: String,
}

impl PtrUid {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PtrUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// MetaParams: engine-level knobs carried by every resource
// ---------------------------------------------------------------------------

fn default_rewatch() -> bool {
    true
}

/// Parameters that change how the engine drives a resource, independent of
/// what the resource itself does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaParams {
    /// Run CheckApply in check-only mode.
    #[serde(default)]
    pub noop: bool,
    /// Retries for a failing CheckApply before the worker exits. `-1` is forever.
    #[serde(default)]
    pub retry: i16,
    /// Milliseconds to wait between retries.
    #[serde(default)]
    pub delay: u64,
    /// Poll interval in seconds. Zero means use the resource's own Watch.
    #[serde(default)]
    pub poll: u32,
    /// Semaphore ids, each `name` or `name:count`.
    #[serde(default)]
    pub sema: Vec<String>,
    /// Restart a worker that exited with an error on the next commit.
    #[serde(default = "default_rewatch")]
    pub rewatch: bool,
    /// Exclude this resource from identity tracking.
    #[serde(default)]
    pub hidden: bool,
}

impl Default for MetaParams {
    fn default() -> Self {
        Self {
            noop: false,
            retry: 0,
            delay: 0,
            poll: 0,
            sema: Vec::new(),
            rewatch: true,
            hidden: false,
        }
    }
}

impl MetaParams {
    pub fn validate(&self) -> Result<()> {
        if self.retry < -1 {
            return Err(StewardError::MetaParams(format!(
                "retry must be -1 or greater, got {}",
                self.retry
            )));
        }
        for id in &self.sema {
            parse_sema(id)?;
        }
        Ok(())
    }
}

/// Largest count a semaphore id may carry. Matches the permit limit of
/// `tokio::sync::Semaphore`.
pub const MAX_SEMA_COUNT: usize = usize::MAX >> 3;

/// Split a semaphore id of the form `name` or `name:count` into its parts.
/// The count defaults to 1 and must be in `1..=MAX_SEMA_COUNT`.
pub fn parse_sema(id: &str) -> Result<(String, usize)> {
    let (name, count) = match id.rsplit_once(':') {
        Some((name, count)) => {
            let count: usize = count
                .trim()
                .parse()
                .map_err(|_| StewardError::Semaphore(id.to_string()))?;
            (name.trim(), count)
        }
        None => (id.trim(), 1),
    };
    if name.is_empty() || count == 0 || count > MAX_SEMA_COUNT {
        return Err(StewardError::Semaphore(id.to_string()));
    }
    Ok((name.to_string(), count))
}

// ---------------------------------------------------------------------------
// MetaState: per-identity state that survives graph swaps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    /// Remaining CheckApply retries; refilled from `MetaParams::retry` on success.
    pub check_apply_retry: i16,
    /// How many times a worker was launched for this identity.
    pub starts: u32,
}

impl MetaState {
    pub fn new(retry: i16) -> Self {
        Self {
            check_apply_retry: retry,
            starts: 0,
        }
    }

    /// Consume one retry. Returns `false` once none are left.
    pub fn consume_retry(&mut self) -> bool {
        match self.check_apply_retry {
            -1 => true,
            0 => false,
            _ => {
                self.check_apply_retry -= 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_validation() {
        let err = StewardError::Validation {
            resource: "file[/tmp/x]".into(),
            message: "path must be absolute".into(),
        };
        assert_eq!(
            err.to_string(),
            "file[/tmp/x] did not Validate: path must be absolute"
        );
    }

    #[test]
    fn error_display_graph_sync_wraps_cause() {
        let err = StewardError::GraphSync(Box::new(StewardError::Init {
            resource: "svc[nginx]".into(),
            message: "no dbus".into(),
        }));
        assert_eq!(
            err.to_string(),
            "error running graph sync: svc[nginx] did not Init: no dbus"
        );
    }

    #[test]
    fn error_display_multiple_joins() {
        let err = StewardError::Multiple(vec![
            StewardError::PendingGraphExists,
            StewardError::Other("boom".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "can't overwrite pending graph, use abort; boom"
        );
    }

    #[test]
    fn collect_folds_errors() {
        assert!(StewardError::collect(vec![]).is_ok());
        let one = StewardError::collect(vec![StewardError::Closed]).unwrap_err();
        assert!(one.is_closed());
        let many =
            StewardError::collect(vec![StewardError::Closed, StewardError::AlreadyPaused])
                .unwrap_err();
        assert!(matches!(many, StewardError::Multiple(ref v) if v.len() == 2));
    }

    #[test]
    fn classification_helpers() {
        assert!(StewardError::AlreadyPaused.is_state_mismatch());
        assert!(StewardError::AlreadyResumed.is_state_mismatch());
        assert!(!StewardError::Closed.is_state_mismatch());
        assert!(StewardError::Closed.is_closed());
    }

    #[test]
    fn uid_display() {
        assert_eq!(PtrUid::new("noop", "a").to_string(), "noop[a]");
        assert_eq!(ResUid::new("timer", "t1").to_string(), "timer[t1]");
    }

    #[test]
    fn meta_params_defaults_rewatch_on() {
        let meta = MetaParams::default();
        assert!(meta.rewatch);
        assert!(!meta.hidden);
        assert_eq!(meta.retry, 0);

        let parsed: MetaParams = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn meta_params_deserialize_overrides() {
        let parsed: MetaParams =
            serde_json::from_str(r#"{"rewatch": false, "retry": -1, "sema": ["db:2"]}"#)
                .unwrap();
        assert!(!parsed.rewatch);
        assert_eq!(parsed.retry, -1);
        assert_eq!(parsed.sema, vec!["db:2".to_string()]);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn meta_params_reject_bad_retry() {
        let meta = MetaParams {
            retry: -2,
            ..MetaParams::default()
        };
        assert!(matches!(meta.validate(), Err(StewardError::MetaParams(_))));
    }

    #[test]
    fn parse_sema_forms() {
        assert_eq!(parse_sema("db").unwrap(), ("db".to_string(), 1));
        assert_eq!(parse_sema("db:3").unwrap(), ("db".to_string(), 3));
        assert!(parse_sema("db:0").is_err());
        assert!(parse_sema(":2").is_err());
        assert!(parse_sema("db:x").is_err());
        assert_eq!(parse_sema(&format!("db:{MAX_SEMA_COUNT}")).unwrap().1, MAX_SEMA_COUNT);
        assert!(parse_sema(&format!("db:{}", MAX_SEMA_COUNT + 1)).is_err());
    }

    #[test]
    fn meta_state_retry_accounting() {
        let mut state = MetaState::new(2);
        assert!(state.consume_retry());
        assert!(state.consume_retry());
        assert!(!state.consume_retry());

        let mut forever = MetaState::new(-1);
        for _ in 0..10 {
            assert!(forever.consume_retry());
        }
        assert_eq!(forever.check_apply_retry, -1);
    }
}
