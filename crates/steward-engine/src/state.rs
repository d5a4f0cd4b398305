//! Per-vertex runtime state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use steward_graph::VertexId;
use steward_types::{Result, StewardError};

use crate::context::Init;
use crate::control::{self, WorkerControl, WorkerSignals};
use crate::resource::{Resource, ResourceGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    /// Initialized, worker not launched yet.
    Created,
    Running,
    Paused,
    Exited,
    /// Exited and cleaned up.
    Cleaned,
}

/// What is known about a worker, readable at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    /// Why the worker exited, if it failed.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            phase: WorkerPhase::Created,
            error: None,
            started_at: None,
            exited_at: None,
        }
    }
}

pub(crate) type SharedStatus = Arc<Mutex<WorkerStatus>>;

pub(crate) fn lock_status(status: &SharedStatus) -> MutexGuard<'_, WorkerStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the engine tracks for one vertex of the active graph.
pub struct State {
    id: VertexId,
    res: Arc<dyn Resource>,
    graph: Arc<ResourceGraph>,
    init: Init,
    control: WorkerControl,
    signals: Option<WorkerSignals>,
    status: SharedStatus,
    paused: bool,
}

impl State {
    pub(crate) fn new(
        id: VertexId,
        res: Arc<dyn Resource>,
        graph: Arc<ResourceGraph>,
        init: Init,
    ) -> Self {
        let (control, signals) = control::channel();
        Self {
            id,
            res,
            graph,
            init,
            control,
            signals: Some(signals),
            status: Arc::new(Mutex::new(WorkerStatus::default())),
            paused: false,
        }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.res
    }

    /// The graph this vertex belongs to, as of the last commit.
    pub fn graph(&self) -> &Arc<ResourceGraph> {
        &self.graph
    }

    pub fn init_params(&self) -> &Init {
        &self.init
    }

    pub fn status(&self) -> WorkerStatus {
        lock_status(&self.status).clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// A worker that failed (with rewatch on) or was stopped by an aborted
    /// commit has to be replaced on the next commit.
    pub fn needs_reload(&self) -> bool {
        if self.control.is_cancelled() {
            return true;
        }
        lock_status(&self.status).error.is_some() && self.res.meta_params().rewatch
    }

    pub(crate) fn set_graph(&mut self, graph: Arc<ResourceGraph>) {
        self.graph = graph;
    }

    pub(crate) fn shared_status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    /// Handed out exactly once, to the one worker this state ever gets.
    pub(crate) fn take_signals(&mut self) -> Option<WorkerSignals> {
        self.signals.take()
    }

    pub(crate) async fn init(&self) -> Result<()> {
        self.res
            .init(self.init.clone())
            .await
            .map_err(|e| StewardError::Init {
                resource: self.res.to_string(),
                message: e.to_string(),
            })
    }

    pub(crate) fn mark_running(&self) {
        let mut status = lock_status(&self.status);
        status.phase = WorkerPhase::Running;
        status.started_at = Some(Utc::now());
    }

    pub(crate) async fn pause(&mut self, fast: bool) -> Result<()> {
        self.control.request_pause(fast).await?;
        self.paused = true;
        let mut status = lock_status(&self.status);
        if status.phase == WorkerPhase::Running {
            status.phase = WorkerPhase::Paused;
        }
        Ok(())
    }

    /// Release the worker if it is paused. Returns whether it was.
    pub(crate) fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.control.release();
        self.paused = false;
        let mut status = lock_status(&self.status);
        if status.phase == WorkerPhase::Paused {
            status.phase = WorkerPhase::Running;
        }
        true
    }

    pub(crate) fn stop(&mut self) {
        self.control.cancel();
        self.paused = false;
    }

    /// Run the resource's cleanup. A state that was already cleaned up is
    /// left alone.
    pub(crate) async fn cleanup(&self) -> Result<()> {
        if lock_status(&self.status).phase == WorkerPhase::Cleaned {
            return Ok(());
        }
        self.res
            .cleanup()
            .await
            .map_err(|e| StewardError::Cleanup {
                resource: self.res.to_string(),
                message: e.to_string(),
            })?;
        lock_status(&self.status).phase = WorkerPhase::Cleaned;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::NoopRes;
    use steward_types::MetaParams;

    fn state_for(res: NoopRes) -> State {
        let res: Arc<dyn Resource> = Arc::new(res);
        let mut graph = ResourceGraph::new("g");
        let id = graph.add_vertex(Arc::clone(&res));
        let init = Init {
            program: "steward".into(),
            version: String::new(),
            hostname: "h".into(),
            prefix: "/tmp/steward-test".into(),
            debug: false,
            span: tracing::Span::none(),
        };
        State::new(id, res, Arc::new(graph), init)
    }

    #[test]
    fn fresh_state_is_created() {
        let state = state_for(NoopRes::new("a"));
        assert_eq!(state.status().phase, WorkerPhase::Created);
        assert!(!state.needs_reload());
        assert!(!state.is_paused());
    }

    #[test]
    fn failed_worker_needs_reload_only_with_rewatch() {
        let state = state_for(NoopRes::new("a"));
        lock_status(&state.status).error = Some("boom".into());
        assert!(state.needs_reload());

        let quiet = state_for(NoopRes::new("b").with_meta(MetaParams {
            rewatch: false,
            ..MetaParams::default()
        }));
        lock_status(&quiet.status).error = Some("boom".into());
        assert!(!quiet.needs_reload());
    }

    #[test]
    fn stopped_state_needs_reload() {
        let mut state = state_for(NoopRes::new("a"));
        state.stop();
        assert!(state.needs_reload());
    }

    #[test]
    fn signals_are_taken_once() {
        let mut state = state_for(NoopRes::new("a"));
        assert!(state.take_signals().is_some());
        assert!(state.take_signals().is_none());
    }

    #[test]
    fn resume_only_releases_paused() {
        let mut state = state_for(NoopRes::new("a"));
        assert!(!state.resume());
        state.paused = true;
        assert!(state.resume());
        assert!(!state.is_paused());
    }
}
