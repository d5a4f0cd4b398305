//! The graph engine: load, validate, commit, pause, resume and shutdown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use steward_graph::{reverse, Node, SyncHandler, SyncSummary, VertexId};
use steward_types::{MetaState, PtrUid, Result, StewardError};

use crate::config::EngineConfig;
use crate::context::{make_dir_all, Init};
use crate::events::{EngineEvent, EventEmitter};
use crate::meta::MetaTable;
use crate::resource::{
    path_uid, ptr_uid, resources_equal, validate_resource, Edge, Resource, ResourceGraph,
};
use crate::semaphore::SemaphoreRegistry;
use crate::state::{State, WorkerStatus};
use crate::worker::{WaitTable, Worker};

/// Runs a resource graph.
///
/// Operations take `&mut self`, so callers are serialized by construction.
/// Workers run on the tokio runtime the engine methods are awaited on.
pub struct Engine {
    config: EngineConfig,
    graph: ResourceGraph,
    next_graph: Option<ResourceGraph>,
    state: HashMap<VertexId, State>,
    waits: WaitTable,
    metas: MetaTable,
    semas: Arc<SemaphoreRegistry>,
    tracker: TaskTracker,
    events: EventEmitter,
    paused: bool,
    fast_pause: bool,
    is_closing: bool,
}

impl Engine {
    /// Check the config and prepare the on-disk state tree. The engine
    /// starts out empty and paused.
    pub fn init(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let state_prefix = config.state_prefix();
        make_dir_all(&state_prefix).map_err(|source| StewardError::Prefix {
            path: state_prefix.clone(),
            source,
        })?;
        info!(
            program = %config.program,
            hostname = %config.hostname,
            prefix = %config.prefix.display(),
            "engine initialized"
        );

        let events = EventEmitter::new(config.event_capacity);
        Ok(Self {
            config,
            graph: ResourceGraph::new("graph"),
            next_graph: None,
            state: HashMap::new(),
            waits: WaitTable::default(),
            metas: MetaTable::new(),
            semas: Arc::new(SemaphoreRegistry::new()),
            tracker: TaskTracker::new(),
            events,
            paused: true,
            fast_pause: false,
            is_closing: false,
        })
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Stage a candidate graph for the next commit.
    pub fn load(&mut self, graph: ResourceGraph) -> Result<()> {
        if self.next_graph.is_some() {
            return Err(StewardError::PendingGraphExists);
        }
        debug!(graph = graph.name(), vertices = graph.num_vertices(), "graph loaded");
        self.next_graph = Some(graph);
        Ok(())
    }

    /// Discard the staged graph.
    pub fn abort(&mut self) -> Result<()> {
        match self.next_graph.take() {
            Some(graph) => {
                debug!(graph = graph.name(), "graph aborted");
                Ok(())
            }
            None => Err(StewardError::NoPendingGraph),
        }
    }

    /// Check the staged graph: every resource validates, the graph is
    /// acyclic and no visible identity appears twice.
    pub fn validate(&self) -> Result<()> {
        let graph = self.next_graph.as_ref().ok_or(StewardError::NoPendingGraph)?;
        validate_graph(graph)
    }

    /// Run `f` against the staged graph.
    pub fn apply<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ResourceGraph) -> Result<()>,
    {
        let graph = self.next_graph.as_mut().ok_or(StewardError::NoPendingGraph)?;
        f(graph)
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Make the staged graph the active one.
    ///
    /// Resources that compare equal keep their running worker. Everything
    /// else is stopped and cleaned up, then the replacements are validated
    /// and initialized. New workers only start once the whole sync has
    /// succeeded. On failure the staged graph stays loaded and the active
    /// graph is unchanged.
    pub async fn commit(&mut self) -> Result<()> {
        let candidate = self.next_graph.take().ok_or(StewardError::NoPendingGraph)?;
        info!(graph = candidate.name(), vertices = candidate.num_vertices(), "commit");

        let active_metas: HashSet<PtrUid> = self
            .state
            .values()
            .map(State::resource)
            .filter(|res| !res.meta_params().hidden)
            .map(|res| ptr_uid(res.as_ref()))
            .collect();
        let mut sync = CommitSync {
            config: &self.config,
            state: &mut self.state,
            waits: &self.waits,
            graph: Arc::new(candidate.clone()),
            active_metas,
            staged: Vec::new(),
            freed: Vec::new(),
        };
        let result = self.graph.sync(&candidate, &mut sync).await;
        let CommitSync {
            active_metas,
            staged,
            freed,
            ..
        } = sync;

        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                for state in staged {
                    if let Err(cleanup) = state.cleanup().await {
                        warn!(error = %cleanup, "cleanup of unstarted resource failed");
                    }
                }
                warn!(error = %e, "commit failed");
                self.next_graph = Some(candidate);
                return Err(StewardError::GraphSync(Box::new(e)));
            }
        };

        for uid in self.metas.collect_garbage(&active_metas) {
            debug!(resource = %uid, "meta state collected");
            self.events.emit(EngineEvent::MetaCollected {
                resource: uid.to_string(),
            });
        }

        // freed first: a reloaded vertex may come back under the same id
        for id in freed {
            self.state.remove(&id);
            self.waits.remove(id);
        }
        for state in staged {
            let id = state.id();
            self.state.insert(id, state);
            self.start_worker(id);
        }

        let graph = Arc::new(self.graph.clone());
        for state in self.state.values_mut() {
            state.set_graph(Arc::clone(&graph));
        }

        self.announce(summary);
        Ok(())
    }

    fn announce(&self, summary: SyncSummary) {
        info!(
            added = summary.added,
            removed = summary.removed,
            kept = summary.kept,
            "graph committed"
        );
        self.events.emit(EngineEvent::GraphCommitted {
            graph: self.graph.name().to_string(),
            added: summary.added,
            removed: summary.removed,
            kept: summary.kept,
        });
    }

    fn start_worker(&mut self, id: VertexId) {
        let Some(state) = self.state.get_mut(&id) else {
            return;
        };
        let Some(signals) = state.take_signals() else {
            warn!(vertex = %id, "worker already started");
            return;
        };
        let res = Arc::clone(state.resource());
        let params = res.meta_params();
        let meta = if params.hidden {
            Arc::new(Mutex::new(MetaState::new(params.retry)))
        } else {
            self.metas.ensure(&ptr_uid(res.as_ref()), params.retry)
        };
        meta.lock().unwrap_or_else(PoisonError::into_inner).starts += 1;
        state.mark_running();

        let span = state.init_params().span.clone();
        let worker = Worker {
            res: Arc::clone(&res),
            signals,
            status: state.shared_status(),
            meta,
            semas: Arc::clone(&self.semas),
            events: self.events.clone(),
        };
        let handle = self.tracker.spawn(worker.run().instrument(span));
        self.waits.insert(id, handle);

        debug!(resource = %res, "worker started");
        self.events.emit(EngineEvent::WorkerStarted {
            resource: res.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    /// Pause every worker, parents first. Each worker has stopped by the
    /// time this returns. With `fast_pause` a pending event is dropped
    /// instead of being processed first.
    pub async fn pause(&mut self, fast_pause: bool) -> Result<()> {
        if self.paused {
            return Err(StewardError::AlreadyPaused);
        }
        self.fast_pause = fast_pause;
        let order = self.graph.topological_sort()?;
        for id in order {
            let Some(state) = self.state.get_mut(&id) else {
                continue;
            };
            match state.pause(self.fast_pause).await {
                Ok(()) => {}
                // the worker already exited
                Err(e) if e.is_closed() => {}
                Err(e) => {
                    self.fast_pause = false;
                    // the engine stays resumed, so nothing may be left paused
                    for state in self.state.values_mut() {
                        state.resume();
                    }
                    return Err(e);
                }
            }
        }
        self.paused = true;
        self.fast_pause = false;
        info!("engine paused");
        Ok(())
    }

    /// Resume every paused worker, children first.
    pub fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Err(StewardError::AlreadyResumed);
        }
        let order = reverse(&self.graph.topological_sort()?);
        for id in order {
            let Some(state) = self.state.get_mut(&id) else {
                continue;
            };
            if state.resume() {
                self.events.emit(EngineEvent::ResourceResumed {
                    resource: state.resource().to_string(),
                });
            }
        }
        self.paused = false;
        info!("engine resumed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Commit an empty graph and wait for every worker to exit. Errors are
    /// accumulated rather than stopping the shutdown.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.is_closing = true;
        info!("engine shutting down");

        let mut errors = Vec::new();
        if self.next_graph.is_some() {
            warn!("discarding pending graph");
            self.next_graph = None;
        }
        let empty = ResourceGraph::new(self.graph.name());
        if let Err(e) = self.load(empty) {
            errors.push(e);
        }
        if let Err(e) = self.commit().await {
            errors.push(e);
            // whatever the failed commit left running still has to exit
            for state in self.state.values_mut() {
                state.stop();
            }
            self.next_graph = None;
        }

        self.tracker.close();
        self.tracker.wait().await;

        self.events.emit(EngineEvent::EngineShutdown {
            errors: errors.len(),
        });
        StewardError::collect(errors)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    pub fn pending(&self) -> Option<&ResourceGraph> {
        self.next_graph.as_ref()
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn state(&self, id: VertexId) -> Option<&State> {
        self.state.get(&id)
    }

    /// Ids of every vertex with runtime state, sorted.
    pub fn state_ids(&self) -> Vec<VertexId> {
        let mut ids: Vec<VertexId> = self.state.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn status(&self, id: VertexId) -> Option<WorkerStatus> {
        self.state.get(&id).map(State::status)
    }

    pub fn metas(&self) -> &MetaTable {
        &self.metas
    }

    pub fn meta_snapshot(&self) -> BTreeMap<PtrUid, MetaState> {
        self.metas.snapshot()
    }

    pub fn semaphores(&self) -> &SemaphoreRegistry {
        &self.semas
    }

    /// Worker tasks that have not finished yet.
    pub fn active_workers(&self) -> usize {
        self.tracker.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Validate every resource of `graph`, then check that it is acyclic and
/// that no visible identity appears twice.
pub fn validate_graph(graph: &ResourceGraph) -> Result<()> {
    let mut seen = HashSet::new();
    for (_, res) in graph.vertices() {
        validate_resource(res.as_ref())?;
        if !res.meta_params().hidden && !seen.insert(ptr_uid(res.as_ref())) {
            return Err(StewardError::DuplicateResource(res.to_string()));
        }
    }
    graph.topological_sort()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Commit callbacks
// ---------------------------------------------------------------------------

/// Graph sync handler used by [`Engine::commit`].
///
/// Starting workers and freeing state entries are deferred to after the
/// sync so that a failing sync leaves nothing running that was not running
/// before.
struct CommitSync<'a> {
    config: &'a EngineConfig,
    state: &'a mut HashMap<VertexId, State>,
    waits: &'a WaitTable,
    graph: Arc<ResourceGraph>,
    active_metas: HashSet<PtrUid>,
    staged: Vec<State>,
    freed: Vec<VertexId>,
}

impl CommitSync<'_> {
    fn needs_reload(&self, node: &Node<dyn Resource>) -> bool {
        self.state
            .get(&node.id)
            .map(State::needs_reload)
            .unwrap_or(false)
    }

    fn init_for(&self, res: &dyn Resource) -> Init {
        Init {
            program: self.config.program.clone(),
            version: self.config.version.clone(),
            hostname: self.config.hostname.clone(),
            prefix: self.config.state_prefix().join(path_uid(res)),
            debug: self.config.debug,
            span: info_span!("resource", resource = %res),
        }
    }
}

#[async_trait]
impl SyncHandler<dyn Resource, Edge> for CommitSync<'_> {
    fn vertex_eq(&self, current: &Node<dyn Resource>, candidate: &Node<dyn Resource>) -> Result<bool> {
        if self.needs_reload(current) || self.needs_reload(candidate) {
            return Ok(false);
        }
        Ok(resources_equal(current.value.as_ref(), candidate.value.as_ref()))
    }

    fn edge_eq(&self, current: &Edge, candidate: &Edge) -> Result<bool> {
        Ok(current == candidate)
    }

    async fn on_add(&mut self, node: Node<dyn Resource>) -> Result<()> {
        let res = node.value;
        let live = self.state.contains_key(&node.id) && !self.freed.contains(&node.id);
        if live || self.staged.iter().any(|s| s.id() == node.id) {
            return Err(StewardError::StateExists(res.to_string()));
        }
        if !res.meta_params().hidden {
            self.active_metas.insert(ptr_uid(res.as_ref()));
        }
        validate_resource(res.as_ref())?;

        let init = self.init_for(res.as_ref());
        let state = State::new(node.id, Arc::clone(&res), Arc::clone(&self.graph), init);
        state.init().await?;
        debug!(resource = %res, "resource initialized");
        self.staged.push(state);
        Ok(())
    }

    async fn on_remove(&mut self, node: Node<dyn Resource>) -> Result<()> {
        let res = node.value;
        if !res.meta_params().hidden {
            self.active_metas.remove(&ptr_uid(res.as_ref()));
        }
        let state = self
            .state
            .get_mut(&node.id)
            .ok_or_else(|| StewardError::Other(format!("no state for {res}")))?;
        state.stop();
        self.waits.wait(node.id).await;
        state.cleanup().await?;
        debug!(resource = %res, "resource removed");
        self.freed.push(node.id);
        Ok(())
    }
}
