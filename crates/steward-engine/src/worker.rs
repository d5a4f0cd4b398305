//! The per-vertex worker task.
//!
//! A worker runs the resource's watch loop (or a poll ticker) on a child
//! task and turns every event into a CheckApply, honouring semaphores,
//! retries and pause requests from the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use steward_graph::VertexId;
use steward_types::{MetaParams, Result, StewardError};

use crate::context::WatchContext;
use crate::control::WorkerSignals;
use crate::events::{EngineEvent, EventEmitter};
use crate::meta::SharedMeta;
use crate::resource::Resource;
use crate::semaphore::SemaphoreRegistry;
use crate::state::{lock_status, SharedStatus, WorkerPhase};

// ---------------------------------------------------------------------------
// Wait table
// ---------------------------------------------------------------------------

/// Join handles of running workers, keyed by vertex.
#[derive(Debug, Default)]
pub(crate) struct WaitTable {
    handles: Mutex<HashMap<VertexId, JoinHandle<()>>>,
}

impl WaitTable {
    pub fn insert(&self, id: VertexId, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
    }

    /// Wait for the worker of `id` to exit. Returns immediately when there
    /// is none.
    pub async fn wait(&self, id: VertexId) {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(vertex = %id, error = %e, "worker task did not exit cleanly");
            }
        }
    }

    pub fn remove(&self, id: VertexId) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub(crate) struct Worker {
    pub res: Arc<dyn Resource>,
    pub signals: WorkerSignals,
    pub status: SharedStatus,
    pub meta: SharedMeta,
    pub semas: Arc<SemaphoreRegistry>,
    pub events: EventEmitter,
}

impl Worker {
    /// Run until cancelled or until the watch loop or CheckApply fails for
    /// good. The outcome is recorded in the shared status before returning.
    pub async fn run(self) {
        let resource = self.res.to_string();
        let status = Arc::clone(&self.status);
        let events = self.events.clone();

        // a panicking resource must still leave an exit status behind
        let result = match tokio::spawn(self.work().in_current_span()).await {
            Ok(result) => result,
            Err(e) => Err(StewardError::Other(format!("worker task failed: {e}"))),
        };
        let error = match &result {
            Ok(()) => {
                info!("worker exited");
                None
            }
            Err(e) => {
                warn!(error = %e, "worker exited with error");
                Some(e.to_string())
            }
        };

        {
            let mut status = lock_status(&status);
            status.phase = WorkerPhase::Exited;
            status.error = error.clone();
            status.exited_at = Some(Utc::now());
        }
        events.emit(EngineEvent::WorkerExited { resource, error });
    }

    async fn work(self) -> Result<()> {
        let Worker {
            res,
            signals,
            status: _,
            meta,
            semas,
            events,
        } = self;
        let WorkerSignals {
            pause: mut pauses,
            resume: mut resumes,
            cancel,
        } = signals;
        let params = res.meta_params().clone();
        let resource = res.to_string();

        let (event_tx, mut event_rx) = mpsc::channel(1);
        let watch_token = cancel.child_token();
        // the watch task must not outlive this future, even on unwind
        let _stop_watch = watch_token.clone().drop_guard();
        let on_running = {
            let events = events.clone();
            let resource = resource.clone();
            move || {
                debug!("watch running");
                events.emit(EngineEvent::ResourceRunning { resource });
            }
        };
        let ctx = WatchContext::new(event_tx, watch_token.clone(), on_running);
        let mut watch = if params.poll > 0 {
            let interval = Duration::from_secs(params.poll.into());
            tokio::spawn(poll(ctx, interval).in_current_span())
        } else {
            let res = Arc::clone(&res);
            tokio::spawn(async move { res.watch(ctx).await }.in_current_span())
        };

        let converger = Converger {
            res: res.as_ref(),
            params: &params,
            meta: &meta,
            semas: &semas,
            events: &events,
            cancel: &cancel,
            resource: &resource,
        };

        let mut watched = None;
        let outcome: Result<()> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                joined = &mut watch => {
                    watched = Some(flatten(joined));
                    break Ok(());
                }
                Some(req) = pauses.recv() => {
                    if !req.fast && event_rx.try_recv().is_ok() {
                        if let Err(e) = converger.process().await {
                            break Err(e);
                        }
                    }
                    events.emit(EngineEvent::ResourcePaused { resource: resource.clone() });
                    let _ = req.ack.send(());
                    debug!(fast = req.fast, "paused");

                    let resumed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        released = resumes.recv() => released.is_some(),
                    };
                    if !resumed {
                        break Ok(());
                    }
                    debug!("resumed");
                }
                Some(()) = event_rx.recv() => {
                    if let Err(e) = converger.process().await {
                        break Err(e);
                    }
                }
            }
        };

        watch_token.cancel();
        let watched = match watched {
            Some(result) => result,
            None => flatten(watch.await),
        };
        outcome?;
        match watched {
            Err(e) if e.is_closed() => Ok(()),
            other => other,
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| StewardError::Other(format!("watch task failed: {e}")))?
}

/// Stand-in watch loop for resources with `poll` set.
async fn poll(ctx: WatchContext, interval: Duration) -> Result<()> {
    ctx.running();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ctx.done() => return Ok(()),
            _ = ticker.tick() => ctx.event().await?,
        }
    }
}

// ---------------------------------------------------------------------------
// Converge step
// ---------------------------------------------------------------------------

struct Converger<'a> {
    res: &'a dyn Resource,
    params: &'a MetaParams,
    meta: &'a SharedMeta,
    semas: &'a SemaphoreRegistry,
    events: &'a EventEmitter,
    cancel: &'a CancellationToken,
    resource: &'a str,
}

impl Converger<'_> {
    /// One event's worth of work: take the semaphores, then CheckApply
    /// with retries. Cancellation ends it quietly.
    async fn process(&self) -> Result<()> {
        let _permits = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            permits = self.semas.acquire(&self.params.sema) => permits?,
        };

        let apply = !self.params.noop;
        loop {
            match self.res.check_apply(self.cancel.clone(), apply).await {
                Ok(checked) => {
                    self.meta
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .check_apply_retry = self.params.retry;
                    debug!(checked, apply, "CheckApply");
                    self.events.emit(EngineEvent::CheckApplyFinished {
                        resource: self.resource.to_string(),
                        checked,
                        noop: !apply,
                    });
                    return Ok(());
                }
                Err(e) => {
                    let (retry, retries_left) = {
                        let mut meta = self.meta.lock().unwrap_or_else(PoisonError::into_inner);
                        let retry = meta.consume_retry();
                        (retry, meta.check_apply_retry)
                    };
                    self.events.emit(EngineEvent::CheckApplyFailed {
                        resource: self.resource.to_string(),
                        error: e.to_string(),
                        retries_left,
                    });
                    if !retry {
                        return Err(e);
                    }
                    warn!(error = %e, retries_left, "CheckApply failed, retrying");
                    let delay = Duration::from_millis(self.params.delay);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
