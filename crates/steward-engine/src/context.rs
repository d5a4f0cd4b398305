//! What the engine hands to a resource: the init bundle and the watch
//! context.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use steward_types::{Result, StewardError};

/// Create `path` and its parents with mode 0775.
pub(crate) fn make_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o775);
    }
    builder.create(path)
}

/// Handed to [`crate::Resource::init`] once per resource instance.
#[derive(Debug, Clone)]
pub struct Init {
    pub program: String,
    pub version: String,
    pub hostname: String,
    /// Private state directory for this resource. Not created until
    /// [`Init::var_dir`] is called.
    pub prefix: PathBuf,
    pub debug: bool,
    /// Span every log line of this resource should be emitted under.
    pub span: tracing::Span,
}

impl Init {
    /// Return (creating it on first use) a directory under the resource's
    /// private prefix. An empty `sub` returns the prefix itself.
    pub fn var_dir(&self, sub: &str) -> Result<PathBuf> {
        let dir = if sub.is_empty() {
            self.prefix.clone()
        } else {
            self.prefix.join(sub)
        };
        make_dir_all(&dir).map_err(|source| StewardError::Prefix {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }
}

type RunningHook = Box<dyn FnOnce() + Send>;

/// The channel between a resource's watch loop and its worker.
pub struct WatchContext {
    events: mpsc::Sender<()>,
    cancel: CancellationToken,
    running: Mutex<Option<RunningHook>>,
}

impl WatchContext {
    pub(crate) fn new(
        events: mpsc::Sender<()>,
        cancel: CancellationToken,
        on_running: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            cancel,
            running: Mutex::new(Some(Box::new(on_running))),
        }
    }

    /// Signal that the watch loop is ready. The first call also queues an
    /// initial event so the resource gets converged once. Later calls do
    /// nothing.
    pub fn running(&self) {
        let hook = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
            let _ = self.events.try_send(());
        }
    }

    /// Report a change. Waits until the worker picks the event up and fails
    /// with [`StewardError::Closed`] once the worker is shutting down.
    pub async fn event(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StewardError::Closed),
            sent = self.events.send(()) => sent.map_err(|_| StewardError::Closed),
        }
    }

    /// Resolves when the watch loop should return.
    pub async fn done(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
