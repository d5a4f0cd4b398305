//! Engine event system for observability.
//!
//! Emits [`EngineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, tests, UIs) can follow commits and worker
//! lifecycles without coupling to engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted by the engine and its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    GraphCommitted {
        graph: String,
        added: usize,
        removed: usize,
        kept: usize,
    },
    WorkerStarted {
        resource: String,
    },
    /// The resource's watch loop reported it is ready.
    ResourceRunning {
        resource: String,
    },
    /// Emitted by the worker right before it acknowledges a pause.
    ResourcePaused {
        resource: String,
    },
    ResourceResumed {
        resource: String,
    },
    CheckApplyFinished {
        resource: String,
        checked: bool,
        noop: bool,
    },
    CheckApplyFailed {
        resource: String,
        error: String,
        retries_left: i16,
    },
    WorkerExited {
        resource: String,
        error: Option<String>,
    },
    MetaCollected {
        resource: String,
    },
    EngineShutdown {
        errors: usize,
    },
}

impl EngineEvent {
    /// The resource this event is about, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            EngineEvent::WorkerStarted { resource }
            | EngineEvent::ResourceRunning { resource }
            | EngineEvent::ResourcePaused { resource }
            | EngineEvent::ResourceResumed { resource }
            | EngineEvent::CheckApplyFinished { resource, .. }
            | EngineEvent::CheckApplyFailed { resource, .. }
            | EngineEvent::WorkerExited { resource, .. }
            | EngineEvent::MetaCollected { resource } => Some(resource.as_str()),
            EngineEvent::GraphCommitted { .. } | EngineEvent::EngineShutdown { .. } => None,
        }
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(EngineEvent::WorkerStarted {
            resource: "noop[a]".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource(), Some("noop[a]"));
        assert!(matches!(event, EngineEvent::WorkerStarted { .. }));
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(EngineEvent::EngineShutdown { errors: 0 });
    }

    #[test]
    fn event_serializes_with_variant_tag() {
        let event = EngineEvent::CheckApplyFailed {
            resource: "timer[t]".into(),
            error: "boom".into(),
            retries_left: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["CheckApplyFailed"]["retries_left"], 2);
        assert_eq!(json["CheckApplyFailed"]["resource"], "timer[t]");
    }
}
