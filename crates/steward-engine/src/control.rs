//! Engine <-> worker control channels.
//!
//! The engine holds a [`WorkerControl`], the worker owns the matching
//! [`WorkerSignals`]. A pause is a request plus an acknowledgement: the engine
//! blocks until the worker has actually stopped processing.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use steward_types::{Result, StewardError};

pub(crate) struct PauseRequest {
    /// Skip the pending event instead of processing it first.
    pub fast: bool,
    pub ack: oneshot::Sender<()>,
}

pub(crate) struct WorkerControl {
    pause: mpsc::Sender<PauseRequest>,
    resume: Option<mpsc::Sender<()>>,
    cancel: CancellationToken,
}

pub(crate) struct WorkerSignals {
    pub pause: mpsc::Receiver<PauseRequest>,
    pub resume: mpsc::Receiver<()>,
    pub cancel: CancellationToken,
}

pub(crate) fn channel() -> (WorkerControl, WorkerSignals) {
    let (pause_tx, pause_rx) = mpsc::channel(1);
    let (resume_tx, resume_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    (
        WorkerControl {
            pause: pause_tx,
            resume: Some(resume_tx),
            cancel: cancel.clone(),
        },
        WorkerSignals {
            pause: pause_rx,
            resume: resume_rx,
            cancel,
        },
    )
}

impl WorkerControl {
    /// Ask the worker to pause and wait for the acknowledgement.
    ///
    /// Fails with [`StewardError::Closed`] when the worker has already gone
    /// away or goes away before acknowledging.
    pub async fn request_pause(&self, fast: bool) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StewardError::Closed);
        }
        let (ack, acked) = oneshot::channel();
        self.pause
            .send(PauseRequest { fast, ack })
            .await
            .map_err(|_| StewardError::Closed)?;
        acked.await.map_err(|_| StewardError::Closed)
    }

    /// Let a paused worker continue. Never blocks.
    pub fn release(&self) {
        if let Some(resume) = &self.resume {
            let _ = resume.try_send(());
        }
    }

    /// Tell the worker to exit. Idempotent.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.resume.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_waits_for_ack() {
        let (control, mut signals) = channel();
        let worker = tokio::spawn(async move {
            let req = signals.pause.recv().await.unwrap();
            assert!(req.fast);
            req.ack.send(()).unwrap();
            signals.resume.recv().await
        });

        control.request_pause(true).await.unwrap();
        control.release();
        assert_eq!(worker.await.unwrap(), Some(()));
    }

    #[tokio::test]
    async fn pause_after_worker_exit_is_closed() {
        let (control, signals) = channel();
        drop(signals);
        assert!(control.request_pause(false).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn dropped_ack_is_closed() {
        let (control, mut signals) = channel();
        tokio::spawn(async move {
            let req = signals.pause.recv().await;
            drop(req);
        });
        assert!(control.request_pause(false).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn cancel_closes_resume_and_pause() {
        let (mut control, mut signals) = channel();
        control.cancel();
        control.cancel();

        assert!(control.is_cancelled());
        assert!(signals.cancel.is_cancelled());
        assert_eq!(signals.resume.recv().await, None);
        assert!(control.request_pause(false).await.unwrap_err().is_closed());
    }
}
