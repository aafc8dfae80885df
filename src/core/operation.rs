//! Handle to one running backup, restore or verification.
//!
//! The worker owns the sending side of a `watch` channel; the caller polls
//! [`OperationHandle::progress`] on its own tick. Completion and failure are
//! carried by the handle itself, never by process-wide state.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::core::models::ProgressUpdate;
use crate::error::{Error, Result};

/// Something an operation produces that can be summarized on completion.
pub trait Outcome {
    fn summary(&self) -> String;
}

/// Passed to the worker future.
#[derive(Clone)]
pub struct OperationContext {
    pub id: Uuid,
    pub progress: watch::Sender<ProgressUpdate>,
    pub cancel: CancellationToken,
}

impl OperationContext {
    pub fn report(&self, update: ProgressUpdate) {
        // Terminal updates belong to the handle.
        if !update.done {
            self.progress.send_replace(update);
        }
    }
}

pub struct OperationHandle<T> {
    id: Uuid,
    progress: watch::Receiver<ProgressUpdate>,
    cancel: CancellationToken,
    task: JoinHandle<Result<T>>,
}

impl<T> OperationHandle<T>
where
    T: Outcome + Send + 'static,
{
    /// Start `work` on the runtime. The returned handle always ends with
    /// exactly one `done` update, even if the worker panics.
    pub fn spawn<F, Fut>(kind: &'static str, work: F) -> Self
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = Uuid::now_v7();
        let (tx, rx) = watch::channel(ProgressUpdate::idle());
        let cancel = CancellationToken::new();
        let ctx = OperationContext {
            id,
            progress: tx.clone(),
            cancel: cancel.clone(),
        };

        let span = info_span!("operation", %id, kind);
        let inner = tokio::spawn(work(ctx).instrument(span.clone()));

        let task = tokio::spawn(
            async move {
                let result = match inner.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Other(anyhow::anyhow!("worker task failed: {}", e))),
                };
                let terminal = match &result {
                    Ok(outcome) => {
                        let summary = outcome.summary();
                        info!(%summary, "Operation finished");
                        ProgressUpdate::completed(summary)
                    }
                    Err(e) => {
                        error!(error = %e, "Operation failed");
                        ProgressUpdate::failed(e.to_string())
                    }
                };
                tx.send_replace(terminal);
                result
            }
            .instrument(span),
        );

        Self {
            id,
            progress: rx,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest update. Cheap; meant to be called on every UI tick.
    pub fn progress(&self) -> ProgressUpdate {
        self.progress.borrow().clone()
    }

    /// A receiver for callers that prefer to await changes.
    pub fn subscribe(&self) -> watch::Receiver<ProgressUpdate> {
        self.progress.clone()
    }

    /// Request cooperative cancellation. In-flight file copies finish first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(anyhow::anyhow!("operation task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::OperationPhase;
    use std::time::Duration;

    struct Done(u32);

    impl Outcome for Done {
        fn summary(&self) -> String {
            format!("done {}", self.0)
        }
    }

    #[tokio::test]
    async fn success_ends_with_completed_update() {
        let handle = OperationHandle::spawn("test", |ctx| async move {
            ctx.report(ProgressUpdate::running(OperationPhase::Copying, 0.5, "half"));
            Ok(Done(7))
        });
        let mut rx = handle.subscribe();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.0, 7);

        let last = rx.borrow_and_update().clone();
        assert!(last.done);
        assert_eq!(last.message, "done 7");
        assert_eq!(last.error, None);
    }

    #[tokio::test]
    async fn failure_carries_error_text() {
        let handle = OperationHandle::<Done>::spawn("test", |_ctx| async move {
            Err(Error::Config("no drive".to_string()))
        });
        let rx = handle.subscribe();
        assert!(handle.wait().await.is_err());

        let last = rx.borrow().clone();
        assert!(last.done);
        assert!(last.error.unwrap().contains("no drive"));
    }

    #[tokio::test]
    async fn worker_cannot_publish_terminal_update() {
        let handle = OperationHandle::spawn("test", |ctx| async move {
            ctx.report(ProgressUpdate::completed("too early"));
            assert!(!ctx.progress.borrow().done);
            Ok(Done(1))
        });
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn cancellation_reaches_worker() {
        let handle = OperationHandle::<Done>::spawn("test", |ctx| async move {
            ctx.cancel.cancelled().await;
            Err(Error::Cancelled)
        });
        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn panicking_worker_still_terminates() {
        let handle = OperationHandle::<Done>::spawn("test", |_ctx| async move {
            if true {
                panic!("boom");
            }
            Ok(Done(0))
        });
        let rx = handle.subscribe();
        assert!(handle.wait().await.is_err());
        assert!(rx.borrow().done);
    }
}
