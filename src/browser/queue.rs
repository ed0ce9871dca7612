//! Single-consumer browser action queue.
//!
//! All browser interactions are funneled through one bounded channel drained
//! by one dedicated worker task, so actions never interleave against the same
//! session. Task failures are isolated: a panicking task is caught and
//! logged, and the worker keeps draining the queue. The worker itself is
//! supervised by `ensure_worker` (called from the watchdog), which respawns
//! it if it has died.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("action queue saturated")]
    Saturated,
    #[error("worker is not running")]
    WorkerGone,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{0} aborted before replying")]
    Aborted(&'static str),
}

type TaskFn<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

pub struct QueuedTask<S> {
    label: &'static str,
    run: TaskFn<S>,
}

struct QueueShared<S> {
    rx: AsyncMutex<mpsc::Receiver<QueuedTask<S>>>,
    state: AsyncMutex<S>,
}

pub struct ActionQueue<S> {
    tx: mpsc::Sender<QueuedTask<S>>,
    shared: Arc<QueueShared<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> ActionQueue<S> {
    pub fn new(state: S, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            shared: Arc::new(QueueShared {
                rx: AsyncMutex::new(rx),
                state: AsyncMutex::new(state),
            }),
            worker: Mutex::new(None),
        };
        queue.ensure_worker();
        queue
    }

    /// Spawn the worker if it is missing or has died. Returns true when a new
    /// worker was spawned.
    pub fn ensure_worker(&self) -> bool {
        let mut worker = self.worker.lock();
        if worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return false;
        }

        let shared = self.shared.clone();
        let respawned = worker.is_some();
        *worker = Some(tokio::spawn(async move {
            loop {
                let task = { shared.rx.lock().await.recv().await };
                let Some(QueuedTask { label, run }) = task else {
                    break;
                };

                let mut state = shared.state.lock().await;
                let outcome = AssertUnwindSafe(run(&mut *state)).catch_unwind().await;
                if outcome.is_err() {
                    error!(task = label, "browser task panicked; worker continues");
                }
            }
        }));
        if respawned {
            info!("browser worker respawned");
        }
        true
    }

    pub fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Enqueue an action and await its typed reply, bounded by `timeout`.
    /// The submitted future runs exclusively against the queue state; errors
    /// belong in the reply type `R`.
    pub async fn submit<R, F>(
        &self,
        label: &'static str,
        timeout: Duration,
        action: F,
    ) -> Result<R, SubmitError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<R>();
        let task = QueuedTask {
            label,
            run: Box::new(move |state: &mut S| {
                async move {
                    let result = action(state).await;
                    let _ = reply_tx.send(result);
                }
                .boxed()
            }),
        };

        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::Saturated,
            mpsc::error::TrySendError::Closed(_) => SubmitError::WorkerGone,
        })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(SubmitError::Timeout(label)),
            Ok(Err(_)) => Err(SubmitError::Aborted(label)),
            Ok(Ok(result)) => Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn submits_serialize_against_state() {
        let queue = ActionQueue::new(0u32, 8);
        for _ in 0..10 {
            queue
                .submit("incr", Duration::from_secs(1), |state: &mut u32| {
                    async move {
                        *state += 1;
                    }
                    .boxed()
                })
                .await
                .unwrap();
        }
        let value = queue
            .submit("read", Duration::from_secs(1), |state: &mut u32| {
                async move { *state }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(value, 10);
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let queue = ActionQueue::new(0u32, 8);

        let crashed: Result<(), _> = queue
            .submit("boom", Duration::from_secs(1), |_: &mut u32| {
                async move { panic!("injected failure") }.boxed()
            })
            .await;
        assert!(matches!(crashed, Err(SubmitError::Aborted(_))));

        // The next well-formed task completes within its timeout.
        let ok = queue
            .submit("after", Duration::from_secs(1), |state: &mut u32| {
                async move {
                    *state += 1;
                    *state
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(ok, 1);
        assert!(queue.worker_alive());
    }

    #[tokio::test]
    async fn erroring_task_is_isolated_too() {
        let queue = ActionQueue::new(0u32, 8);

        let failed: Result<anyhow::Result<u32>, _> = queue
            .submit("fails", Duration::from_secs(1), |_: &mut u32| {
                async move { anyhow::bail!("storage offline") }.boxed()
            })
            .await;
        assert!(failed.unwrap().is_err());

        let ok = queue
            .submit("next", Duration::from_secs(1), |state: &mut u32| {
                async move { *state }.boxed()
            })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn slow_task_times_out_but_worker_survives() {
        let queue = ActionQueue::new(0u32, 8);

        let slow = queue
            .submit("slow", Duration::from_millis(20), |_: &mut u32| {
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                .boxed()
            })
            .await;
        assert!(matches!(slow, Err(SubmitError::Timeout(_))));

        let ok = queue
            .submit("fast", Duration::from_secs(1), |state: &mut u32| {
                async move { *state }.boxed()
            })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn saturated_queue_rejects_instead_of_blocking() {
        let queue = Arc::new(ActionQueue::new(0u32, 1));

        // Occupy the worker so the channel backs up.
        let holder = queue.clone();
        tokio::spawn(async move {
            holder
                .submit("hold", Duration::from_millis(500), |_: &mut u32| {
                    async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    .boxed()
                })
                .await
                .ok();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut saturated = false;
        for _ in 0..4 {
            let result = queue
                .submit("fill", Duration::from_millis(1), |_: &mut u32| {
                    async move {}.boxed()
                })
                .await;
            if matches!(result, Err(SubmitError::Saturated)) {
                saturated = true;
                break;
            }
        }
        assert!(saturated);
    }
}
