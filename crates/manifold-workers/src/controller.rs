//! Background worker orchestration bound to an application lifespan:
//! start a cohort of long-running tasks as a unit, stop them as a unit,
//! and surface the first real failure at stop time.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use manifold_core::error::BoxError;

/// Shared dependencies handed to every worker, plus the controller's
/// shutdown token.
///
/// Values are type-keyed: insert each shared service once, read it back by
/// type inside the worker. Cloning is cheap and shares the same entries.
#[derive(Clone, Default)]
pub struct WorkerContext {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    shutdown: CancellationToken,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shared value, replacing any previous value of the same type.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Look up a shared value by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// The token this worker must watch for cooperative shutdown.
    ///
    /// A worker that observes cancellation should clean up and return
    /// `Ok(())`; anything else it returns is treated as a real failure.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn with_shutdown(&self, shutdown: CancellationToken) -> Self {
        Self {
            entries: self.entries.clone(),
            shutdown,
        }
    }
}

/// A long-running background task.
pub type Worker = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Adapt an `async fn(WorkerContext) -> Result<(), BoxError>` into a
/// [`Worker`].
pub fn worker<F, Fut>(f: F) -> Worker
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Errors from starting or stopping a worker cohort.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker controller is already started")]
    AlreadyStarted,
    #[error("worker failed: {0}")]
    Worker(#[source] BoxError),
    #[error("worker panicked: {0}")]
    Panic(#[source] tokio::task::JoinError),
}

impl WorkerError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyStarted => "already_started",
            Self::Worker(_) => "worker",
            Self::Panic(_) => "panic",
        }
    }
}

/// Starts and stops a set of long-running tasks as a unit.
///
/// The controller is either fully stopped (no tasks, no token) or fully
/// started. A worker's own error is deferred and only surfaces when
/// [`WorkerController::stop`] is called.
#[derive(Default)]
pub struct WorkerController {
    tasks: Vec<JoinHandle<Result<(), BoxError>>>,
    shutdown: Option<CancellationToken>,
}

impl WorkerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any tasks are currently scheduled.
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Schedule `workers` as concurrent tasks, injecting `context` (with a
    /// child shutdown token) into each. Fails if already started.
    pub fn start(
        &mut self,
        workers: impl IntoIterator<Item = Worker>,
        context: WorkerContext,
    ) -> Result<(), WorkerError> {
        if !self.tasks.is_empty() {
            return Err(WorkerError::AlreadyStarted);
        }
        let token = CancellationToken::new();
        for worker in workers {
            let ctx = context.with_shutdown(token.child_token());
            self.tasks.push(tokio::spawn(worker(ctx)));
        }
        self.shutdown = Some(token);
        info!(workers = self.tasks.len(), "worker cohort started");
        Ok(())
    }

    /// Cancel every task, await completion, and re-raise the first real
    /// failure. Cancellation is an expected outcome, never an error.
    ///
    /// Idempotent: calling with nothing running returns immediately.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
        let results = futures::future::join_all(self.tasks.drain(..)).await;

        let mut first: Option<WorkerError> = None;
        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(error = %err, "worker finished with error");
                    if first.is_none() {
                        first = Some(WorkerError::Worker(err));
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if first.is_none() {
                        first = Some(WorkerError::Panic(join_err));
                    }
                }
            }
        }
        info!("worker cohort stopped");
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Flag(AtomicBool);

    async fn wait_for(flag: &Arc<Flag>) {
        for _ in 0..200 {
            if flag.0.load(Ordering::Relaxed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("flag never set");
    }

    fn idle_worker() -> Worker {
        worker(|ctx: WorkerContext| async move {
            ctx.shutdown().cancelled().await;
            Ok(())
        })
    }

    #[tokio::test]
    async fn start_runs_workers_with_context() {
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let context = WorkerContext::new().with(Arc::clone(&flag));

        let mut controller = WorkerController::new();
        controller
            .start(
                [worker(|ctx: WorkerContext| async move {
                    let flag = ctx.get::<Arc<Flag>>().unwrap();
                    flag.0.store(true, Ordering::Relaxed);
                    ctx.shutdown().cancelled().await;
                    Ok(())
                })],
                context,
            )
            .unwrap();

        wait_for(&flag).await;
        assert!(controller.is_running());
        controller.stop().await.unwrap();
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn second_start_without_stop_fails() {
        let mut controller = WorkerController::new();
        controller.start([idle_worker()], WorkerContext::new()).unwrap();

        let err = controller
            .start([idle_worker()], WorkerContext::new())
            .unwrap_err();
        assert_eq!(err.kind(), "already_started");

        controller.stop().await.unwrap();
        // After a stop the controller may start again.
        controller.start([idle_worker()], WorkerContext::new()).unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut controller = WorkerController::new();
        controller.stop().await.unwrap();

        controller.start([idle_worker()], WorkerContext::new()).unwrap();
        controller.stop().await.unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn worker_error_surfaces_at_stop() {
        let mut controller = WorkerController::new();
        controller
            .start(
                [worker(|_ctx: WorkerContext| async move {
                    Err::<(), BoxError>("worker blew up".into())
                })],
                WorkerContext::new(),
            )
            .unwrap();

        // Let the worker finish; its error must stay deferred until stop.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = controller.stop().await.unwrap_err();
        assert_eq!(err.kind(), "worker");
        assert!(err.to_string().contains("worker blew up"));
    }

    #[tokio::test]
    async fn first_error_wins_across_workers() {
        let mut controller = WorkerController::new();
        controller
            .start(
                [
                    worker(|_ctx: WorkerContext| async move {
                        Err::<(), BoxError>("first failure".into())
                    }),
                    idle_worker(),
                ],
                WorkerContext::new(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = controller.stop().await.unwrap_err();
        assert!(err.to_string().contains("first failure"));
    }

    #[tokio::test]
    async fn worker_panic_surfaces_at_stop() {
        let mut controller = WorkerController::new();
        controller
            .start(
                [worker(|_ctx: WorkerContext| async move {
                    panic!("worker panicked hard");
                })],
                WorkerContext::new(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = controller.stop().await.unwrap_err();
        assert_eq!(err.kind(), "panic");
    }

    #[tokio::test]
    async fn cancellation_lets_workers_clean_up() {
        static CLEANED: AtomicUsize = AtomicUsize::new(0);

        let mut controller = WorkerController::new();
        controller
            .start(
                [
                    worker(|ctx: WorkerContext| async move {
                        ctx.shutdown().cancelled().await;
                        CLEANED.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }),
                    worker(|ctx: WorkerContext| async move {
                        ctx.shutdown().cancelled().await;
                        CLEANED.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }),
                ],
                WorkerContext::new(),
            )
            .unwrap();

        controller.stop().await.unwrap();
        assert_eq!(CLEANED.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn context_values_shared_not_copied() {
        let counter = Arc::new(AtomicUsize::new(0));
        let context = WorkerContext::new().with(Arc::clone(&counter));

        let workers: Vec<Worker> = (0..3)
            .map(|_| {
                worker(|ctx: WorkerContext| async move {
                    let counter = ctx.get::<Arc<AtomicUsize>>().unwrap();
                    counter.fetch_add(1, Ordering::Relaxed);
                    ctx.shutdown().cancelled().await;
                    Ok(())
                })
            })
            .collect();

        let mut controller = WorkerController::new();
        controller.start(workers, context).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.stop().await.unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn context_get_missing_type_is_none() {
        let ctx = WorkerContext::new().with(7_u64);
        assert_eq!(ctx.get::<u64>().map(|v| *v), Some(7));
        assert!(ctx.get::<String>().is_none());
    }
}
