//! Supervised task set.
//!
//! Every long-running component is registered with a name, a factory that
//! builds its future from the shared [`ShutdownSignal`], and a
//! [`RestartPolicy`]. Failures (errors and panics alike) come back to
//! [`Supervisor::run`], which applies the policy:
//!
//! - `Terminate`: log, trigger global shutdown, surface the error
//! - `Restart`: log, wait the backoff (unless shutting down), respawn;
//!   exhausting the restart budget escalates to terminate
//!
//! Once shutdown fires, tasks get [`ShutdownSignal::timeout`] to finish
//! before the remainder is aborted.

use crate::shutdown::ShutdownSignal;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{error, info, warn};

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type TaskFactory = Arc<dyn Fn(ShutdownSignal) -> TaskFuture + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("task '{name}' failed: {reason}")]
    TaskFailed { name: String, reason: String },

    #[error("task '{name}' failed after {restarts} restarts: {reason}")]
    RestartsExhausted {
        name: String,
        restarts: u32,
        reason: String,
    },
}

/// What to do when a supervised task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Stop everything and report the failure
    Terminate,
    /// Respawn after `backoff`, at most `max_restarts` times
    Restart { max_restarts: u32, backoff: Duration },
}

#[derive(Debug)]
enum TaskExit {
    Completed,
    Failed(String),
}

struct TaskSpec {
    factory: TaskFactory,
    policy: RestartPolicy,
    restarts: u32,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Supervisor {
    shutdown: ShutdownSignal,
    specs: HashMap<String, TaskSpec>,
    tasks: JoinSet<(String, TaskExit)>,
}

impl Supervisor {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            specs: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Register and start a task.
    ///
    /// `factory` is called once per (re)start with the shared shutdown
    /// signal. Registering a name twice replaces the earlier policy.
    pub fn spawn<F, Fut, E>(&mut self, name: impl Into<String>, policy: RestartPolicy, factory: F)
    where
        F: Fn(ShutdownSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + 'static,
    {
        let name = name.into();
        let factory: TaskFactory = Arc::new(move |shutdown| {
            let fut = factory(shutdown);
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });

        self.specs.insert(
            name.clone(),
            TaskSpec {
                factory: factory.clone(),
                policy,
                restarts: 0,
            },
        );
        self.launch(name, factory, None);
    }

    fn launch(&mut self, name: String, factory: TaskFactory, delay: Option<Duration>) {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.cancelled() => return (name, TaskExit::Completed),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            // Run in its own task so a panic is reported instead of
            // tearing down the supervisor.
            let mut inner = AbortOnDrop(tokio::spawn(factory(shutdown)));
            let exit = match (&mut inner.0).await {
                Ok(Ok(())) => TaskExit::Completed,
                Ok(Err(reason)) => TaskExit::Failed(reason),
                Err(e) => TaskExit::Failed(describe_join_error(e)),
            };
            (name, exit)
        });
    }

    /// Drive every task to completion, applying restart policies.
    ///
    /// Returns the first terminating failure, if any.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut failure: Option<SupervisorError> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let joined = if self.shutdown.is_shutdown() {
                let deadline =
                    *deadline.get_or_insert_with(|| Instant::now() + self.shutdown.timeout());
                match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            remaining = self.tasks.len(),
                            "Tasks did not stop within the shutdown timeout, aborting"
                        );
                        self.tasks.shutdown().await;
                        break;
                    }
                }
            } else {
                tokio::select! {
                    joined = self.tasks.join_next() => joined,
                    _ = self.shutdown.cancelled() => continue,
                }
            };

            let Some(joined) = joined else { break };
            let (name, exit) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Supervisor wrapper task failed");
                    continue;
                }
            };

            match exit {
                TaskExit::Completed => info!(task = %name, "Task finished"),
                TaskExit::Failed(reason) => {
                    if let Some(err) = self.handle_failure(name, reason) {
                        failure.get_or_insert(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply the task's policy; returns an error when it escalates.
    fn handle_failure(&mut self, name: String, reason: String) -> Option<SupervisorError> {
        let Some(spec) = self.specs.get_mut(&name) else {
            error!(task = %name, reason = %reason, "Unregistered task failed");
            return None;
        };

        match spec.policy {
            RestartPolicy::Terminate => {
                error!(task = %name, reason = %reason, "Task failed, shutting down");
                self.shutdown.trigger();
                Some(SupervisorError::TaskFailed { name, reason })
            }
            RestartPolicy::Restart { .. } if self.shutdown.is_shutdown() => {
                warn!(task = %name, reason = %reason, "Task failed during shutdown, not restarting");
                None
            }
            RestartPolicy::Restart {
                max_restarts,
                backoff,
            } => {
                if spec.restarts >= max_restarts {
                    error!(
                        task = %name,
                        restarts = spec.restarts,
                        reason = %reason,
                        "Task exhausted its restarts, shutting down"
                    );
                    let restarts = spec.restarts;
                    self.shutdown.trigger();
                    return Some(SupervisorError::RestartsExhausted {
                        name,
                        restarts,
                        reason,
                    });
                }

                spec.restarts += 1;
                warn!(
                    task = %name,
                    restart = spec.restarts,
                    max_restarts,
                    backoff_ms = backoff.as_millis() as u64,
                    reason = %reason,
                    "Task failed, restarting"
                );
                let factory = spec.factory.clone();
                self.launch(name, factory, Some(backoff));
                None
            }
        }
    }
}

fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }

    let panic = e.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("panicked: {}", message)
}
