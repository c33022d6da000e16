//! Persisted one-time update tasks.
//!
//! # Responsibility
//! - Register update tasks on the `core/updates` point.
//! - Run every task that has not yet succeeded, once per pass, and remember
//!   each outcome across restarts.
//!
//! # Invariants
//! - `success` is absorbing: a succeeded task never runs again.
//! - Tasks run in registration order; a failure never stops the pass.
//! - A store that was never initialized runs nothing and is not written.
//! - One pass performs at most one `save`.
//!
//! Overlapping passes against the same store race on the final write and
//! are not supported.

pub mod sqlite_store;
pub mod store;

use crate::extension::baton::Baton;
use crate::extension::dispatch::{run_guarded, ExtensionError, ExtensionResult};
use crate::extension::point::Point;
use crate::extension::registry::{Registry, RegistryError};
use crate::extension::spec::{ExtensionSpec, RegistrationError};
use futures::future::{BoxFuture, FutureExt};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub use sqlite_store::{SqliteStateStore, DEFAULT_STATE_KEY};
pub use store::{
    MemoryStateStore, StoreError, StoreResult, TaskState, TaskStateMap, UpdateStateStore,
};

/// Point holding update tasks.
pub const UPDATES_POINT: &str = "core/updates";

/// One persisted update task.
pub trait UpdateTask: Send + Sync {
    fn run<'a>(&'a self) -> BoxFuture<'a, ExtensionResult<()>>;
}

struct FnTask<F>(F);

impl<F, Fut> UpdateTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ExtensionResult<()>> + Send + 'static,
{
    fn run<'a>(&'a self) -> BoxFuture<'a, ExtensionResult<()>> {
        (self.0)().boxed()
    }
}

struct SyncTask<F>(F);

impl<F> UpdateTask for SyncTask<F>
where
    F: Fn() -> ExtensionResult<()> + Send + Sync,
{
    fn run<'a>(&'a self) -> BoxFuture<'a, ExtensionResult<()>> {
        futures::future::ready((self.0)()).boxed()
    }
}

/// What happened to one task during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Recorded as `success` by an earlier pass; not run.
    AlreadyApplied,
    Succeeded,
    Failed(ExtensionError),
    /// Rejected by a guard or disabled on the point; state left untouched.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub id: String,
    pub outcome: TaskOutcome,
}

/// Result of one `run_updates` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub run_id: Uuid,
    /// `true` when the store had never been initialized; nothing ran.
    pub first_run: bool,
    pub tasks: Vec<TaskReport>,
    /// State as persisted at the end of the pass.
    pub state: TaskStateMap,
}

impl UpdateReport {
    pub fn executed(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|report| {
                matches!(
                    report.outcome,
                    TaskOutcome::Succeeded | TaskOutcome::Failed(_)
                )
            })
            .map(|report| report.id.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<&TaskReport> {
        self.tasks
            .iter()
            .filter(|report| matches!(report.outcome, TaskOutcome::Failed(_)))
            .collect()
    }
}

/// Store access failed; task failures never surface here.
#[derive(Debug)]
pub enum UpdaterError {
    Load(StoreError),
    Save(StoreError),
}

impl Display for UpdaterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load update state: {err}"),
            Self::Save(err) => write!(f, "failed to save update state: {err}"),
        }
    }
}

impl Error for UpdaterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) | Self::Save(err) => Some(err),
        }
    }
}

pub type UpdaterResult<T> = Result<T, UpdaterError>;

/// Update tasks bound to a durable state store.
pub struct Updater<S> {
    point: Point<dyn UpdateTask>,
    store: S,
}

impl Registry {
    /// Updater over the shared `core/updates` point.
    pub fn updater<S: UpdateStateStore>(&self, store: S) -> Result<Updater<S>, RegistryError> {
        Ok(Updater {
            point: self.point(UPDATES_POINT)?,
            store,
        })
    }
}

impl<S: UpdateStateStore> Updater<S> {
    pub fn point(&self) -> &Point<dyn UpdateTask> {
        &self.point
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Appends an asynchronous task.
    pub fn task<F, Fut>(&self, id: &str, task: F) -> Result<&Self, RegistrationError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExtensionResult<()>> + Send + 'static,
    {
        self.register(ExtensionSpec::new(id, Arc::new(FnTask(task))))
    }

    /// Appends a synchronous task.
    pub fn task_sync<F>(&self, id: &str, task: F) -> Result<&Self, RegistrationError>
    where
        F: Fn() -> ExtensionResult<()> + Send + Sync + 'static,
    {
        self.register(ExtensionSpec::new(id, Arc::new(SyncTask(task))))
    }

    /// Registers a fully specified task, e.g. one carrying a guard.
    pub fn register(
        &self,
        spec: ExtensionSpec<dyn UpdateTask>,
    ) -> Result<&Self, RegistrationError> {
        self.point.extend(spec)?;
        Ok(self)
    }

    /// Marks the installation as eligible for future passes.
    ///
    /// Returns `false` when state already existed.
    pub fn initialize(&self) -> UpdaterResult<bool> {
        if self.store.load().map_err(UpdaterError::Load)?.is_some() {
            return Ok(false);
        }
        self.store
            .save(&TaskStateMap::new())
            .map_err(UpdaterError::Save)?;
        info!("event=updater_init module=updater status=ok");
        Ok(true)
    }

    /// Runs every task not yet recorded as `success`.
    pub async fn run_updates(&self) -> UpdaterResult<UpdateReport> {
        let run_id = Uuid::new_v4();
        let started_at = Instant::now();
        let Some(mut state) = self.store.load().map_err(UpdaterError::Load)? else {
            info!(
                "event=run_updates module=updater status=skipped run={} reason=first_run",
                run_id
            );
            return Ok(UpdateReport {
                run_id,
                first_run: true,
                tasks: Vec::new(),
                state: TaskStateMap::new(),
            });
        };

        let tasks = self.point.list();
        info!(
            "event=run_updates module=updater status=start run={} tasks={} recorded={}",
            run_id,
            tasks.len(),
            state.len()
        );

        let baton = Baton::new(());
        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = task.id().to_string();
            if state.get(&id) == Some(&TaskState::Success) {
                reports.push(TaskReport {
                    id,
                    outcome: TaskOutcome::AlreadyApplied,
                });
                continue;
            }
            if !self.point.admits(&task, &baton, "run_updates") {
                reports.push(TaskReport {
                    id,
                    outcome: TaskOutcome::Skipped,
                });
                continue;
            }

            let task_started_at = Instant::now();
            let handler = task.handler();
            let outcome = match run_guarded(|| handler.run()).await {
                Ok(()) => {
                    info!(
                        "event=update_task module=updater status=ok run={} task={} duration_ms={}",
                        run_id,
                        id,
                        task_started_at.elapsed().as_millis()
                    );
                    state.insert(id.clone(), TaskState::Success);
                    TaskOutcome::Succeeded
                }
                Err(err) => {
                    error!(
                        "event=update_task module=updater status=error run={} task={} duration_ms={} error={}",
                        run_id,
                        id,
                        task_started_at.elapsed().as_millis(),
                        err
                    );
                    state.insert(id.clone(), TaskState::Failure);
                    TaskOutcome::Failed(err)
                }
            };
            reports.push(TaskReport { id, outcome });
        }

        if let Err(err) = self.store.save(&state) {
            warn!(
                "event=run_updates module=updater status=error run={} stage=save error={}",
                run_id, err
            );
            return Err(UpdaterError::Save(err));
        }

        let report = UpdateReport {
            run_id,
            first_run: false,
            tasks: reports,
            state,
        };
        info!(
            "event=run_updates module=updater status=ok run={} executed={} failed={} duration_ms={}",
            run_id,
            report.executed().len(),
            report.failures().len(),
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }
}
