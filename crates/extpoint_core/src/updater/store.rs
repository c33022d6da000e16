//! Durable task-state storage contracts.

use crate::db::DbError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// Persisted outcome of one update task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Success,
    Failure,
    /// Any other stored value; treated like `Failure`.
    #[serde(other)]
    Unknown,
}

/// Task id -> last recorded state.
pub type TaskStateMap = BTreeMap<String, TaskState>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable state read/write errors.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    Serialization(serde_json::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "invalid task state record: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Keyed record holding the task-state map.
///
/// `load` returns `None` when the record was never written, which is
/// distinct from an empty map.
pub trait UpdateStateStore {
    fn load(&self) -> StoreResult<Option<TaskStateMap>>;
    fn save(&self, state: &TaskStateMap) -> StoreResult<()>;
}

impl<S: UpdateStateStore + ?Sized> UpdateStateStore for &S {
    fn load(&self) -> StoreResult<Option<TaskStateMap>> {
        (**self).load()
    }

    fn save(&self, state: &TaskStateMap) -> StoreResult<()> {
        (**self).save(state)
    }
}

/// In-process store, mainly for tests and embedding without SQLite.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<Option<TaskStateMap>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    /// Store with no record at all (fresh installation).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: TaskStateMap) -> Self {
        Self {
            state: RwLock::new(Some(state)),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<TaskStateMap> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful `save` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl UpdateStateStore for MemoryStateStore {
    fn load(&self) -> StoreResult<Option<TaskStateMap>> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &TaskStateMap) -> StoreResult<()> {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
