use extpoint_core::db::{open_db, open_db_in_memory};
use extpoint_core::{
    ExtensionError, ExtensionSpec, MemoryStateStore, Registry, SqliteStateStore, TaskOutcome,
    TaskState, TaskStateMap, UpdateStateStore, UpdateTask,
};
use futures::executor::block_on;
use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex};

type Calls = Arc<Mutex<Vec<&'static str>>>;

fn tracked(calls: &Calls, id: &'static str, fail: bool) -> impl Fn() -> Result<(), ExtensionError> {
    let calls = Arc::clone(calls);
    move || {
        calls.lock().expect("calls lock").push(id);
        if fail {
            Err(ExtensionError::new(format!("{id} failed")))
        } else {
            Ok(())
        }
    }
}

fn seeded(entries: &[(&str, TaskState)]) -> TaskStateMap {
    entries
        .iter()
        .map(|(id, state)| (id.to_string(), *state))
        .collect()
}

#[test]
fn first_run_guard_runs_nothing_and_writes_nothing() {
    let registry = Registry::new();
    let store = MemoryStateStore::new();
    let updater = registry.updater(&store).expect("updater");
    let calls: Calls = Arc::default();
    updater
        .task_sync("t1", tracked(&calls, "t1", false))
        .expect("register t1");

    let report = block_on(updater.run_updates()).expect("first pass");
    assert!(report.first_run);
    assert!(report.tasks.is_empty());
    assert!(calls.lock().expect("calls lock").is_empty());
    assert_eq!(store.writes(), 0);
    assert!(store.snapshot().is_none());
}

#[test]
fn empty_state_runs_every_task_in_order_without_fail_fast() {
    let registry = Registry::new();
    let store = MemoryStateStore::with_state(TaskStateMap::new());
    let updater = registry.updater(&store).expect("updater");
    let calls: Calls = Arc::default();
    updater
        .task_sync("a", tracked(&calls, "a", false))
        .expect("register a")
        .task_sync("b", tracked(&calls, "b", true))
        .expect("register b")
        .task_sync("c", tracked(&calls, "c", false))
        .expect("register c");

    let report = block_on(updater.run_updates()).expect("pass");
    assert_eq!(*calls.lock().expect("calls lock"), vec!["a", "b", "c"]);
    assert_eq!(report.executed(), vec!["a", "b", "c"]);
    assert_eq!(report.failures().len(), 1);
    assert_eq!(
        store.snapshot(),
        Some(seeded(&[
            ("a", TaskState::Success),
            ("b", TaskState::Failure),
            ("c", TaskState::Success),
        ]))
    );
    assert_eq!(store.writes(), 1);
}

#[test]
fn success_is_absorbing_and_failures_retry() {
    let registry = Registry::new();
    let store = MemoryStateStore::with_state(seeded(&[
        ("t1", TaskState::Success),
        ("t2", TaskState::Failure),
    ]));
    let updater = registry.updater(&store).expect("updater");
    let calls: Calls = Arc::default();
    updater
        .task_sync("t1", tracked(&calls, "t1", false))
        .expect("register t1")
        .task_sync("t2", tracked(&calls, "t2", false))
        .expect("register t2");

    let report = block_on(updater.run_updates()).expect("pass");
    assert_eq!(*calls.lock().expect("calls lock"), vec!["t2"]);
    assert_eq!(report.tasks[0].outcome, TaskOutcome::AlreadyApplied);
    assert_eq!(report.tasks[1].outcome, TaskOutcome::Succeeded);

    block_on(updater.run_updates()).expect("second pass");
    assert_eq!(*calls.lock().expect("calls lock"), vec!["t2"]);
    assert_eq!(store.writes(), 2);
}

#[test]
fn async_tasks_are_awaited_before_the_next_starts() {
    let registry = Registry::new();
    let store = MemoryStateStore::with_state(TaskStateMap::new());
    let updater = registry.updater(&store).expect("updater");
    let calls: Calls = Arc::default();

    let first = Arc::clone(&calls);
    let second = Arc::clone(&calls);
    updater
        .task("slow", move || {
            let calls = Arc::clone(&first);
            async move {
                calls.lock().expect("calls lock").push("slow:start");
                futures::future::ready(()).await;
                calls.lock().expect("calls lock").push("slow:end");
                Ok::<(), ExtensionError>(())
            }
        })
        .expect("register slow")
        .task("rejecting", move || {
            let calls = Arc::clone(&second);
            async move {
                calls.lock().expect("calls lock").push("rejecting");
                Err::<(), ExtensionError>(ExtensionError::new("remote refused"))
            }
        })
        .expect("register rejecting");

    let report = block_on(updater.run_updates()).expect("pass");
    assert_eq!(
        *calls.lock().expect("calls lock"),
        vec!["slow:start", "slow:end", "rejecting"]
    );
    assert_eq!(
        report.tasks[1].outcome,
        TaskOutcome::Failed(ExtensionError::new("remote refused"))
    );
    assert_eq!(report.state.get("rejecting"), Some(&TaskState::Failure));
}

struct Guarded;

impl UpdateTask for Guarded {
    fn run<'a>(&'a self) -> BoxFuture<'a, Result<(), ExtensionError>> {
        async { Ok::<(), ExtensionError>(()) }.boxed()
    }
}

#[test]
fn guarded_tasks_leave_state_untouched() {
    let registry = Registry::new();
    let store = MemoryStateStore::with_state(TaskStateMap::new());
    let updater = registry.updater(&store).expect("updater");
    let handler: Arc<dyn UpdateTask> = Arc::new(Guarded);
    updater
        .register(ExtensionSpec::new("later", handler).enabled(|_| false))
        .expect("register guarded");

    let report = block_on(updater.run_updates()).expect("pass");
    assert_eq!(report.tasks[0].outcome, TaskOutcome::Skipped);
    assert!(report.state.is_empty());
}

#[test]
fn panicking_guard_is_skipped_and_state_still_saved() {
    let registry = Registry::new();
    let store = MemoryStateStore::with_state(TaskStateMap::new());
    let updater = registry.updater(&store).expect("updater");
    let calls: Calls = Arc::default();
    let handler: Arc<dyn UpdateTask> = Arc::new(Guarded);
    updater
        .register(ExtensionSpec::new("bad", handler).enabled(|_| panic!("guard exploded")))
        .expect("register bad")
        .task_sync("after", tracked(&calls, "after", false))
        .expect("register after");

    let report = block_on(updater.run_updates()).expect("pass survives guard panic");
    assert_eq!(report.tasks[0].id, "bad");
    assert_eq!(report.tasks[0].outcome, TaskOutcome::Skipped);
    assert_eq!(report.tasks[1].outcome, TaskOutcome::Succeeded);
    assert_eq!(*calls.lock().expect("calls lock"), vec!["after"]);
    assert_eq!(store.writes(), 1);
    assert_eq!(store.snapshot(), Some(seeded(&[("after", TaskState::Success)])));
}

#[test]
fn sqlite_store_persists_state_across_connections() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("updates.db");
    let calls: Calls = Arc::default();

    {
        let conn = open_db(&path).expect("open db");
        let registry = Registry::new();
        let updater = registry
            .updater(SqliteStateStore::new(&conn))
            .expect("updater");
        updater
            .task_sync("t1", tracked(&calls, "t1", false))
            .expect("register t1")
            .task_sync("t2", tracked(&calls, "t2", true))
            .expect("register t2");

        let report = block_on(updater.run_updates()).expect("uninitialized pass");
        assert!(report.first_run);
        assert!(updater.initialize().expect("initialize"));
        block_on(updater.run_updates()).expect("first real pass");
    }
    assert_eq!(*calls.lock().expect("calls lock"), vec!["t1", "t2"]);

    let conn = open_db(&path).expect("reopen db");
    let store = SqliteStateStore::new(&conn);
    assert_eq!(
        store.load().expect("load"),
        Some(seeded(&[("t1", TaskState::Success), ("t2", TaskState::Failure)]))
    );

    let registry = Registry::new();
    let updater = registry.updater(store).expect("updater");
    updater
        .task_sync("t1", tracked(&calls, "t1", false))
        .expect("register t1")
        .task_sync("t2", tracked(&calls, "t2", false))
        .expect("register t2");
    let report = block_on(updater.run_updates()).expect("retry pass");
    assert_eq!(report.executed(), vec!["t2"]);
    assert_eq!(report.state.get("t2"), Some(&TaskState::Success));
}

#[test]
fn sqlite_store_key_is_configurable() {
    let conn = open_db_in_memory().expect("open db");
    let registry = Registry::new();
    let updater = registry
        .updater(SqliteStateStore::with_key(&conn, "plugins/updates"))
        .expect("updater");
    updater.initialize().expect("initialize");

    assert!(SqliteStateStore::new(&conn)
        .load()
        .expect("load default key")
        .is_none());
    assert_eq!(updater.store().key(), "plugins/updates");
}
