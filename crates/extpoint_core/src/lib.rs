//! Extension-point dispatch core.
//!
//! Features register ordered, conditionally active extensions against named
//! points of a [`Registry`]; callers dispatch typed capability calls across
//! them with a shared [`Baton`]. On top of that sit the subsystem
//! [`Mediator`] and the persisted task [`Updater`].

pub mod config;
pub mod db;
pub mod extension;
pub mod logging;
pub mod mediator;
pub mod updater;

pub use config::{ConfigError, CoreConfig, LoggingConfig};
pub use extension::baton::{Baton, InvokeFrame, DEFAULT_EXTENSION_ID};
pub use extension::dispatch::{
    Action, Contribution, ExtensionError, ExtensionFuture, ExtensionResult, Invocation, Outcome,
};
pub use extension::point::{Perform, Point, ALL_EXTENSIONS};
pub use extension::registry::{Registry, RegistryError};
pub use extension::spec::{
    Anchor, Extension, ExtensionSpec, Guard, Index, RegistrationError, INDEX_STEP,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use mediator::{
    async_step, sync_step, Mediation, Mediator, MediatorStep, StepOutcome, StepReport,
};
pub use updater::{
    MemoryStateStore, SqliteStateStore, StoreError, TaskOutcome, TaskReport, TaskState,
    TaskStateMap, UpdateReport, UpdateStateStore, UpdateTask, Updater, UpdaterError,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
