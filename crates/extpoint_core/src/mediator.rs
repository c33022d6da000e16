//! Subsystem setup sequencing.
//!
//! # Responsibility
//! - Register ordered setup steps for one named subsystem.
//! - Run them once per `mediate` call, strictly in index order.
//!
//! # Invariants
//! - Step `i + 1` starts only after step `i` settled.
//! - A failing or panicking step is recorded and the run continues.
//! - A run always completes and hands the context back.

use crate::extension::baton::Baton;
use crate::extension::dispatch::{run_guarded, ExtensionError, ExtensionResult};
use crate::extension::point::Point;
use crate::extension::registry::{Registry, RegistryError};
use crate::extension::spec::{ExtensionSpec, Index, RegistrationError, INDEX_STEP};
use futures::future::{self, BoxFuture};
use log::{error, info};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Point-name suffix holding a subsystem's steps.
pub const MEDIATOR_POINT_SUFFIX: &str = "mediator";

/// One setup step of a subsystem.
pub trait MediatorStep<C>: Send + Sync {
    fn setup<'a>(&'a self, context: &'a mut C) -> BoxFuture<'a, ExtensionResult<()>>;
}

struct SyncStep<F>(F);

impl<C, F> MediatorStep<C> for SyncStep<F>
where
    F: Fn(&mut C) -> ExtensionResult<()> + Send + Sync,
{
    fn setup<'a>(&'a self, context: &'a mut C) -> BoxFuture<'a, ExtensionResult<()>> {
        Box::pin(future::ready((self.0)(context)))
    }
}

struct AsyncStep<F>(F);

impl<C, F> MediatorStep<C> for AsyncStep<F>
where
    F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, ExtensionResult<()>> + Send + Sync,
{
    fn setup<'a>(&'a self, context: &'a mut C) -> BoxFuture<'a, ExtensionResult<()>> {
        (self.0)(context)
    }
}

/// Wraps a synchronous closure as a step.
pub fn sync_step<C, F>(step: F) -> Arc<dyn MediatorStep<C>>
where
    C: 'static,
    F: Fn(&mut C) -> ExtensionResult<()> + Send + Sync + 'static,
{
    Arc::new(SyncStep(step))
}

/// Wraps a closure returning a boxed future as a step.
pub fn async_step<C, F>(step: F) -> Arc<dyn MediatorStep<C>>
where
    C: 'static,
    F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, ExtensionResult<()>> + Send + Sync + 'static,
{
    Arc::new(AsyncStep(step))
}

/// Result of one step in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(ExtensionError),
    /// Rejected by a guard.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub id: String,
    pub outcome: StepOutcome,
}

/// Finished run: the context handed back plus per-step outcomes.
#[derive(Debug)]
pub struct Mediation<C> {
    pub context: C,
    pub run_id: Uuid,
    pub steps: Vec<StepReport>,
}

impl<C> Mediation<C> {
    pub fn failures(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|report| matches!(report.outcome, StepOutcome::Failed(_)))
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|report| report.outcome == StepOutcome::Completed)
            .map(|report| report.id.as_str())
            .collect()
    }

    pub fn into_context(self) -> C {
        self.context
    }
}

/// Ordered setup steps for one subsystem.
pub struct Mediator<C> {
    subsystem: String,
    point: Point<dyn MediatorStep<C>>,
}

impl<C> Clone for Mediator<C> {
    fn clone(&self) -> Self {
        Self {
            subsystem: self.subsystem.clone(),
            point: self.point.clone(),
        }
    }
}

impl Registry {
    /// Mediator for `subsystem`, backed by point `"<subsystem>/mediator"`.
    pub fn mediator<C: 'static>(&self, subsystem: &str) -> Result<Mediator<C>, RegistryError> {
        let point = self.point(&format!("{subsystem}/{MEDIATOR_POINT_SUFFIX}"))?;
        Ok(Mediator {
            subsystem: subsystem.to_string(),
            point,
        })
    }
}

impl<C: 'static> Mediator<C> {
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Underlying point, e.g. for guards or point-level disables.
    pub fn point(&self) -> &Point<dyn MediatorStep<C>> {
        &self.point
    }

    /// Registers steps in declaration order with ascending indices.
    pub fn register<I, S>(&self, steps: I) -> Result<&Self, RegistrationError>
    where
        I: IntoIterator<Item = (S, Arc<dyn MediatorStep<C>>)>,
        S: Into<String>,
    {
        let mut specs = Vec::new();
        let mut index = self.next_index();
        for (id, step) in steps {
            specs.push(ExtensionSpec::new(id, step).index(index));
            index = index.saturating_add(INDEX_STEP);
        }
        self.point.extend_all(specs)?;
        Ok(self)
    }

    fn next_index(&self) -> i64 {
        let max = self
            .point
            .all()
            .iter()
            .filter_map(|step| match step.index() {
                Index::At(value) => Some(value),
                _ => None,
            })
            .max();
        max.map_or(INDEX_STEP, |value| value.saturating_add(INDEX_STEP))
    }

    pub fn step<F>(&self, id: &str, step: F) -> Result<&Self, RegistrationError>
    where
        F: Fn(&mut C) -> ExtensionResult<()> + Send + Sync + 'static,
    {
        self.point.extend(ExtensionSpec::new(id, sync_step(step)))?;
        Ok(self)
    }

    pub fn step_async<F>(&self, id: &str, step: F) -> Result<&Self, RegistrationError>
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, ExtensionResult<()>> + Send + Sync + 'static,
    {
        self.point.extend(ExtensionSpec::new(id, async_step(step)))?;
        Ok(self)
    }

    pub fn step_at(
        &self,
        id: &str,
        index: i64,
        step: Arc<dyn MediatorStep<C>>,
    ) -> Result<&Self, RegistrationError> {
        self.point.extend(ExtensionSpec::new(id, step).index(index))?;
        Ok(self)
    }

    /// Runs every step once, in order, awaiting each before the next.
    ///
    /// Calling this again starts a fresh run from the first step.
    pub async fn mediate(&self, mut context: C) -> Mediation<C> {
        let run_id = Uuid::new_v4();
        let baton = Baton::new(());
        let steps = self.point.list();
        let started_at = Instant::now();
        info!(
            "event=mediate module=mediator status=start subsystem={} run={} steps={}",
            self.subsystem,
            run_id,
            steps.len()
        );

        let mut reports = Vec::with_capacity(steps.len());
        for step in steps {
            if !self.point.admits(&step, &baton, "mediate") {
                reports.push(StepReport {
                    id: step.id().to_string(),
                    outcome: StepOutcome::Skipped,
                });
                continue;
            }

            let step_started_at = Instant::now();
            let handler = step.handler();
            let target = &mut context;
            let outcome = match run_guarded(move || handler.setup(target)).await {
                Ok(()) => {
                    info!(
                        "event=mediate_step module=mediator status=ok subsystem={} run={} step={} duration_ms={}",
                        self.subsystem,
                        run_id,
                        step.id(),
                        step_started_at.elapsed().as_millis()
                    );
                    StepOutcome::Completed
                }
                Err(err) => {
                    error!(
                        "event=mediate_step module=mediator status=error subsystem={} run={} step={} duration_ms={} error={}",
                        self.subsystem,
                        run_id,
                        step.id(),
                        step_started_at.elapsed().as_millis(),
                        err
                    );
                    StepOutcome::Failed(err)
                }
            };
            reports.push(StepReport {
                id: step.id().to_string(),
                outcome,
            });
        }

        let failed = reports
            .iter()
            .filter(|report| matches!(report.outcome, StepOutcome::Failed(_)))
            .count();
        info!(
            "event=mediate module=mediator status=ok subsystem={} run={} steps={} failed={} duration_ms={}",
            self.subsystem,
            run_id,
            reports.len(),
            failed,
            started_at.elapsed().as_millis()
        );
        Mediation {
            context,
            run_id,
            steps: reports,
        }
    }
}
