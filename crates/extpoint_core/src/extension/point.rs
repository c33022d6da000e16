//! Extension points: ordered, guarded extension lists with typed dispatch.
//!
//! # Responsibility
//! - Keep extensions ordered by index, registration order and anchors.
//! - Dispatch one capability call across all eligible extensions.
//! - Run `perform` cascades for waterfall-style points.
//!
//! # Invariants
//! - Ascending index; equal indices keep registration order.
//! - One failing or panicking extension never stops the rest of a dispatch.
//! - Handlers run without the point lock held, so they may extend points.
//! - `list()` returns a snapshot; later registrations do not alter it.

use crate::extension::baton::Baton;
use crate::extension::dispatch::{
    run_guarded, Action, ExtensionError, ExtensionResult, Invocation, Outcome,
};
use crate::extension::spec::{
    Anchor, Extension, ExtensionSpec, Index, RegistrationError, INDEX_STEP,
};
use futures::future::BoxFuture;
use log::{debug, error, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Point-level disable marker matching every extension.
pub const ALL_EXTENSIONS: &str = "*";

type Replacement<E, D> = Box<dyn FnOnce(ExtensionSpec<E, D>) -> ExtensionSpec<E, D> + Send + Sync>;

struct PointState<E: ?Sized, D> {
    /// Registration order.
    entries: Vec<Arc<Extension<E, D>>>,
    /// Dispatch order, orphans excluded.
    ordered: Vec<Arc<Extension<E, D>>>,
    orphans: Vec<String>,
    /// Orphans whose anchors form a cycle and can never be placed.
    circular: Vec<String>,
    disabled: BTreeSet<String>,
    replacements: BTreeMap<String, Vec<Replacement<E, D>>>,
    next_seq: u64,
}

impl<E: ?Sized, D> Default for PointState<E, D> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            ordered: Vec::new(),
            orphans: Vec::new(),
            circular: Vec::new(),
            disabled: BTreeSet::new(),
            replacements: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<E: ?Sized, D> PointState<E, D> {
    fn default_index(&self) -> Index {
        let max = self
            .entries
            .iter()
            .filter_map(|extension| match extension.index() {
                Index::At(value) => Some(value),
                _ => None,
            })
            .max();
        Index::At(max.map_or(INDEX_STEP, |value| value.saturating_add(INDEX_STEP)))
    }

    fn is_enabled(&self, extension_id: &str) -> bool {
        !self.disabled.contains(extension_id) && !self.disabled.contains(ALL_EXTENSIONS)
    }

    fn rearrange(&mut self) {
        let mut basic = Vec::new();
        let mut befores: BTreeMap<String, Vec<Arc<Extension<E, D>>>> = BTreeMap::new();
        let mut afters: BTreeMap<String, Vec<Arc<Extension<E, D>>>> = BTreeMap::new();
        for extension in &self.entries {
            match extension.anchor() {
                Some(Anchor::Before(target)) => befores
                    .entry(target.clone())
                    .or_default()
                    .push(Arc::clone(extension)),
                Some(Anchor::After(target)) => afters
                    .entry(target.clone())
                    .or_default()
                    .push(Arc::clone(extension)),
                None => basic.push(Arc::clone(extension)),
            }
        }

        sort_group(&mut basic);
        let mut ordered = Vec::with_capacity(self.entries.len());
        for extension in basic {
            place(extension, &mut befores, &mut afters, &mut ordered);
        }

        let mut orphans: Vec<Arc<Extension<E, D>>> =
            befores.into_values().chain(afters.into_values()).flatten().collect();
        orphans.sort_by_key(|extension| extension.seq);
        self.circular = circular_ids(&orphans);
        self.orphans = orphans
            .iter()
            .map(|extension| extension.id().to_string())
            .collect();
        self.ordered = ordered;
    }
}

fn circular_ids<E: ?Sized, D>(orphans: &[Arc<Extension<E, D>>]) -> Vec<String> {
    let targets: BTreeMap<&str, &str> = orphans
        .iter()
        .filter_map(|extension| {
            extension
                .anchor()
                .map(|anchor| (extension.id(), anchor.target()))
        })
        .collect();
    targets
        .keys()
        .copied()
        .filter(|&start| {
            let mut current = start;
            for _ in 0..targets.len() {
                match targets.get(current).copied() {
                    Some(next) if next == start => return true,
                    Some(next) => current = next,
                    None => return false,
                }
            }
            false
        })
        .map(str::to_string)
        .collect()
}

fn sort_group<E: ?Sized, D>(group: &mut [Arc<Extension<E, D>>]) {
    group.sort_by(|a, b| a.index().cmp(&b.index()).then(a.seq.cmp(&b.seq)));
}

fn place<E: ?Sized, D>(
    extension: Arc<Extension<E, D>>,
    befores: &mut BTreeMap<String, Vec<Arc<Extension<E, D>>>>,
    afters: &mut BTreeMap<String, Vec<Arc<Extension<E, D>>>>,
    ordered: &mut Vec<Arc<Extension<E, D>>>,
) {
    if let Some(mut group) = befores.remove(extension.id()) {
        sort_group(&mut group);
        for anchored in group {
            place(anchored, befores, afters, ordered);
        }
    }
    let after_group = afters.remove(extension.id());
    ordered.push(extension);
    if let Some(mut group) = after_group {
        sort_group(&mut group);
        for anchored in group {
            place(anchored, befores, afters, ordered);
        }
    }
}

pub(crate) struct PointInner<E: ?Sized, D> {
    id: String,
    state: RwLock<PointState<E, D>>,
}

/// Handle to one named extension point.
///
/// Cloning is cheap; all clones share the same extension list.
pub struct Point<E: ?Sized, D = ()> {
    inner: Arc<PointInner<E, D>>,
}

impl<E: ?Sized, D> Clone for Point<E, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: ?Sized, D> std::fmt::Debug for Point<E, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("Point")
            .field("id", &self.inner.id)
            .field("extensions", &state.entries.len())
            .field("orphans", &state.orphans)
            .field("disabled", &state.disabled)
            .finish()
    }
}

impl<E: ?Sized, D> Point<E, D> {
    pub(crate) fn new_inner(id: &str) -> Arc<PointInner<E, D>> {
        Arc::new(PointInner {
            id: id.to_string(),
            state: RwLock::new(PointState::default()),
        })
    }

    pub(crate) fn from_inner(inner: Arc<PointInner<E, D>>) -> Self {
        Self { inner }
    }

    fn read(&self) -> RwLockReadGuard<'_, PointState<E, D>> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PointState<E, D>> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Registers one extension; an existing id is replaced.
    pub fn extend(&self, spec: ExtensionSpec<E, D>) -> Result<&Self, RegistrationError> {
        self.extend_all([spec])
    }

    /// Registers several extensions; nothing is registered if any spec is
    /// invalid.
    ///
    /// Queued `replace` amendments are applied before validation. When the
    /// batch is rejected, amendments already applied to it are discarded.
    pub fn extend_all<I>(&self, specs: I) -> Result<&Self, RegistrationError>
    where
        I: IntoIterator<Item = ExtensionSpec<E, D>>,
    {
        let specs: Vec<ExtensionSpec<E, D>> = specs.into_iter().collect();
        for spec in &specs {
            spec.validate(self.id())?;
        }

        let mut state = self.write();
        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            prepared.push(self.apply_queued(&mut state, spec)?);
        }
        for spec in prepared {
            self.insert(&mut state, spec);
        }
        self.reorder(&mut state);
        Ok(self)
    }

    fn reorder(&self, state: &mut PointState<E, D>) {
        state.rearrange();
        if !state.circular.is_empty() {
            warn!(
                "event=extension_order module=extension status=warn point={} reason=circular_anchors extensions={}",
                self.id(),
                state.circular.join(",")
            );
        }
    }

    fn apply_queued(
        &self,
        state: &mut PointState<E, D>,
        mut spec: ExtensionSpec<E, D>,
    ) -> Result<ExtensionSpec<E, D>, RegistrationError> {
        let id = spec.id.trim().to_string();
        if let Some(pending) = state.replacements.remove(id.as_str()) {
            for replacement in pending {
                spec = replacement(spec);
            }
            spec.id = id;
            spec.validate(self.id())?;
        } else {
            spec.id = id;
        }
        Ok(spec)
    }

    fn insert(&self, state: &mut PointState<E, D>, spec: ExtensionSpec<E, D>) {
        let id = spec.id.clone();
        let replaced = state.entries.len();
        state.entries.retain(|extension| extension.id() != id);
        let replaced = replaced != state.entries.len();

        let index = spec.index.unwrap_or_else(|| state.default_index());
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .entries
            .push(Arc::new(Extension::from_spec(spec, index, seq)));

        debug!(
            "event=extension_register module=extension status=ok point={} extension={} index={:?} replaced={}",
            self.id(),
            id,
            index,
            replaced
        );
    }

    /// Amends an extension in place, or queues the amendment until an
    /// extension with `extension_id` registers.
    pub fn replace<F>(&self, extension_id: &str, amend: F) -> Result<&Self, RegistrationError>
    where
        F: FnOnce(ExtensionSpec<E, D>) -> ExtensionSpec<E, D> + Send + Sync + 'static,
    {
        let id = extension_id.trim();
        if id.is_empty() {
            return Err(RegistrationError::MissingId {
                point: self.id().to_string(),
            });
        }

        let mut state = self.write();
        let Some(position) = state.entries.iter().position(|extension| extension.id() == id)
        else {
            state
                .replacements
                .entry(id.to_string())
                .or_default()
                .push(Box::new(amend));
            return Ok(self);
        };

        let current = &state.entries[position];
        let (index, seq) = (current.index(), current.seq);
        let mut spec = amend(current.to_spec());
        spec.id = id.to_string();
        spec.validate(self.id())?;
        let index = spec.index.unwrap_or(index);
        state.entries[position] = Arc::new(Extension::from_spec(spec, index, seq));
        self.reorder(&mut state);
        Ok(self)
    }

    pub fn has(&self, extension_id: &str) -> bool {
        self.read()
            .entries
            .iter()
            .any(|extension| extension.id() == extension_id)
    }

    pub fn get(&self, extension_id: &str) -> Option<Arc<Extension<E, D>>> {
        self.read()
            .entries
            .iter()
            .find(|extension| extension.id() == extension_id)
            .cloned()
    }

    /// Every placed extension in dispatch order, including disabled ones.
    pub fn all(&self) -> Vec<Arc<Extension<E, D>>> {
        self.read().ordered.clone()
    }

    /// Enabled extensions in dispatch order.
    pub fn list(&self) -> Vec<Arc<Extension<E, D>>> {
        let state = self.read();
        state
            .ordered
            .iter()
            .filter(|extension| state.is_enabled(extension.id()))
            .cloned()
            .collect()
    }

    /// Ids of every placed extension in dispatch order.
    pub fn keys(&self) -> Vec<String> {
        self.read()
            .ordered
            .iter()
            .map(|extension| extension.id().to_string())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.list().len()
    }

    /// Anchored extensions whose anchor has not registered yet.
    pub fn orphans(&self) -> Vec<String> {
        self.read().orphans.clone()
    }

    /// Orphans anchored to each other in a cycle.
    pub fn circular(&self) -> Vec<String> {
        self.read().circular.clone()
    }

    pub fn each<F>(&self, mut visit: F) -> &Self
    where
        F: FnMut(&Extension<E, D>),
    {
        for extension in self.list() {
            visit(&extension);
        }
        self
    }

    pub fn disable(&self, extension_id: &str) -> &Self {
        self.write().disabled.insert(extension_id.to_string());
        self
    }

    pub fn enable(&self, extension_id: &str) -> &Self {
        self.write().disabled.remove(extension_id);
        self
    }

    /// Sets the enabled state, or flips it when `state` is `None`.
    pub fn toggle(&self, extension_id: &str, state: Option<bool>) -> &Self {
        let enable = state.unwrap_or_else(|| self.read().disabled.contains(extension_id));
        if enable {
            self.enable(extension_id)
        } else {
            self.disable(extension_id)
        }
    }

    pub fn is_enabled(&self, extension_id: &str) -> bool {
        self.read().is_enabled(extension_id)
    }

    /// Calls `call` on every eligible extension in order.
    ///
    /// `method` labels the dispatch in logs and in the baton frame.
    /// Extensions disabled on the baton, rejected by a guard, or skipped
    /// because propagation stopped never reach `call`.
    pub fn invoke<R, F>(&self, method: &str, baton: &mut Baton<D>, mut call: F) -> Invocation<R>
    where
        F: FnMut(&E, &mut Baton<D>) -> Action<R>,
    {
        let mut invocation = Invocation::new(self.id(), method);
        let previous = baton.enter(self.id(), method);

        for extension in self.list() {
            if baton.is_propagation_stopped() {
                break;
            }
            if !self.admits(&extension, baton, method) {
                continue;
            }

            baton.set_extension(extension.id());
            let handler: &E = extension.handler();
            let action = panic::catch_unwind(AssertUnwindSafe(|| call(handler, &mut *baton)));
            let outcome = match action {
                Ok(Action::Pass) => continue,
                Ok(Action::Done(Ok(value))) => Outcome::Value(value),
                Ok(Action::Async(fut)) => Outcome::Pending(fut),
                Ok(Action::Done(Err(err))) => Outcome::Failed(err),
                Err(payload) => Outcome::Failed(ExtensionError::from_panic(payload)),
            };
            if let Outcome::Failed(err) = &outcome {
                error!(
                    "event=extension_invoke module=extension status=error point={} method={} extension={} baton={} error={}",
                    self.id(),
                    method,
                    extension.id(),
                    baton.id(),
                    err
                );
            }
            invocation.push(extension.id(), outcome);
        }

        baton.leave(previous);
        invocation
    }

    pub(crate) fn admits(&self, extension: &Extension<E, D>, baton: &Baton<D>, method: &str) -> bool {
        if baton.is_disabled(self.id(), extension.id()) {
            return false;
        }
        panic::catch_unwind(AssertUnwindSafe(|| extension.is_eligible(baton))).unwrap_or_else(
            |payload| {
                warn!(
                    "event=extension_guard module=extension status=error point={} method={} extension={} baton={} error={}",
                    self.id(),
                    method,
                    extension.id(),
                    baton.id(),
                    ExtensionError::from_panic(payload)
                );
                false
            },
        )
    }
}

/// Capability for waterfall points driven by [`Point::cascade`].
pub trait Perform<D>: Send + Sync {
    fn perform<'a>(&'a self, baton: &'a mut Baton<D>) -> BoxFuture<'a, ExtensionResult<()>>;
}

impl<D: 'static> Point<dyn Perform<D>, D> {
    /// Awaits every eligible extension's `perform` in order.
    ///
    /// A failure stops the cascade and is returned, unless the baton has
    /// `catch_errors` set: then the baton is marked rejected and the next
    /// extension still runs.
    pub async fn cascade(&self, baton: &mut Baton<D>) -> ExtensionResult<()> {
        let previous = baton.enter(self.id(), "perform");
        let mut result = Ok(());

        for extension in self.list() {
            if baton.is_propagation_stopped() {
                break;
            }
            if !self.admits(&extension, baton, "perform") {
                continue;
            }

            baton.set_extension(extension.id());
            let handler = extension.handler();
            let target = &mut *baton;
            let Err(err) = run_guarded(move || handler.perform(target)).await else {
                continue;
            };
            error!(
                "event=extension_cascade module=extension status=error point={} extension={} baton={} catch_errors={} error={}",
                self.id(),
                extension.id(),
                baton.id(),
                baton.catch_errors,
                err
            );
            if !baton.catch_errors {
                result = Err(err);
                break;
            }
            baton.reject(err);
        }

        baton.leave(previous);
        result
    }
}
