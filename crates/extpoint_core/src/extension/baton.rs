//! Per-dispatch shared context.
//!
//! # Responsibility
//! - Carry the payload every extension of one dispatch chain reads and refines.
//! - Scope extension disables to one baton instance.
//! - Track the currently running invocation frame for nested dispatch.
//!
//! # Invariants
//! - Disables recorded on one baton never leak into another baton.
//! - The invocation frame is restored after each nested dispatch.

use crate::extension::dispatch::ExtensionError;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Extension id suppressed by [`Baton::prevent_default`].
pub const DEFAULT_EXTENSION_ID: &str = "default";

/// Invocation currently driving a baton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFrame {
    pub point: String,
    pub method: String,
    pub extension: Option<String>,
}

/// Mutable context threaded through one dispatch chain.
#[derive(Debug, Clone)]
pub struct Baton<D = ()> {
    pub data: D,
    /// When set, a cascade keeps going after a failing extension.
    pub catch_errors: bool,
    id: Uuid,
    disabled: BTreeMap<String, BTreeSet<String>>,
    default_prevented: bool,
    propagation_stopped: bool,
    rejected: bool,
    error: Option<ExtensionError>,
    frame: Option<InvokeFrame>,
}

impl<D> From<D> for Baton<D> {
    fn from(data: D) -> Self {
        Baton::new(data)
    }
}

impl<D> Baton<D> {
    pub fn new(data: D) -> Self {
        Self {
            data,
            catch_errors: false,
            id: Uuid::new_v4(),
            disabled: BTreeMap::new(),
            default_prevented: false,
            propagation_stopped: false,
            rejected: false,
            error: None,
            frame: None,
        }
    }

    /// Returns `input` unchanged when it is already a baton, otherwise wraps
    /// the payload in a fresh one.
    pub fn ensure(input: impl Into<Baton<D>>) -> Self {
        input.into()
    }

    /// Correlation id used in dispatch log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn into_data(self) -> D {
        self.data
    }

    /// Suppresses `extension_id` on `point_id` for this baton only.
    pub fn disable(&mut self, point_id: &str, extension_id: &str) {
        if extension_id.trim().is_empty() {
            warn!(
                "event=baton_disable module=extension status=ignored baton={} point={} reason=empty_extension_id",
                self.id, point_id
            );
            return;
        }
        self.disabled
            .entry(point_id.to_string())
            .or_default()
            .insert(extension_id.to_string());
    }

    /// Disables several extensions per point in one call.
    pub fn disable_all<'a, I, E>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a str, E)>,
        E: IntoIterator<Item = &'a str>,
    {
        for (point_id, extension_ids) in entries {
            for extension_id in extension_ids {
                self.disable(point_id, extension_id);
            }
        }
    }

    /// Lifts a baton-scoped disable.
    pub fn enable(&mut self, point_id: &str, extension_id: &str) {
        if let Some(ids) = self.disabled.get_mut(point_id) {
            ids.remove(extension_id);
            if ids.is_empty() {
                self.disabled.remove(point_id);
            }
        }
    }

    pub fn is_disabled(&self, point_id: &str, extension_id: &str) -> bool {
        if extension_id == DEFAULT_EXTENSION_ID && self.default_prevented {
            return true;
        }
        self.disabled
            .get(point_id)
            .is_some_and(|ids| ids.contains(extension_id))
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn is_default_prevented(&self) -> bool {
        self.default_prevented
    }

    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn resume_propagation(&mut self) {
        self.propagation_stopped = false;
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    /// Builder-style switch for [`Baton::catch_errors`].
    pub fn catching_errors(mut self) -> Self {
        self.catch_errors = true;
        self
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Last error recorded by a cascade running with `catch_errors`.
    pub fn error(&self) -> Option<&ExtensionError> {
        self.error.as_ref()
    }

    pub(crate) fn reject(&mut self, err: ExtensionError) {
        self.rejected = true;
        self.error = Some(err);
    }

    pub fn frame(&self) -> Option<&InvokeFrame> {
        self.frame.as_ref()
    }

    /// Id of the extension currently running against this baton.
    pub fn current_extension(&self) -> Option<&str> {
        self.frame.as_ref()?.extension.as_deref()
    }

    pub(crate) fn enter(&mut self, point: &str, method: &str) -> Option<InvokeFrame> {
        self.frame.replace(InvokeFrame {
            point: point.to_string(),
            method: method.to_string(),
            extension: None,
        })
    }

    pub(crate) fn set_extension(&mut self, extension_id: &str) {
        if let Some(frame) = self.frame.as_mut() {
            frame.extension = Some(extension_id.to_string());
        }
    }

    pub(crate) fn leave(&mut self, previous: Option<InvokeFrame>) {
        self.frame = previous;
    }
}
