//! Extension declarations and registration validation.

use crate::extension::baton::Baton;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Spacing between default indices so later registrations can slot in.
pub const INDEX_STEP: i64 = 100;

/// Guard predicate evaluated against the dispatch baton.
pub type Guard<D> = Arc<dyn Fn(&Baton<D>) -> bool + Send + Sync>;

/// Dispatch position of an extension within its point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    First,
    At(i64),
    Last,
}

impl Index {
    fn rank(self) -> (u8, i64) {
        match self {
            Self::First => (0, 0),
            Self::At(value) => (1, value),
            Self::Last => (2, 0),
        }
    }
}

impl PartialOrd for Index {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Index {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl From<i64> for Index {
    fn from(value: i64) -> Self {
        Self::At(value)
    }
}

/// Placement relative to another extension of the same point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    Before(String),
    After(String),
}

impl Anchor {
    pub fn target(&self) -> &str {
        match self {
            Self::Before(id) | Self::After(id) => id,
        }
    }
}

/// Registration request for one extension.
pub struct ExtensionSpec<E: ?Sized, D = ()> {
    pub(crate) id: String,
    pub(crate) index: Option<Index>,
    pub(crate) before: Option<String>,
    pub(crate) after: Option<String>,
    pub(crate) enabled: Option<Guard<D>>,
    pub(crate) visible: Option<Guard<D>>,
    pub(crate) handler: Arc<E>,
}

impl<E: ?Sized, D> ExtensionSpec<E, D> {
    pub fn new(id: impl Into<String>, handler: Arc<E>) -> Self {
        Self {
            id: id.into(),
            index: None,
            before: None,
            after: None,
            enabled: None,
            visible: None,
            handler,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(self, index: i64) -> Self {
        self.position(Index::At(index))
    }

    pub fn position(mut self, index: Index) -> Self {
        self.index = Some(index);
        self
    }

    pub fn before(mut self, extension_id: impl Into<String>) -> Self {
        self.before = Some(extension_id.into());
        self
    }

    pub fn after(mut self, extension_id: impl Into<String>) -> Self {
        self.after = Some(extension_id.into());
        self
    }

    pub fn enabled<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Baton<D>) -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Arc::new(guard));
        self
    }

    pub fn visible<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Baton<D>) -> bool + Send + Sync + 'static,
    {
        self.visible = Some(Arc::new(guard));
        self
    }

    pub fn handler(mut self, handler: Arc<E>) -> Self {
        self.handler = handler;
        self
    }

    pub(crate) fn validate(&self, point_id: &str) -> Result<(), RegistrationError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(RegistrationError::MissingId {
                point: point_id.to_string(),
            });
        }
        if self.before.is_some() && self.after.is_some() {
            return Err(RegistrationError::ConflictingAnchors {
                point: point_id.to_string(),
                extension: id.to_string(),
            });
        }
        let anchored_to_self = [&self.before, &self.after]
            .into_iter()
            .flatten()
            .any(|target| target.trim() == id);
        if anchored_to_self {
            return Err(RegistrationError::SelfAnchor {
                point: point_id.to_string(),
                extension: id.to_string(),
            });
        }
        Ok(())
    }
}

/// Registered, immutable extension.
pub struct Extension<E: ?Sized, D = ()> {
    id: String,
    index: Index,
    anchor: Option<Anchor>,
    enabled: Option<Guard<D>>,
    visible: Option<Guard<D>>,
    handler: Arc<E>,
    pub(crate) seq: u64,
}

impl<E: ?Sized, D> Extension<E, D> {
    pub(crate) fn from_spec(spec: ExtensionSpec<E, D>, index: Index, seq: u64) -> Self {
        let anchor = match (spec.before, spec.after) {
            (Some(target), _) => Some(Anchor::Before(target.trim().to_string())),
            (None, Some(target)) => Some(Anchor::After(target.trim().to_string())),
            (None, None) => None,
        };
        Self {
            id: spec.id.trim().to_string(),
            index,
            anchor,
            enabled: spec.enabled,
            visible: spec.visible,
            handler: spec.handler,
            seq,
        }
    }

    /// Rebuilds a spec carrying every attribute of this extension.
    pub(crate) fn to_spec(&self) -> ExtensionSpec<E, D> {
        let (before, after) = match &self.anchor {
            Some(Anchor::Before(target)) => (Some(target.clone()), None),
            Some(Anchor::After(target)) => (None, Some(target.clone())),
            None => (None, None),
        };
        ExtensionSpec {
            id: self.id.clone(),
            index: Some(self.index),
            before,
            after,
            enabled: self.enabled.clone(),
            visible: self.visible.clone(),
            handler: Arc::clone(&self.handler),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    pub fn handler(&self) -> &Arc<E> {
        &self.handler
    }

    /// Evaluates `enabled` then `visible`; absent guards pass.
    pub fn is_eligible(&self, baton: &Baton<D>) -> bool {
        let enabled = self.enabled.as_ref().map_or(true, |guard| guard(baton));
        enabled && self.visible.as_ref().map_or(true, |guard| guard(baton))
    }
}

/// Extension registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    MissingId { point: String },
    ConflictingAnchors { point: String, extension: String },
    SelfAnchor { point: String, extension: String },
}

impl Display for RegistrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingId { point } => {
                write!(f, "extension on point `{point}` must have a non-empty id")
            }
            Self::ConflictingAnchors { point, extension } => write!(
                f,
                "extension `{extension}` on point `{point}` cannot be placed both before and after"
            ),
            Self::SelfAnchor { point, extension } => write!(
                f,
                "extension `{extension}` on point `{point}` cannot be anchored to itself"
            ),
        }
    }
}

impl Error for RegistrationError {}
