//! Process-wide point registry owned by the composition root.

use crate::extension::baton::Baton;
use crate::extension::dispatch::{Action, Invocation};
use crate::extension::point::{Point, PointInner};
use log::debug;
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};

type ErasedPoint = Arc<dyn Any + Send + Sync>;

/// Registry lookup errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The point already exists with a different capability or payload type.
    PointTypeMismatch { point: String, requested: String },
    /// `branch` was called on a baton that is not inside a dispatch.
    NoActiveInvocation,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PointTypeMismatch { point, requested } => write!(
                f,
                "point `{point}` is already registered with a different type than {requested}"
            ),
            Self::NoActiveInvocation => write!(f, "baton is not part of an active invocation"),
        }
    }
}

impl Error for RegistryError {}

/// Named extension points.
///
/// Clones share the same points, so one registry can be handed to every
/// registering module.
#[derive(Clone, Default)]
pub struct Registry {
    points: Arc<RwLock<BTreeMap<String, ErasedPoint>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("points", &self.keys())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the point named `id`, creating it on first use.
    pub fn point<E, D>(&self, id: &str) -> Result<Point<E, D>, RegistryError>
    where
        E: ?Sized + Send + Sync + 'static,
        D: 'static,
    {
        if let Some(existing) = self.lookup(id) {
            return Self::downcast(id, existing);
        }

        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = points.get(id) {
            return Self::downcast(id, Arc::clone(existing));
        }
        let inner: Arc<PointInner<E, D>> = Point::new_inner(id);
        points.insert(id.to_string(), inner.clone() as ErasedPoint);
        debug!(
            "event=point_create module=extension status=ok point={} capability={}",
            id,
            type_name::<E>()
        );
        Ok(Point::from_inner(inner))
    }

    fn lookup(&self, id: &str) -> Option<ErasedPoint> {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn downcast<E, D>(id: &str, erased: ErasedPoint) -> Result<Point<E, D>, RegistryError>
    where
        E: ?Sized + Send + Sync + 'static,
        D: 'static,
    {
        erased
            .downcast::<PointInner<E, D>>()
            .map(Point::from_inner)
            .map_err(|_| RegistryError::PointTypeMismatch {
                point: id.to_string(),
                requested: format!("Point<{}, {}>", type_name::<E>(), type_name::<D>()),
            })
    }

    /// Names of every point created so far.
    pub fn keys(&self) -> Vec<String> {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Dispatches the baton's current method on the sub-point
    /// `"<current point>/<id>"`.
    pub fn branch<E, D, R, F>(
        &self,
        id: &str,
        baton: &mut Baton<D>,
        call: F,
    ) -> Result<Invocation<R>, RegistryError>
    where
        E: ?Sized + Send + Sync + 'static,
        D: 'static,
        F: FnMut(&E, &mut Baton<D>) -> Action<R>,
    {
        let frame = baton.frame().ok_or(RegistryError::NoActiveInvocation)?;
        let point_id = format!("{}/{}", frame.point, id);
        let method = frame.method.clone();
        let point = self.point::<E, D>(&point_id)?;
        Ok(point.invoke(&method, baton, call))
    }
}
