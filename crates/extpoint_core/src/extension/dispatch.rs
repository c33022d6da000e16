//! Dispatch result contracts shared by points, mediators and the updater.
//!
//! # Responsibility
//! - Describe what one extension handed back to a dispatch (`Action`).
//! - Collect per-extension outcomes of one `invoke` pass (`Invocation`).
//! - Join pending asynchronous contributions in dispatch order.
//!
//! # Invariants
//! - A failed extension never removes other extensions' contributions.
//! - Settled contributions keep the order in which extensions were invoked.

use crate::logging::{panic_payload_text, sanitize_message};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use log::error;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

const MAX_PANIC_MESSAGE_CHARS: usize = 240;

/// Failure recorded for one extension, mediator step or persisted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// Handler returned an error value.
    Failed(String),
    /// Handler panicked; payload is a sanitized summary.
    Panicked(String),
}

impl ExtensionError {
    pub fn new(message: impl Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(sanitize_message(
            &panic_payload_text(payload.as_ref()),
            MAX_PANIC_MESSAGE_CHARS,
        ))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Failed(message) | Self::Panicked(message) => message,
        }
    }
}

impl Display for ExtensionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(message) => write!(f, "{message}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

impl Error for ExtensionError {}

impl From<String> for ExtensionError {
    fn from(value: String) -> Self {
        Self::Failed(value)
    }
}

impl From<&str> for ExtensionError {
    fn from(value: &str) -> Self {
        Self::Failed(value.to_string())
    }
}

pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Future handed back by an extension that completes later.
pub type ExtensionFuture<R> = BoxFuture<'static, ExtensionResult<R>>;

/// What one extension returned for a dispatch.
pub enum Action<R> {
    /// Capability not provided by this extension; skipped silently.
    Pass,
    /// Completed synchronously.
    Done(ExtensionResult<R>),
    /// Completes later; joined by [`Invocation::settle`].
    Async(ExtensionFuture<R>),
}

impl<R> Action<R> {
    pub fn done(value: R) -> Self {
        Action::Done(Ok(value))
    }

    pub fn fail(err: impl Into<ExtensionError>) -> Self {
        Action::Done(Err(err.into()))
    }

    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = ExtensionResult<R>> + Send + 'static,
    {
        Action::Async(fut.boxed())
    }
}

impl<R> From<ExtensionResult<R>> for Action<R> {
    fn from(result: ExtensionResult<R>) -> Self {
        Action::Done(result)
    }
}

impl From<()> for Action<()> {
    fn from(_: ()) -> Self {
        Action::Done(Ok(()))
    }
}

/// Starts a handler and awaits its future, turning panics in either phase
/// into [`ExtensionError::Panicked`].
pub(crate) async fn run_guarded<'a, R, S>(start: S) -> ExtensionResult<R>
where
    S: FnOnce() -> BoxFuture<'a, ExtensionResult<R>>,
{
    let fut = panic::catch_unwind(AssertUnwindSafe(start)).map_err(ExtensionError::from_panic)?;
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ExtensionError::from_panic(payload)))
}

/// Outcome of one participating extension before settling.
pub enum Outcome<R> {
    Value(R),
    Pending(ExtensionFuture<R>),
    Failed(ExtensionError),
}

impl<R> Outcome<R> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Settled result of one participating extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution<R> {
    pub extension_id: String,
    pub result: ExtensionResult<R>,
}

/// Aggregated result of one `Point::invoke` pass.
///
/// Only extensions that actually ran appear here; skipped ones (guards,
/// baton disables, missing capability) leave no trace.
pub struct Invocation<R> {
    point: String,
    method: String,
    entries: Vec<(String, Outcome<R>)>,
}

impl<R> std::fmt::Debug for Invocation<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("point", &self.point)
            .field("method", &self.method)
            .field("extensions", &self.extension_ids())
            .field("pending", &self.has_pending())
            .finish()
    }
}

impl<R> Invocation<R> {
    pub(crate) fn new(point: &str, method: &str) -> Self {
        Self {
            point: point.to_string(),
            method: method.to_string(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, extension_id: &str, outcome: Outcome<R>) {
        self.entries.push((extension_id.to_string(), outcome));
    }

    pub fn point(&self) -> &str {
        &self.point
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of participating extensions in dispatch order.
    pub fn extension_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|(_, outcome)| outcome.is_pending())
    }

    /// Synchronous failures recorded so far.
    pub fn failures(&self) -> Vec<(&str, &ExtensionError)> {
        self.entries
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                Outcome::Failed(err) => Some((id.as_str(), err)),
                _ => None,
            })
            .collect()
    }

    /// Consumes the pass and returns ready values only.
    ///
    /// Pending futures are dropped without being polled.
    pub fn into_values(self) -> Vec<R> {
        self.entries
            .into_iter()
            .filter_map(|(_, outcome)| match outcome {
                Outcome::Value(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Waits for every pending contribution and returns all results in
    /// dispatch order.
    pub async fn settle(self) -> Vec<Contribution<R>> {
        let point = self.point;
        let method = self.method;
        let pending = self.entries.into_iter().map(|(extension_id, outcome)| {
            let point = point.clone();
            let method = method.clone();
            async move {
                let result = match outcome {
                    Outcome::Value(value) => Ok(value),
                    Outcome::Failed(err) => Err(err),
                    Outcome::Pending(fut) => {
                        let result = AssertUnwindSafe(fut)
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|payload| Err(ExtensionError::from_panic(payload)));
                        if let Err(err) = &result {
                            error!(
                                "event=extension_settle module=extension status=error point={} method={} extension={} error={}",
                                point, method, extension_id, err
                            );
                        }
                        result
                    }
                };
                Contribution {
                    extension_id,
                    result,
                }
            }
        });
        future::join_all(pending).await
    }

    /// Waits for every pending contribution and returns successful values.
    pub async fn values(self) -> Vec<R> {
        self.settle()
            .await
            .into_iter()
            .filter_map(|contribution| contribution.result.ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, ExtensionError, Invocation, Outcome};
    use futures::executor::block_on;

    #[test]
    fn panic_payloads_are_sanitized() {
        let err = ExtensionError::from_panic(Box::new("line1\nline2"));
        assert_eq!(err, ExtensionError::Panicked("line1 line2".to_string()));

        let long = "x".repeat(500);
        let err = ExtensionError::from_panic(Box::new(long));
        assert!(err.message().ends_with("..."));
        assert!(err.message().len() < 500);

        let err = ExtensionError::from_panic(Box::new(42_u8));
        assert_eq!(err.message(), "non-string panic payload");
    }

    #[test]
    fn debug_lists_point_method_and_participants() {
        let mut invocation: Invocation<u8> = Invocation::new("editor/save", "collect");
        invocation.push("format", Outcome::Value(1));
        invocation.push("lint", Outcome::Failed(ExtensionError::new("boom")));

        let rendered = format!("{invocation:?}");
        assert!(rendered.contains("editor/save"));
        assert!(rendered.contains("collect"));
        assert!(rendered.contains("[\"format\", \"lint\"]"));
        assert!(rendered.contains("pending: false"));
    }

    #[test]
    fn settle_preserves_dispatch_order_across_ready_and_pending() {
        let mut invocation = Invocation::new("p", "collect");
        invocation.push("a", Outcome::Value(1));
        invocation.push(
            "b",
            Outcome::Pending(Box::pin(async { Ok::<_, ExtensionError>(2) })),
        );
        invocation.push("c", Outcome::Failed(ExtensionError::new("boom")));
        assert!(invocation.has_pending());
        assert_eq!(invocation.failures().len(), 1);

        let settled = block_on(invocation.settle());
        let ids: Vec<&str> = settled.iter().map(|c| c.extension_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(settled[1].result, Ok(2));
        assert!(settled[2].result.is_err());
    }

    #[test]
    fn settle_catches_panicking_futures() {
        let mut invocation: Invocation<u8> = Invocation::new("p", "collect");
        invocation.push(
            "bad",
            Outcome::Pending(Box::pin(async {
                if true {
                    panic!("async boom");
                }
                Ok::<u8, ExtensionError>(0)
            })),
        );
        let settled = block_on(invocation.settle());
        assert!(matches!(
            settled[0].result,
            Err(ExtensionError::Panicked(_))
        ));
    }

    #[test]
    fn into_values_drops_pending_and_failed() {
        let mut invocation = Invocation::new("p", "collect");
        invocation.push("a", Outcome::Value("x"));
        invocation.push("b", Outcome::Pending(Box::pin(async { Ok::<_, ExtensionError>("y") })));
        invocation.push("c", Outcome::Failed(ExtensionError::new("no")));
        assert_eq!(invocation.into_values(), vec!["x"]);
    }

    #[test]
    fn action_conversions() {
        assert!(matches!(Action::from(()), Action::Done(Ok(()))));
        let action: Action<u8> = Err(ExtensionError::new("bad")).into();
        assert!(matches!(action, Action::Done(Err(_))));
        assert!(matches!(Action::<u8>::fail("nope"), Action::Done(Err(_))));
    }
}
