use extpoint_core::{
    Action, Baton, ExtensionError, ExtensionResult, ExtensionSpec, Perform, Point, Registry,
};
use futures::executor::block_on;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

trait Draw: Send + Sync {
    fn draw(&self, out: &mut Vec<String>);
}

struct Label(&'static str);

impl Draw for Label {
    fn draw(&self, out: &mut Vec<String>) {
        out.push(self.0.to_string());
    }
}

fn label(id: &'static str) -> ExtensionSpec<dyn Draw, Vec<String>> {
    let handler: Arc<dyn Draw> = Arc::new(Label(id));
    ExtensionSpec::new(id, handler)
}

fn toolbar(registry: &Registry) -> Point<dyn Draw, Vec<String>> {
    let point = registry
        .point::<dyn Draw, Vec<String>>("viewer/toolbar")
        .expect("toolbar point");
    point
        .extend_all([label("default"), label("print"), label("share")])
        .expect("register toolbar");
    point
}

fn draw(point: &Point<dyn Draw, Vec<String>>, baton: &mut Baton<Vec<String>>) {
    point.invoke("draw", baton, |ext, baton| {
        ext.draw(&mut baton.data);
        Action::done(())
    });
}

#[test]
fn baton_disable_affects_only_that_baton() {
    let registry = Registry::new();
    let point = toolbar(&registry);

    let mut scoped = Baton::new(Vec::new());
    scoped.disable("viewer/toolbar", "print");
    draw(&point, &mut scoped);
    assert_eq!(scoped.data, vec!["default", "share"]);

    let mut other = Baton::new(Vec::new());
    draw(&point, &mut other);
    assert_eq!(other.data, vec!["default", "print", "share"]);

    scoped.data.clear();
    scoped.enable("viewer/toolbar", "print");
    draw(&point, &mut scoped);
    assert_eq!(scoped.data, vec!["default", "print", "share"]);
}

#[test]
fn baton_disable_is_keyed_by_point() {
    let registry = Registry::new();
    let point = toolbar(&registry);

    let mut baton = Baton::new(Vec::new());
    baton.disable("viewer/sidebar", "print");
    draw(&point, &mut baton);
    assert_eq!(baton.data, vec!["default", "print", "share"]);
}

#[test]
fn prevent_default_and_stop_propagation() {
    let registry = Registry::new();
    let point = toolbar(&registry);

    let mut baton = Baton::new(Vec::new());
    baton.prevent_default();
    draw(&point, &mut baton);
    assert_eq!(baton.data, vec!["print", "share"]);

    let mut baton = Baton::new(Vec::new());
    point.invoke("draw", &mut baton, |ext, baton| {
        ext.draw(&mut baton.data);
        if baton.current_extension() == Some("print") {
            baton.stop_propagation();
        }
        Action::done(())
    });
    assert_eq!(baton.data, vec!["default", "print"]);
    assert!(baton.is_propagation_stopped());
}

#[test]
fn point_level_disable_applies_to_every_baton() {
    let registry = Registry::new();
    let point = toolbar(&registry);
    point.disable("share");

    let mut baton = Baton::new(Vec::new());
    draw(&point, &mut baton);
    assert_eq!(baton.data, vec!["default", "print"]);

    point.disable("*");
    let mut baton = Baton::new(Vec::new());
    draw(&point, &mut baton);
    assert!(baton.data.is_empty());

    point.enable("*").toggle("share", Some(true));
    assert!(point.is_enabled("share"));
}

#[test]
fn ensure_keeps_existing_baton_identity() {
    let mut original = Baton::new(vec!["seed".to_string()]);
    original.disable("p", "x");
    let id = original.id();

    let ensured: Baton<Vec<String>> = Baton::ensure(original);
    assert_eq!(ensured.id(), id);
    assert!(ensured.is_disabled("p", "x"));

    let wrapped: Baton<Vec<String>> = Baton::ensure(vec!["fresh".to_string()]);
    assert_eq!(wrapped.data, vec!["fresh"]);
    assert!(!wrapped.is_disabled("p", "x"));
}

struct Step {
    name: &'static str,
    fail: bool,
}

impl Perform<Vec<String>> for Step {
    fn perform<'a>(
        &'a self,
        baton: &'a mut Baton<Vec<String>>,
    ) -> BoxFuture<'a, ExtensionResult<()>> {
        async move {
            if self.fail {
                return Err(ExtensionError::new(format!("{} failed", self.name)));
            }
            baton.data.push(self.name.to_string());
            Ok(())
        }
        .boxed()
    }
}

fn cascade_point(registry: &Registry) -> Point<dyn Perform<Vec<String>>, Vec<String>> {
    let point = registry
        .point::<dyn Perform<Vec<String>>, Vec<String>>("viewer/open")
        .expect("cascade point");
    let steps: [(&'static str, bool); 3] = [("load", false), ("parse", true), ("render", false)];
    for (name, fail) in steps {
        let handler: Arc<dyn Perform<Vec<String>>> = Arc::new(Step { name, fail });
        point
            .extend(ExtensionSpec::new(name, handler))
            .expect("register step");
    }
    point
}

#[test]
fn cascade_stops_on_first_error_by_default() {
    let registry = Registry::new();
    let point = cascade_point(&registry);

    let mut baton = Baton::new(Vec::new());
    let err = block_on(point.cascade(&mut baton)).expect_err("parse fails");
    assert_eq!(err.message(), "parse failed");
    assert_eq!(baton.data, vec!["load"]);
    assert!(!baton.is_rejected());
}

#[test]
fn cascade_with_catch_errors_continues_and_rejects() {
    let registry = Registry::new();
    let point = cascade_point(&registry);

    let mut baton = Baton::new(Vec::new()).catching_errors();
    block_on(point.cascade(&mut baton)).expect("cascade continues");
    assert_eq!(baton.data, vec!["load", "render"]);
    assert!(baton.is_rejected());
    assert_eq!(
        baton.error().map(ExtensionError::message),
        Some("parse failed")
    );
    assert!(baton.frame().is_none());
}
