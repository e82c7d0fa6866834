//! Route guard.
//!
//! Keeps a view reachable only in one authentication state: whenever the
//! `logged` flag disagrees with what the view wants, the guard navigates to
//! its fallback route.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Navigation port implemented by the host router.
pub trait Navigator: Send + Sync {
    fn push(&self, route: &str);
}

#[derive(Clone)]
pub struct RouteGuard {
    should_be_authenticated: bool,
    route: String,
    navigator: Arc<dyn Navigator>,
}

impl RouteGuard {
    /// `route` is where to go when the logged-in state differs from
    /// `should_be_authenticated`.
    pub fn new(should_be_authenticated: bool, route: impl Into<String>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            should_be_authenticated,
            route: route.into(),
            navigator,
        }
    }

    fn check(&self, logged: bool) {
        if logged != self.should_be_authenticated {
            tracing::debug!(route = %self.route, logged, "redirecting");
            self.navigator.push(&self.route);
        }
    }

    /// Checks the current state right away, then again on every change.
    ///
    /// The watcher runs until the returned handle is dropped.
    pub fn watch(&self, mut logged: watch::Receiver<bool>) -> GuardHandle {
        let current = *logged.borrow_and_update();
        self.check(current);

        let guard = self.clone();
        let task = tokio::spawn(async move {
            while logged.changed().await.is_ok() {
                let current = *logged.borrow_and_update();
                guard.check(current);
            }
        });

        GuardHandle { task }
    }
}

/// Stops the guard's watcher when dropped.
#[must_use = "the guard stops watching when the handle is dropped"]
pub struct GuardHandle {
    task: JoinHandle<()>,
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
