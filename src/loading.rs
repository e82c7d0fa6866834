//! Process-wide loading indicator.
//!
//! A single flag, not a counter: overlapping operations share it and the
//! first one to finish clears it. Store actions hold a [`LoadingGuard`] so
//! the flag is released on every exit path, errors included.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Loading {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for Loading {
    fn default() -> Self {
        Self::new()
    }
}

impl Loading {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    pub fn start(&self) {
        self.set(true);
    }

    pub fn end(&self) {
        self.set(false);
    }

    pub fn is_loading(&self) -> bool {
        *self.flag.borrow()
    }

    /// Receiver notified whenever the flag flips.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    /// Starts loading and returns a guard that ends it when dropped.
    pub fn scope(&self) -> LoadingGuard {
        self.start();
        LoadingGuard {
            loading: self.clone(),
            armed: true,
        }
    }

    fn set(&self, value: bool) {
        self.flag.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }
}

/// Ends loading on drop unless [`LoadingGuard::keep`] handed the flag off.
#[must_use = "loading ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LoadingGuard {
    loading: Loading,
    armed: bool,
}

impl LoadingGuard {
    /// Leaves the flag set; whoever took over is now responsible for `end()`.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.loading.end();
        }
    }
}
