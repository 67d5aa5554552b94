//! Cooperative cancellation tokens

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

fn cancel_inner(inner: &Arc<Inner>) {
    if inner.flag.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.notify.notify_waiters();
    let children: Vec<Weak<Inner>> = inner.children.lock().drain(..).collect();
    for child in children {
        if let Some(child) = child.upgrade() {
            cancel_inner(&child);
        }
    }
}

/// Pollable cancellation signal that wakes waiters at suspension points.
///
/// Tokens form a tree: cancelling a parent cancels every child, so a
/// DAG-level cancel fans out to its running nodes.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled when this one is
    pub fn child(&self) -> CancelToken {
        let child = Arc::new(Inner::default());
        if self.is_cancelled() {
            child.flag.store(true, Ordering::SeqCst);
        } else {
            self.inner.children.lock().push(Arc::downgrade(&child));
        }
        CancelToken { inner: child }
    }

    /// Signal cancellation to every waiter and child token
    pub fn cancel(&self) {
        cancel_inner(&self.inner);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
