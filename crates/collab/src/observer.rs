//! Listener registry for sync and presence events.
//!
//! Listeners run synchronously in registration order. A listener that
//! returns an error or panics is logged and skipped; it never prevents the
//! remaining listeners from running and never corrupts sync state.

use crate::error::CollabError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Error a listener may report.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Listener<E> = Box<dyn Fn(&E) -> ListenerResult + Send + Sync>;

/// Handle returned by [`Observers::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Ordered set of listeners for events of type `E`.
pub struct Observers<E> {
    next_id: u64,
    listeners: Vec<(Subscription, Listener<E>)>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<E: fmt::Debug> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe<F>(&mut self, listener: F) -> Subscription
    where
        F: Fn(&E) -> ListenerResult + Send + Sync + 'static,
    {
        let subscription = Subscription(self.next_id);
        self.next_id += 1;
        self.listeners.push((subscription, Box::new(listener)));
        subscription
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(id, _)| *id != subscription);
        self.listeners.len() != before
    }

    /// Deliver `event` to every listener, returning the failures.
    pub fn notify(&self, event: &E) -> Vec<CollabError> {
        let mut failures = Vec::new();
        for (subscription, listener) in &self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => CollabError::Listener(err.to_string()),
                Err(panic) => CollabError::Listener(panic_message(panic.as_ref())),
            };
            tracing::warn!(?subscription, ?event, %error, "listener failed");
            failures.push(error);
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}
