//! Event Router subscription table
//!
//! A single insertion-ordered list of subscriptions under a mutex. Dispatch
//! takes a snapshot before spawning handler tasks, so handlers are free to
//! subscribe or unsubscribe mid-dispatch: the in-progress iteration sees
//! exactly the subscriptions present at dispatch start.

use std::sync::{Arc, Mutex};

use wmhub_protocol::EventKind;

use crate::extension::{events, EventHandler};

/// Handle returned by subscribe, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    token: u64,
    event: String,
    extension: String,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct RouterInner {
    subs: Vec<Subscription>,
    next_token: u64,
}

/// The subscription table
#[derive(Default)]
pub struct Router {
    inner: Mutex<RouterInner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name (exact match, or the
    /// [`events::WILDCARD`] bucket).
    ///
    /// Subscriptions are unique per (event, handler) pair: re-subscribing
    /// the same handler to the same event returns the existing handle.
    /// Dispatch order is insertion order, stable for the life of the
    /// subscription.
    pub fn subscribe(
        &self,
        event: &str,
        extension: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        if let Some(existing) = inner
            .subs
            .iter()
            .find(|s| s.event == event && Arc::ptr_eq(&s.handler, &handler))
        {
            return SubscriptionHandle(existing.token);
        }
        let token = inner.next_token;
        inner.next_token += 1;
        tracing::debug!(extension, event, token, "subscribing handler");
        inner.subs.push(Subscription {
            token,
            event: event.to_string(),
            extension: extension.to_string(),
            handler,
        });
        SubscriptionHandle(token)
    }

    /// Remove a subscription. Returns false if the handle was already
    /// removed. An in-flight dispatch that snapshotted the subscription
    /// still runs it to completion.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        let before = inner.subs.len();
        inner.subs.retain(|s| s.token != handle.0);
        before != inner.subs.len()
    }

    /// Snapshot the handlers matching an event, in insertion order.
    /// `only_extension` restricts the match to one extension's
    /// subscriptions (used for the per-extension init event).
    pub(crate) fn snapshot(
        &self,
        event: &str,
        only_extension: Option<&str>,
    ) -> Vec<(String, Arc<dyn EventHandler>)> {
        let inner = self.inner.lock().expect("router lock poisoned");
        inner
            .subs
            .iter()
            .filter(|s| s.event == event || s.event == events::WILDCARD)
            .filter(|s| only_extension.map_or(true, |e| s.extension == e))
            .map(|s| (s.extension.clone(), s.handler.clone()))
            .collect()
    }

    /// The set of protocol events the connection must subscribe to, in
    /// wire-code order. A wildcard subscription pulls in every protocol
    /// event; `shutdown` is always included so drain sees the window
    /// manager's exit payload.
    pub(crate) fn protocol_events(&self) -> Vec<EventKind> {
        let inner = self.inner.lock().expect("router lock poisoned");
        let wildcard = inner.subs.iter().any(|s| s.event == events::WILDCARD);
        EventKind::ALL
            .into_iter()
            .filter(|kind| {
                *kind == EventKind::Shutdown
                    || wildcard
                    || inner.subs.iter().any(|s| s.event == kind.name())
            })
            .collect()
    }
}
