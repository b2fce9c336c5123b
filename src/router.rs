//! Event-type keyed fan-out of inbound messages to registered callbacks.
//!
//! Every decoded frame carries a `type` discriminator. The router delivers the frame to the
//! callbacks registered for that type and to the [`WILDCARD`] callbacks. Frames that are not
//! JSON are delivered verbatim to [`RAW`] callbacks only.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use crate::types::{DEFAULT_TYPE, RAW, WILDCARD};

/// Callback invoked with the payload of a delivered event.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

/// Classification of one inbound text frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Valid JSON, routed by its `type` field
    Typed { event_type: String, payload: Value },
    /// Anything that failed to decode, kept as received
    Raw(String),
}

impl Inbound {
    #[must_use]
    pub fn decode(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(payload) => {
                let event_type = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_TYPE)
                    .to_owned();
                Self::Typed {
                    event_type,
                    payload,
                }
            }
            Err(_) => Self::Raw(text.to_owned()),
        }
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    callback: Callback,
}

/// Registry of subscribers keyed by event type.
#[derive(Default)]
pub struct EventRouter {
    subscribers: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("event_types", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `callback` for `event_type`.
    ///
    /// The returned handle removes this registration and no other, even when the same
    /// callback is registered several times.
    pub fn subscribe(self: &Arc<Self>, event_type: &str, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(event_type.to_owned())
            .or_default()
            .push(Registration { id, callback });

        Subscription {
            router: Arc::downgrade(self),
            event_type: event_type.to_owned(),
            id,
        }
    }

    /// Remove every registration of `callback` under `event_type`.
    ///
    /// Returns how many registrations were removed; zero when the pair was not registered.
    pub fn unsubscribe(&self, event_type: &str, callback: &Callback) -> usize {
        self.remove_where(event_type, |registration| {
            Arc::ptr_eq(&registration.callback, callback)
        })
    }

    fn remove_by_id(&self, event_type: &str, id: u64) -> bool {
        self.remove_where(event_type, |registration| registration.id == id) > 0
    }

    fn remove_where<F>(&self, event_type: &str, matches: F) -> usize
    where
        F: Fn(&Registration) -> bool,
    {
        let removed = match self.subscribers.get_mut(event_type) {
            Some(mut registrations) => {
                let before = registrations.len();
                registrations.retain(|registration| !matches(registration));
                before - registrations.len()
            }
            None => 0,
        };

        self.subscribers
            .remove_if(event_type, |_, registrations| registrations.is_empty());
        removed
    }

    /// Number of callbacks currently registered for `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .get(event_type)
            .map_or(0, |registrations| registrations.len())
    }

    /// Decode one inbound frame and deliver it.
    pub fn dispatch(&self, text: &str) {
        match Inbound::decode(text) {
            Inbound::Typed {
                event_type,
                payload,
            } => {
                #[cfg(feature = "tracing")]
                tracing::trace!(%event_type, "Dispatching event");

                self.emit(&event_type, &payload);
                if event_type != WILDCARD {
                    self.emit(WILDCARD, &payload);
                }
            }
            Inbound::Raw(text) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(len = text.len(), "Inbound frame is not JSON, delivering as raw");

                self.emit(RAW, &Value::String(text));
            }
        }
    }

    /// Deliver `payload` to the callbacks registered for exactly `event_type`.
    ///
    /// Callbacks run against a snapshot of the registry, so they may subscribe or
    /// unsubscribe freely while being invoked.
    pub fn emit(&self, event_type: &str, payload: &Value) {
        let snapshot: Vec<Callback> = match self.subscribers.get(event_type) {
            Some(registrations) => registrations
                .iter()
                .map(|registration| Arc::clone(&registration.callback))
                .collect(),
            None => return,
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(%event_type, "Subscriber panicked while handling event");
            }
        }
    }
}

/// Handle to one registration in an [`EventRouter`].
///
/// Dropping the handle keeps the registration alive; call [`Subscription::unsubscribe`]
/// to remove it.
#[must_use = "the handle is the only way to remove this registration individually"]
#[derive(Debug, Clone)]
pub struct Subscription {
    router: Weak<EventRouter>,
    event_type: String,
    id: u64,
}

impl Subscription {
    /// Remove this registration. Returns `false` if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        self.router
            .upgrade()
            .is_some_and(|router| router.remove_by_id(&self.event_type, self.id))
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}
