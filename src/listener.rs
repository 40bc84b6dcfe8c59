//! Listener registration primitives used by the [`EventBus`](crate::EventBus).
use std::sync::{Arc, Mutex};

use crate::{event::WILDCARD, Event};

/// A receiver of events.
///
/// Any `Fn(&Event) + Send + Sync` closure is a listener:
///
/// ```
/// # use eventhub::{Event, Listener};
/// fn takes_listener(_: impl Listener) {}
/// takes_listener(|event: &Event| println!("{}", event.name()));
/// ```
pub trait Listener: Send + Sync {
    /// Handle an event. Runs on a worker thread under the bus's execution time budget.
    fn hear(&self, event: &Event);

    /// Called exactly once when the listener is removed from the bus.
    fn on_unregistered(&self) {}
}

impl<T: Fn(&Event) + Send + Sync> Listener for T {
    fn hear(&self, event: &Event) {
        self(event);
    }
}

/// Identifier returned on registration, used to remove the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

impl log::kv::ToValue for ListenerId {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

/// Registration mask: `(type, source, pairing id)`.
///
/// Type and source may be [`WILDCARD`]. A key with a pairing id only matches events carrying the
/// same pairing id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    event_type: String,
    source: String,
    pair_id: Option<String>,
}

impl ListenerKey {
    /// Key matching events with exactly this type and source. Either may be [`WILDCARD`].
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> ListenerKey {
        ListenerKey {
            event_type: event_type.into(),
            source: source.into(),
            pair_id: None,
        }
    }

    /// Key matching every event.
    pub fn wildcard() -> ListenerKey {
        ListenerKey::new(WILDCARD, WILDCARD)
    }

    /// Restrict the key to events carrying `pair_id`.
    pub fn with_pair_id(mut self, pair_id: impl Into<String>) -> ListenerKey {
        self.pair_id = Some(pair_id.into());
        self
    }

    /// Exact key an event is delivered under, without its pairing id.
    pub(crate) fn of(event: &Event) -> ListenerKey {
        ListenerKey::new(event.event_type(), event.source())
    }

    /// Event type matched, or [`WILDCARD`].
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Event source matched, or [`WILDCARD`].
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Pairing id an event must carry to match.
    pub fn pair_id(&self) -> Option<&str> {
        self.pair_id.as_deref()
    }

    /// Empty type, source, or pairing id make a key unusable.
    pub(crate) fn is_valid(&self) -> bool {
        !self.event_type.is_empty()
            && !self.source.is_empty()
            && self.pair_id.as_deref() != Some("")
    }

    pub(crate) fn is_wildcard(&self) -> bool {
        self.event_type == WILDCARD || self.source == WILDCARD
    }

    /// Component-wise match against an event, honouring wildcards.
    pub(crate) fn matches(&self, event: &Event) -> bool {
        let type_matches = self.event_type == WILDCARD || self.event_type == event.event_type();
        let source_matches = self.source == WILDCARD || self.source == event.source();
        let pair_matches = match &self.pair_id {
            Some(pair_id) => event.pair_id() == Some(pair_id.as_str()),
            None => true,
        };
        type_matches && source_matches && pair_matches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnceState {
    Armed,
    Claimed,
    Delivered,
    Cancelled,
}

/// Handle to a one-time listener, allowing it to be cancelled.
///
/// A one-time listener is delivered at most one event. Cancelling suppresses delivery even if an
/// event was already scheduled for it.
#[derive(Debug, Clone)]
pub struct OneTimeHandle {
    pub(crate) id: ListenerId,
    state: Arc<Mutex<OnceState>>,
}

impl OneTimeHandle {
    pub(crate) fn new(id: ListenerId) -> OneTimeHandle {
        OneTimeHandle {
            id,
            state: Arc::new(Mutex::new(OnceState::Armed)),
        }
    }

    /// Id of the listener, usable with [`EventBus::remove_listener`](crate::EventBus::remove_listener).
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Cancel the listener. Returns `true` if this prevented a delivery, `false` if the listener
    /// was already delivered or cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        match *state {
            OnceState::Armed | OnceState::Claimed => {
                *state = OnceState::Cancelled;
                true
            }
            OnceState::Delivered | OnceState::Cancelled => false,
        }
    }

    /// Return `true` once the listener has been handed an event.
    pub fn is_delivered(&self) -> bool {
        *self.lock() == OnceState::Delivered
    }

    /// Reserve the listener for one event. Only the first caller wins.
    pub(crate) fn claim(&self) -> bool {
        let mut state = self.lock();
        if *state == OnceState::Armed {
            *state = OnceState::Claimed;
            true
        } else {
            false
        }
    }

    /// Return a claimed listener to the armed state after its invocation was discarded before it
    /// ran. Returns `false` if it was cancelled meanwhile.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.lock();
        if *state == OnceState::Claimed {
            *state = OnceState::Armed;
            true
        } else {
            false
        }
    }

    /// Mark a claimed listener as delivered. Returns `false` if it was cancelled meanwhile.
    pub(crate) fn begin_delivery(&self) -> bool {
        let mut state = self.lock();
        if *state == OnceState::Claimed {
            *state = OnceState::Delivered;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OnceState> {
        // Only plain assignments happen under this lock, so poisoning can be ignored.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
