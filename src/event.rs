use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::EventData;

/// Matches every event type or source when used at registration.
pub const WILDCARD: &str = "*";

/// Well-known event types.
pub mod event_type {
    /// Events originating from the hub itself.
    pub const HUB: &str = "eventhub.eventType.hub";
    /// Events produced by the rules engine.
    pub const RULES_ENGINE: &str = "eventhub.eventType.rulesEngine";
    /// Generic tracking events.
    pub const GENERIC_TRACK: &str = "eventhub.eventType.generic.track";
    /// Generic lifecycle events.
    pub const GENERIC_LIFECYCLE: &str = "eventhub.eventType.generic.lifecycle";
    /// Configuration events.
    pub const CONFIGURATION: &str = "eventhub.eventType.configuration";
}

/// Well-known event sources.
pub mod event_source {
    /// Announces a shared state change.
    pub const SHARED_STATE: &str = "eventhub.eventSource.sharedState";
    /// Announces the hub finished booting.
    pub const BOOTED: &str = "eventhub.eventSource.booted";
    /// Request events.
    pub const REQUEST_CONTENT: &str = "eventhub.eventSource.requestContent";
    /// Response events.
    pub const RESPONSE_CONTENT: &str = "eventhub.eventSource.responseContent";
    /// Identity-scoped requests.
    pub const REQUEST_IDENTITY: &str = "eventhub.eventSource.requestIdentity";
    /// Reset requests.
    pub const REQUEST_RESET: &str = "eventhub.eventSource.requestReset";
}

/// Immutable event dispatched through the [`EventHub`](crate::EventHub).
///
/// Build events with [`EventBuilder`]. The sequence number is assigned by the hub when the event
/// is submitted; events that were never submitted carry sequence `0`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: Uuid,
    name: String,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    data: EventData,
    timestamp: DateTime<Utc>,
    sequence: u64,
    pair_id: Option<String>,
    mask: Option<Vec<String>>,
    #[serde(skip)]
    chain_depth: u8,
}

impl Event {
    /// Unique id of the event.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event type, one of [`event_type`] or a custom one.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Event source, one of [`event_source`] or a custom one.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Event payload.
    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Wall clock time of creation. Advisory only: ordering uses [`Event::sequence`].
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Hub-assigned sequence number. Strictly increasing in submission order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Pairing id correlating a request with its response.
    pub fn pair_id(&self) -> Option<&str> {
        self.pair_id.as_deref()
    }

    /// Data keys recorded into event history when the event is dispatched.
    pub fn mask(&self) -> Option<&[String]> {
        self.mask.as_deref()
    }

    /// Number of rule consequences that led to this event. `0` for events not produced by rules.
    pub(crate) fn chain_depth(&self) -> u8 {
        self.chain_depth
    }

    /// Copy of this event with a different payload. Identity and sequence are kept.
    pub(crate) fn with_data(&self, data: EventData) -> Event {
        Event {
            data,
            ..self.clone()
        }
    }

    pub(crate) fn with_pair_id(mut self, pair_id: String) -> Event {
        self.pair_id = Some(pair_id);
        self
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Event {
        self.sequence = sequence;
        self
    }
}

/// Builder for [`Event`].
///
/// ```
/// # use eventhub::{EventBuilder, EventData, event_type, event_source};
/// let event = EventBuilder::new("purchase", event_type::GENERIC_TRACK, event_source::REQUEST_CONTENT)
///     .data(EventData::new().with("action", "purchase"))
///     .build();
/// assert_eq!(event.data().get_string("action").unwrap(), "purchase");
/// ```
#[derive(Debug, Clone)]
pub struct EventBuilder {
    name: String,
    event_type: String,
    source: String,
    data: EventData,
    timestamp: Option<DateTime<Utc>>,
    pair_id: Option<String>,
    mask: Option<Vec<String>>,
    chain_depth: u8,
}

impl EventBuilder {
    /// Start building an event with empty data.
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder {
            name: name.into(),
            event_type: event_type.into(),
            source: source.into(),
            data: EventData::new(),
            timestamp: None,
            pair_id: None,
            mask: None,
            chain_depth: 0,
        }
    }

    /// Start building a response to `request`. The response inherits the request's pairing id.
    pub fn response_to(
        request: &Event,
        name: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> EventBuilder {
        let mut builder = EventBuilder::new(name, event_type, source);
        builder.pair_id = request.pair_id.clone();
        builder
    }

    /// Set the payload.
    pub fn data(mut self, data: EventData) -> EventBuilder {
        self.data = data;
        self
    }

    /// Override the creation time. Defaults to the time of [`EventBuilder::build`].
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> EventBuilder {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the pairing id linking a request and its response.
    pub fn pair_id(mut self, pair_id: impl Into<String>) -> EventBuilder {
        self.pair_id = Some(pair_id.into());
        self
    }

    /// Give the event a fresh pairing id so a response can be correlated to it.
    pub fn expect_response(self) -> EventBuilder {
        self.pair_id(Uuid::new_v4().to_string())
    }

    /// Record the event into event history, hashing only the given data keys.
    pub fn mask<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> EventBuilder {
        self.mask = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn chain_depth(mut self, depth: u8) -> EventBuilder {
        self.chain_depth = depth;
        self
    }

    /// Finish the event with a fresh id, stamped now unless a timestamp was set. Its sequence
    /// number is assigned when it is dispatched.
    pub fn build(self) -> Event {
        Event {
            id: Uuid::new_v4(),
            name: self.name,
            event_type: self.event_type,
            source: self.source,
            data: self.data,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            sequence: 0,
            pair_id: self.pair_id,
            mask: self.mask,
            chain_depth: self.chain_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{event_source, event_type, EventBuilder};
    use crate::EventData;

    #[test]
    fn builder_sets_fields() {
        let event = EventBuilder::new("n", event_type::HUB, event_source::BOOTED)
            .data(EventData::new().with("k", "v"))
            .build();
        assert_eq!(event.name(), "n");
        assert_eq!(event.event_type(), event_type::HUB);
        assert_eq!(event.source(), event_source::BOOTED);
        assert_eq!(event.sequence(), 0);
        assert_eq!(event.pair_id(), None);
        assert_eq!(event.data().get_string("k"), Ok("v"));
    }

    #[test]
    fn every_event_gets_a_unique_id() {
        let a = EventBuilder::new("a", "t", "s").build();
        let b = EventBuilder::new("a", "t", "s").build();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn response_inherits_pair_id() {
        let request = EventBuilder::new("req", "t", "s").expect_response().build();
        let response = EventBuilder::response_to(&request, "resp", "t", "r").build();
        assert!(request.pair_id().is_some());
        assert_eq!(response.pair_id(), request.pair_id());
    }
}
