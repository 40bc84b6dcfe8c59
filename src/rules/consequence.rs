use crate::{Error, Event, EventBuilder, EventData, MergeStrategy, Result};

use super::{models::ConsequenceWire, EvaluationContext};

/// Consequences may create new events only for events fewer than this many consequences away from
/// an externally dispatched event.
pub const MAX_CHAIN_DEPTH: u8 = 1;

/// Name of events created by `dispatch` consequences.
pub const DISPATCH_CONSEQUENCE_NAME: &str = "Dispatch Consequence Result";

const EVENT_DATA: &str = "eventdata";

/// Source of the data of an event created by a `dispatch` consequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDataAction {
    /// Start from the triggering event's data, overlaid with the consequence's `eventdata`.
    Copy,
    /// Use only the consequence's `eventdata`.
    New,
}

/// What a consequence does once its rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsequenceKind {
    /// `add`/`attach`: merge `eventdata` into the triggering event, keeping existing values.
    Attach,
    /// `mod`/`modify`: merge `eventdata` into the triggering event, overwriting existing values.
    /// `null` values remove keys.
    Modify,
    /// `dispatch`: emit a new event with the given type and source.
    Dispatch {
        /// Type of the created event.
        event_type: String,
        /// Source of the created event.
        source: String,
        /// Where the created event's data comes from.
        action: EventDataAction,
    },
}

/// A consequence template of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Consequence {
    pub(crate) id: String,
    pub(crate) kind: ConsequenceKind,
    pub(crate) detail: EventData,
}

impl Consequence {
    /// Build a consequence from its wire fields.
    ///
    /// Fails with [`Error::MalformedDefinition`] for an unknown type or a detail missing what the
    /// type needs.
    pub fn new(id: impl Into<String>, kind: &str, detail: EventData) -> Result<Consequence> {
        let id = id.into();
        let malformed = |reason: &str| {
            Error::MalformedDefinition(format!("consequence {id:?}: {reason}"))
        };

        let kind = match kind {
            "" => return Err(malformed("missing type")),
            "add" | "attach" | "mod" | "modify" => {
                if detail.get_map(EVENT_DATA).is_err() {
                    return Err(malformed("detail.eventdata must be a map"));
                }
                if kind.starts_with("mod") {
                    ConsequenceKind::Modify
                } else {
                    ConsequenceKind::Attach
                }
            }
            "dispatch" => {
                let field = |key: &str| {
                    detail
                        .get_string(key)
                        .ok()
                        .filter(|value| !value.is_empty())
                        .map(str::to_owned)
                        .ok_or_else(|| malformed(&format!("detail.{key} is required")))
                };
                let action = match field("eventdataaction")?.as_str() {
                    "copy" => EventDataAction::Copy,
                    "new" => EventDataAction::New,
                    other => {
                        return Err(malformed(&format!("unknown eventdataaction {other:?}")))
                    }
                };
                ConsequenceKind::Dispatch {
                    event_type: field("type")?,
                    source: field("source")?,
                    action,
                }
            }
            other => return Err(malformed(&format!("unknown consequence type {other:?}"))),
        };

        Ok(Consequence { id, kind, detail })
    }

    /// Identifier from the rule definition.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// What the consequence does.
    pub fn kind(&self) -> &ConsequenceKind {
        &self.kind
    }

    /// Detail template, expanded against the triggering event when applied.
    pub fn detail(&self) -> &EventData {
        &self.detail
    }

    /// Apply to `event`: returns the (possibly rewritten) event and an event to dispatch, if any.
    pub(crate) fn apply(&self, ctx: EvaluationContext<'_>, event: Event) -> (Event, Option<Event>) {
        let detail = ctx.with_event(&event).expand_data(&self.detail);
        let event_data = detail.get_map(EVENT_DATA).unwrap_or_default();

        match &self.kind {
            ConsequenceKind::Attach => {
                let data = event.data().merge(&event_data, MergeStrategy::KeepExisting);
                (event.with_data(data), None)
            }
            ConsequenceKind::Modify => {
                let data = event.data().merge(&event_data, MergeStrategy::Overwrite);
                (event.with_data(data), None)
            }
            ConsequenceKind::Dispatch {
                event_type,
                source,
                action,
            } => {
                if !self.may_create_event(&event) {
                    return (event, None);
                }
                let data = match action {
                    EventDataAction::Copy => {
                        event.data().merge(&event_data, MergeStrategy::Overwrite)
                    }
                    EventDataAction::New => event_data,
                };
                let dispatched = EventBuilder::new(DISPATCH_CONSEQUENCE_NAME, event_type, source)
                    .data(data)
                    .chain_depth(event.chain_depth() + 1)
                    .build();
                (event, Some(dispatched))
            }
        }
    }

    fn may_create_event(&self, event: &Event) -> bool {
        if event.chain_depth() >= MAX_CHAIN_DEPTH {
            log::warn!(target: "eventhub",
                       consequence:display = self.id,
                       sequence = event.sequence(),
                       chain_depth = event.chain_depth();
                       "consequence chain depth exceeded, not dispatching consequence event");
            return false;
        }
        true
    }
}

impl TryFrom<ConsequenceWire> for Consequence {
    type Error = Error;

    fn try_from(wire: ConsequenceWire) -> Result<Consequence> {
        Consequence::new(wire.id, &wire.kind, wire.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::{Consequence, ConsequenceKind, EventDataAction, DISPATCH_CONSEQUENCE_NAME};
    use crate::{
        rules::EvaluationContext, Error, EventBuilder, EventData, SharedStateStore, Variant,
    };

    fn event_data(data: EventData) -> EventData {
        EventData::new().with("eventdata", data)
    }

    #[test]
    fn validates_known_types() {
        assert!(matches!(
            Consequence::new("c", "", EventData::new()),
            Err(Error::MalformedDefinition(_))
        ));
        assert!(Consequence::new("c", "add", EventData::new()).is_err());
        assert!(Consequence::new("c", "dispatch", EventData::new().with("type", "t")).is_err());

        let dispatch = Consequence::new(
            "c",
            "dispatch",
            EventData::new()
                .with("type", "t")
                .with("source", "s")
                .with("eventdataaction", "new"),
        )
        .unwrap();
        assert_eq!(
            dispatch.kind(),
            &ConsequenceKind::Dispatch {
                event_type: "t".to_owned(),
                source: "s".to_owned(),
                action: EventDataAction::New,
            }
        );
    }

    #[test]
    fn unknown_types_are_rejected() {
        for kind in ["url", "pb", "csp", "Add"] {
            assert!(matches!(
                Consequence::new("c", kind, EventData::new().with("url", "x")),
                Err(Error::MalformedDefinition(_))
            ));
        }
    }

    #[test]
    fn attach_keeps_existing_and_modify_overwrites() {
        let state = SharedStateStore::new();
        let event = EventBuilder::new("e", "t", "s")
            .data(EventData::new().with("a", 1).with("b", 2))
            .build();
        let ctx = EvaluationContext::new(&event, &state, None);
        let incoming = EventData::new().with("a", 10).with("c", 3).with("b", Variant::null());

        let attach = Consequence::new("c1", "add", event_data(incoming.clone())).unwrap();
        let (attached, dispatched) = attach.apply(ctx, event.clone());
        assert!(dispatched.is_none());
        assert_eq!(attached.data().get_integer("a"), Ok(1));
        assert_eq!(attached.data().get_integer("b"), Ok(2));
        assert_eq!(attached.data().get_integer("c"), Ok(3));
        assert_eq!(attached.id(), event.id());

        let modify = Consequence::new("c2", "mod", event_data(incoming)).unwrap();
        let (modified, _) = modify.apply(ctx, event.clone());
        assert_eq!(modified.data().get_integer("a"), Ok(10));
        assert!(!modified.data().contains_key("b"));
    }

    #[test]
    fn dispatch_copies_or_replaces_data() {
        let state = SharedStateStore::new();
        let event = EventBuilder::new("e", "t", "s")
            .data(EventData::new().with("user", "ada"))
            .build();
        let ctx = EvaluationContext::new(&event, &state, None);
        let detail = |action: &str| {
            EventData::new()
                .with("type", "out.type")
                .with("source", "out.source")
                .with("eventdataaction", action)
                .with("eventdata", EventData::new().with("greeting", "hi {%user%}"))
        };

        let copy = Consequence::new("c", "dispatch", detail("copy")).unwrap();
        let (_, dispatched) = copy.apply(ctx, event.clone());
        let dispatched = dispatched.unwrap();
        assert_eq!(dispatched.name(), DISPATCH_CONSEQUENCE_NAME);
        assert_eq!(dispatched.event_type(), "out.type");
        assert_eq!(dispatched.data().get_string("user"), Ok("ada"));
        assert_eq!(dispatched.data().get_string("greeting"), Ok("hi ada"));
        assert_eq!(dispatched.chain_depth(), 1);

        let new = Consequence::new("c", "dispatch", detail("new")).unwrap();
        let (_, dispatched) = new.apply(ctx, event.clone());
        assert!(!dispatched.unwrap().data().contains_key("user"));
    }

    #[test]
    fn chain_depth_stops_new_events() {
        let state = SharedStateStore::new();
        let event = EventBuilder::new("e", "t", "s").chain_depth(1).build();
        let ctx = EvaluationContext::new(&event, &state, None);
        let dispatch = Consequence::new(
            "c",
            "dispatch",
            EventData::new()
                .with("type", "t")
                .with("source", "s")
                .with("eventdataaction", "copy"),
        )
        .unwrap();
        let (_, dispatched) = dispatch.apply(ctx, event.clone());
        assert!(dispatched.is_none());
    }
}
