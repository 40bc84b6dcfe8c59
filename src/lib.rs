//! An in-process event hub for mobile SDKs: a sequenced publish/subscribe bus, versioned shared
//! state per module, and a rules engine that rewrites or generates events.
//!
//! # Overview
//!
//! The crate revolves around an [`EventHub`]. Modules ([`Extension`]s) register with the hub and
//! exchange [`Event`]s, whose payload is [`EventData`]: a map of string keys to [`Variant`]s.
//! Every submitted event gets a strictly increasing sequence number. Sequence numbers order
//! delivery and version [shared state](SharedStateStore): reading a module's state "as of" an
//! event never returns a version published after that event.
//!
//! Before an event reaches listeners, the [`RulesEngine`](rules::RulesEngine) evaluates the active
//! rules against it. Matching rules may attach or modify event data, or dispatch new events.
//! Rules may look at past events recorded in the [`EventHistory`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Most recoverable problems (a malformed rule, a listener exceeding its time budget, an
//! out-of-order timestamp) are not returned as errors at all: they are logged and the hub keeps
//! going.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! target `eventhub` and structured key-values. Consider integrating a `log`-compatible logger
//! implementation for better visibility into hub operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod archive;
mod config;
mod error;
mod event;
mod event_bus;
mod event_data;
mod event_history;
mod extension;
mod hub;
mod listener;
pub mod network;
pub mod rules;
mod shared_state;
pub mod storage;
mod variant;

pub use config::HubConfig;
pub use error::{Error, Result, VariantError};
pub use event::{event_source, event_type, Event, EventBuilder, WILDCARD};
pub use event_bus::{DispatchReport, EventBus};
pub use event_data::{EventData, MergeStrategy};
pub use event_history::{
    hash_mask, EventHistory, EventHistoryRequest, EventHistoryResult, EventHistoryStore,
    SqliteEventHistoryStore,
};
pub use extension::{Extension, ExtensionApi};
pub use hub::{EventHub, HUB_STATE_OWNER, STATE_OWNER};
pub use listener::{Listener, ListenerId, ListenerKey, OneTimeHandle};
pub use shared_state::{
    PendingToken, SharedStateResult, SharedStateStatus, SharedStateStore, SharedStateType,
};
pub use variant::{Variant, VariantKind};
