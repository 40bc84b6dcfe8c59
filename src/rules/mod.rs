//! Rules engine: conditions over events, shared state and event history, and the consequences
//! applied when they hold.
//!
//! Rules are loaded as JSON documents (see [`models`]) into an immutable [`RuleSet`] and swapped
//! into the [`RulesEngine`] as a whole. The hub runs every dispatched event through the engine
//! before delivering it to listeners.
mod condition;
mod consequence;
mod engine;
mod loader;
mod matcher;
pub mod models;
mod token;

pub use condition::{GroupCondition, HistoricalCondition, RuleCondition};
pub use consequence::{
    Consequence, ConsequenceKind, EventDataAction, DISPATCH_CONSEQUENCE_NAME, MAX_CHAIN_DEPTH,
};
pub use engine::{Rule, RuleSet, RulesEngine, RulesOutcome};
pub use loader::{RulesLoader, RULES_FILE_NAME};
pub use matcher::{Matcher, MatcherOperator};
pub use models::{SearchType, TryParse};
pub use token::{EvaluationContext, StateLookup};
