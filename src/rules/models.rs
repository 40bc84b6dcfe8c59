//! Wire format of rule sets.
//!
//! These types mirror the JSON documents rules are downloaded as. They are compiled into the
//! evaluation types of [`crate::rules`] by [`RuleSet::from_wire`](super::RuleSet::from_wire).
use serde::{Deserialize, Serialize};

use crate::{EventData, Variant};

use super::MatcherOperator;

/// `TryParse` allows a subtree to fail parsing without failing the whole document.
///
/// A rule set with one rule in an unknown format still yields the remaining rules.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Result<T, serde_json::Value> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Ok(v),
            TryParse::ParseFailed(v) => Err(v),
        }
    }
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Rule set document: `{"version": 1, "rules": [...]}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct RuleSetWire {
    #[serde(default)]
    pub version: u32,
    pub rules: Vec<TryParse<RuleWire>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct RuleWire {
    pub condition: ConditionWire,
    #[serde(default)]
    pub consequences: Vec<TryParse<ConsequenceWire>>,
}

/// `{"type": "group" | "matcher" | "historical", "definition": {...}}`
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "definition", rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ConditionWire {
    Group(GroupWire),
    Matcher(MatcherWire),
    Historical(HistoricalWire),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum GroupLogic {
    And,
    Or,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct GroupWire {
    pub logic: GroupLogic,
    pub conditions: Vec<ConditionWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct MatcherWire {
    pub key: String,
    pub matcher: MatcherOperator,
    #[serde(default, alias = "value")]
    pub values: OneOrMany,
}

/// Matcher values are usually a list; a single scalar is accepted as a one-element list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum OneOrMany {
    Many(Vec<Variant>),
    One(Variant),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl From<OneOrMany> for Vec<Variant> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::Many(values) => values,
            OneOrMany::One(value) => vec![value],
        }
    }
}

/// How a historical condition combines its event lookups.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Sum of the occurrences of every event.
    #[default]
    Any,
    /// `1` if the events occurred in the listed order, `0` otherwise.
    Ordered,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct HistoricalWire {
    pub events: Vec<EventData>,
    #[serde(default)]
    pub from: i64,
    #[serde(default)]
    pub to: i64,
    #[serde(default)]
    pub search_type: SearchType,
    pub matcher: MatcherOperator,
    pub value: Variant,
}

/// `{"id": ..., "type": ..., "detail": {...}}`
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct ConsequenceWire {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub detail: EventData,
}
