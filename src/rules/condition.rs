use derive_more::From;

use crate::{EventData, EventHistoryRequest, Variant};

use super::{
    models::{ConditionWire, GroupLogic, HistoricalWire, SearchType},
    EvaluationContext, Matcher, MatcherOperator,
};

/// Node of a rule condition tree.
#[derive(Debug, Clone, PartialEq, From)]
pub enum RuleCondition {
    /// All or any of nested conditions.
    Group(GroupCondition),
    /// Comparison against event data or shared state.
    Matcher(Matcher),
    /// Query against the event history.
    Historical(HistoricalCondition),
}

/// Conjunction or disjunction of child conditions. Empty groups are always false.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCondition {
    pub(crate) logic: GroupLogic,
    pub(crate) conditions: Vec<RuleCondition>,
}

impl GroupCondition {
    /// Group holding when every condition holds.
    pub fn and(conditions: impl IntoIterator<Item = RuleCondition>) -> GroupCondition {
        GroupCondition {
            logic: GroupLogic::And,
            conditions: conditions.into_iter().collect(),
        }
    }

    /// Group holding when any condition holds.
    pub fn or(conditions: impl IntoIterator<Item = RuleCondition>) -> GroupCondition {
        GroupCondition {
            logic: GroupLogic::Or,
            conditions: conditions.into_iter().collect(),
        }
    }
}

/// Condition over past occurrences of events recorded in the
/// [`EventHistory`](crate::EventHistory).
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalCondition {
    pub(crate) events: Vec<EventData>,
    pub(crate) from: i64,
    pub(crate) to: i64,
    pub(crate) search_type: SearchType,
    pub(crate) operator: MatcherOperator,
    pub(crate) value: Variant,
}

impl HistoricalCondition {
    /// Compare the occurrences of `events` between `from` and `to` (milliseconds since the
    /// epoch, `0` meaning unbounded) against `value` using `operator`.
    pub fn new(
        events: impl IntoIterator<Item = EventData>,
        from: i64,
        to: i64,
        search_type: SearchType,
        operator: MatcherOperator,
        value: impl Into<Variant>,
    ) -> HistoricalCondition {
        HistoricalCondition {
            events: events.into_iter().collect(),
            from,
            to,
            search_type,
            operator,
            value: value.into(),
        }
    }
}

impl RuleCondition {
    /// Evaluate against a context. Evaluation never fails: anything that cannot be evaluated is
    /// false.
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            RuleCondition::Group(group) => group.evaluate(ctx),
            RuleCondition::Matcher(matcher) => matcher.evaluate(ctx),
            RuleCondition::Historical(historical) => historical.evaluate(ctx),
        }
    }
}

impl GroupCondition {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.logic {
            GroupLogic::And => self.conditions.iter().all(|c| c.evaluate(ctx)),
            GroupLogic::Or => self.conditions.iter().any(|c| c.evaluate(ctx)),
        }
    }
}

impl Matcher {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        let value = if self.key.contains("{%") {
            Some(Variant::string(ctx.expand(&self.key)))
        } else {
            ctx.resolve(&self.key)
        };
        let candidates: Vec<Variant> = self
            .values
            .iter()
            .map(|candidate| ctx.expand_variant(candidate))
            .collect();
        self.operator.eval(value.as_ref(), &candidates)
    }
}

impl HistoricalCondition {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        let Some(history) = ctx.history else {
            log::debug!(target: "eventhub", "historical condition evaluated without event history");
            return false;
        };

        let requests: Vec<_> = self
            .events
            .iter()
            .map(|mask| EventHistoryRequest::new(ctx.expand_data(mask), self.from, self.to))
            .collect();
        let enforce_order = self.search_type == SearchType::Ordered;
        let results = match history.get_events(&requests, enforce_order) {
            Ok(results) => results,
            Err(err) => {
                log::warn!(target: "eventhub", "historical condition lookup failed: {err}");
                return false;
            }
        };

        let occurrences = match self.search_type {
            SearchType::Any => results.iter().map(|r| r.count).sum::<u64>(),
            SearchType::Ordered => u64::from(results.iter().all(|r| r.count > 0)),
        };
        let Ok(occurrences) = Variant::try_from(i64::try_from(occurrences).unwrap_or(i64::MAX))
        else {
            return false;
        };
        self.operator
            .eval(Some(&occurrences), std::slice::from_ref(&self.value))
    }
}

pub(crate) fn compile_condition(wire: ConditionWire) -> RuleCondition {
    match wire {
        ConditionWire::Group(group) => RuleCondition::Group(GroupCondition {
            logic: group.logic,
            conditions: group.conditions.into_iter().map(compile_condition).collect(),
        }),
        ConditionWire::Matcher(matcher) => {
            if matcher.matcher == MatcherOperator::Unknown {
                log::warn!(target: "eventhub", key:display = matcher.key; "matcher uses an unsupported operator and will never match");
            }
            RuleCondition::Matcher(Matcher {
                key: matcher.key,
                operator: matcher.matcher,
                values: matcher.values.into(),
            })
        }
        ConditionWire::Historical(HistoricalWire {
            events,
            from,
            to,
            search_type,
            matcher,
            value,
        }) => RuleCondition::Historical(HistoricalCondition {
            events,
            from,
            to,
            search_type,
            operator: matcher,
            value,
        }),
    }
}
