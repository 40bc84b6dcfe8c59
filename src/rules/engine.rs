use std::sync::{Arc, RwLock};

use crate::{Error, Event, Result};

use super::{
    condition::compile_condition,
    models::{RuleSetWire, RuleWire},
    Consequence, EvaluationContext, RuleCondition,
};

/// A condition plus the consequences applied when it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub(crate) condition: RuleCondition,
    pub(crate) consequences: Vec<Consequence>,
}

impl Rule {
    /// Create a rule from an already compiled condition and consequences.
    pub fn new(
        condition: impl Into<RuleCondition>,
        consequences: impl IntoIterator<Item = Consequence>,
    ) -> Rule {
        Rule {
            condition: condition.into(),
            consequences: consequences.into_iter().collect(),
        }
    }

    /// Condition deciding whether the rule matches an event.
    pub fn condition(&self) -> &RuleCondition {
        &self.condition
    }

    /// Consequences applied, in order, when the rule matches.
    pub fn consequences(&self) -> &[Consequence] {
        &self.consequences
    }
}

/// An ordered, immutable collection of rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Parse a rule set document.
    ///
    /// A document that is not a rule set at all fails with [`Error::MalformedDefinition`]. Rules
    /// that fail to parse, or that carry a consequence failing validation, are dropped and logged;
    /// the rest load normally.
    pub fn from_json(json: &[u8]) -> Result<RuleSet> {
        let wire: RuleSetWire = serde_json::from_slice(json).map_err(|err| {
            log::warn!(target: "eventhub", "failed to parse rule set: {err}");
            Error::MalformedDefinition(format!("rule set: {err}"))
        })?;
        Ok(RuleSet::from_wire(wire))
    }

    /// Compile a parsed rule set document.
    pub fn from_wire(wire: RuleSetWire) -> RuleSet {
        let rules = wire
            .rules
            .into_iter()
            .enumerate()
            .filter_map(|(index, rule)| {
                match std::result::Result::<_, serde_json::Value>::from(rule) {
                    Ok(rule) => match compile_rule(rule) {
                        Ok(rule) => Some(rule),
                        Err(err) => {
                            log::warn!(target: "eventhub", index; "dropping rule: {err}");
                            None
                        }
                    },
                    Err(json) => {
                        log::warn!(target: "eventhub", index, rule:serde = json; "dropping malformed rule");
                        None
                    }
                }
            })
            .collect();
        RuleSet { rules }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        RuleSet {
            rules: iter.into_iter().collect(),
        }
    }
}

fn compile_rule(rule: RuleWire) -> Result<Rule> {
    let consequences = rule
        .consequences
        .into_iter()
        .map(|consequence| {
            std::result::Result::<_, serde_json::Value>::from(consequence)
                .map_err(|json| Error::MalformedDefinition(format!("consequence: {json}")))
                .and_then(Consequence::try_from)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Rule {
        condition: compile_condition(rule.condition),
        consequences,
    })
}

/// Result of running an event through the rules engine.
#[derive(Debug, Clone)]
pub struct RulesOutcome {
    /// The triggering event after `attach`/`modify` consequences.
    pub event: Event,
    /// New events created by consequences, in rule order.
    pub dispatched: Vec<Event>,
}

/// `RulesEngine` holds the active rule set and evaluates events against it.
///
/// The rule set is an immutable snapshot replaced as a whole, so evaluation never observes a
/// partially loaded rule set and never blocks loading.
pub struct RulesEngine {
    rules: RwLock<Arc<RuleSet>>,
}

impl RulesEngine {
    /// Create an engine with an empty rule set.
    pub fn new() -> RulesEngine {
        RulesEngine {
            rules: RwLock::new(Arc::new(RuleSet::default())),
        }
    }

    /// Snapshot of the active rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        let rules = self
            .rules
            .read()
            .expect("thread holding rules lock should not panic");
        Arc::clone(&rules)
    }

    /// Set new rules, returning the previous ones.
    pub fn replace_rules(&self, rules: RuleSet) -> Arc<RuleSet> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(rules);
        log::debug!(target: "eventhub", rules = new_value.len(); "replacing active rules");

        let mut slot = self
            .rules
            .write()
            .expect("thread holding rules lock should not panic");
        std::mem::replace(&mut slot, new_value)
    }

    /// Append rules after the active ones.
    pub fn add_rules(&self, rules: RuleSet) {
        let mut slot = self
            .rules
            .write()
            .expect("thread holding rules lock should not panic");
        let combined = slot.rules.iter().cloned().chain(rules.rules).collect();
        *slot = Arc::new(combined);
    }

    /// Remove every rule, returning the previous ones.
    pub fn clear_rules(&self) -> Arc<RuleSet> {
        self.replace_rules(RuleSet::default())
    }

    /// Evaluate every rule against `ctx` and apply the consequences of the matching ones.
    ///
    /// Conditions are evaluated against the event as dispatched. Consequences are then applied in
    /// rule order, each seeing the event as rewritten by the previous ones.
    pub fn process(&self, ctx: EvaluationContext<'_>) -> RulesOutcome {
        let rules = self.rules();

        let matched: Vec<&Rule> = rules
            .rules
            .iter()
            .filter(|rule| rule.condition.evaluate(&ctx))
            .collect();

        let mut event = ctx.event.clone();
        let mut dispatched = Vec::new();
        for rule in matched {
            for consequence in &rule.consequences {
                let (processed, created) = consequence.apply(ctx, event);
                event = processed;
                dispatched.extend(created);
            }
        }

        if !dispatched.is_empty() {
            log::trace!(target: "eventhub",
                        sequence = event.sequence(),
                        dispatched = dispatched.len();
                        "rules produced consequence events");
        }
        RulesOutcome { event, dispatched }
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        RulesEngine::new()
    }
}
