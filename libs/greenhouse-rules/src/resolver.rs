//! Priority Resolver
//!
//! Picks exactly one rule per contested actuator. Each actuator is resolved on
//! its own, so a rule with several actions can win one actuator and lose another.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::{Action, Rule, RuleId};

/// Order rules by priority ascending, then by `created_at` descending
///
/// Rule id descending breaks the remaining ties so the order is total.
pub fn compare_priority(a: &Rule, b: &Rule) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// A rule admitted by hysteresis, with the actions it wants to apply
#[derive(Debug, Clone, Copy)]
pub struct Contender<'a> {
    pub rule: &'a Rule,
    pub actions: &'a [Action],
}

/// Outcome for one actuator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Award {
    pub actuator_id: String,
    pub winner: RuleId,
    /// Losing rules, best first
    pub superseded: Vec<RuleId>,
}

/// Outcome of a resolution round
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    awards: BTreeMap<String, Award>,
}

impl Resolution {
    pub fn awards(&self) -> impl Iterator<Item = &Award> {
        self.awards.values()
    }

    pub fn winner_for(&self, actuator_id: &str) -> Option<RuleId> {
        self.awards.get(actuator_id).map(|a| a.winner)
    }

    /// Actuators won by a rule
    pub fn won_by(&self, rule_id: RuleId) -> Vec<&str> {
        self.awards
            .values()
            .filter(|a| a.winner == rule_id)
            .map(|a| a.actuator_id.as_str())
            .collect()
    }

    /// `(actuator, winning rule)` for every actuator a rule lost
    pub fn lost_by(&self, rule_id: RuleId) -> Vec<(&str, RuleId)> {
        self.awards
            .values()
            .filter(|a| a.superseded.contains(&rule_id))
            .map(|a| (a.actuator_id.as_str(), a.winner))
            .collect()
    }
}

/// Resolve contenders per actuator
pub fn resolve(contenders: &[Contender<'_>]) -> Resolution {
    let mut by_actuator: BTreeMap<&str, Vec<&Rule>> = BTreeMap::new();
    for contender in contenders {
        for action in contender.actions {
            by_actuator
                .entry(action.actuator_id.as_str())
                .or_default()
                .push(contender.rule);
        }
    }

    let mut awards = BTreeMap::new();
    for (actuator_id, mut rules) in by_actuator {
        rules.sort_by(|a, b| compare_priority(a, b));
        rules.dedup_by_key(|r| r.id);

        let Some((winner, rest)) = rules.split_first() else {
            continue;
        };
        awards.insert(
            actuator_id.to_string(),
            Award {
                actuator_id: actuator_id.to_string(),
                winner: winner.id,
                superseded: rest.iter().map(|r| r.id).collect(),
            },
        );
    }

    Resolution { awards }
}
