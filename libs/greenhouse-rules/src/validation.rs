//! Rule definition validation
//!
//! Runs at write time (`repository::insert_rule`) and again at evaluation time,
//! where a violation turns into a `skipped` outcome for that rule only.

use std::collections::HashSet;

use crate::error::{Result, RuleError};
use crate::types::{
    Action, ActionKind, ConditionGroup, Hysteresis, Operator, Rule, RuleDefinition, MAX_PRIORITY,
    MIN_PRIORITY, SET_VALUE_MAX, SET_VALUE_MIN,
};

/// Validate a definition before it is stored
pub fn validate_definition(def: &RuleDefinition) -> Result<()> {
    if def.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if def.device_id.trim().is_empty() {
        return Err(invalid("device_id must not be empty"));
    }
    check_common(def.priority, def.hysteresis.as_ref(), &def.groups, &def.actions)
}

/// Re-check a loaded rule right before it is evaluated
pub fn validate_rule(rule: &Rule) -> Result<()> {
    check_common(
        rule.priority,
        rule.hysteresis.as_ref(),
        &rule.groups,
        &rule.actions,
    )
}

fn check_common(
    priority: i64,
    hysteresis: Option<&Hysteresis>,
    groups: &[ConditionGroup],
    actions: &[Action],
) -> Result<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(invalid(format!(
            "priority {} outside {}..={}",
            priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }

    if let Some(h) = hysteresis {
        check_hysteresis(h)?;
    }

    check_groups(groups)?;
    check_actions(actions)
}

fn check_hysteresis(h: &Hysteresis) -> Result<()> {
    if !h.on_threshold.is_finite() || !h.off_threshold.is_finite() {
        return Err(invalid("hysteresis thresholds must be finite"));
    }
    if (h.on_threshold - h.off_threshold).abs() < f64::EPSILON {
        return Err(invalid(format!(
            "hysteresis thresholds must differ (both {})",
            h.on_threshold
        )));
    }
    Ok(())
}

fn check_groups(groups: &[ConditionGroup]) -> Result<()> {
    if groups.is_empty() {
        return Err(invalid("rule needs at least one condition group"));
    }

    let mut group_orders = HashSet::new();
    for group in groups {
        if !group_orders.insert(group.order) {
            return Err(invalid(format!("duplicate group order {}", group.order)));
        }
        if group.conditions.is_empty() {
            return Err(invalid(format!("group {} has no conditions", group.order)));
        }

        let mut condition_orders = HashSet::new();
        for cond in &group.conditions {
            if !condition_orders.insert(cond.order) {
                return Err(invalid(format!(
                    "duplicate condition order {} in group {}",
                    cond.order, group.order
                )));
            }
            if cond.sensor_id.trim().is_empty() {
                return Err(invalid(format!(
                    "condition {} in group {} has no sensor",
                    cond.order, group.order
                )));
            }
            if !cond.value.is_finite() {
                return Err(invalid(format!(
                    "condition on '{}' has a non-finite threshold",
                    cond.sensor_id
                )));
            }
            match (cond.operator, cond.value_max) {
                (Operator::Between, Some(max)) if max > cond.value => {},
                (Operator::Between, Some(max)) => {
                    return Err(invalid(format!(
                        "between on '{}' needs value_max > value ({} <= {})",
                        cond.sensor_id, max, cond.value
                    )));
                },
                (Operator::Between, None) => {
                    return Err(invalid(format!(
                        "between on '{}' needs value_max",
                        cond.sensor_id
                    )));
                },
                (op, Some(_)) => {
                    return Err(invalid(format!(
                        "operator {} on '{}' takes no value_max",
                        op, cond.sensor_id
                    )));
                },
                (_, None) => {},
            }
        }
    }
    Ok(())
}

fn check_actions(actions: &[Action]) -> Result<()> {
    if actions.is_empty() {
        return Err(invalid("rule needs at least one action"));
    }

    let mut actuators = HashSet::new();
    for action in actions {
        if action.actuator_id.trim().is_empty() {
            return Err(invalid("action has no actuator"));
        }
        if !actuators.insert(action.actuator_id.as_str()) {
            return Err(invalid(format!(
                "more than one action for actuator '{}'",
                action.actuator_id
            )));
        }
        match (action.kind, action.value) {
            (ActionKind::SetValue, Some(v)) if (SET_VALUE_MIN..=SET_VALUE_MAX).contains(&v) => {},
            (ActionKind::SetValue, Some(v)) => {
                return Err(invalid(format!(
                    "set_value {} on '{}' outside {}..={}",
                    v, action.actuator_id, SET_VALUE_MIN, SET_VALUE_MAX
                )));
            },
            (ActionKind::SetValue, None) => {
                return Err(invalid(format!(
                    "set_value on '{}' needs a value",
                    action.actuator_id
                )));
            },
            (kind, Some(_)) => {
                return Err(invalid(format!(
                    "{} on '{}' takes no value",
                    kind, action.actuator_id
                )));
            },
            (_, None) => {},
        }
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> RuleError {
    RuleError::InvalidDefinition(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Condition;

    fn base() -> RuleDefinition {
        RuleDefinition::new("u1", "gh-1", "Ventilation", 10)
            .with_group(vec![Condition::new("temperature", Operator::Gt, 30.0)])
            .with_action(Action::on("fan_1"))
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_definition(&base()).is_ok());
    }

    #[test]
    fn test_priority_out_of_range() {
        let mut def = base();
        def.priority = 1001;
        assert!(validate_definition(&def).is_err());
        def.priority = -1;
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_between_requires_increasing_bounds() {
        let def = RuleDefinition::new("u1", "gh-1", "Band", 1)
            .with_group(vec![Condition::between("humidity", 80.0, 60.0)])
            .with_action(Action::on("mister"));
        let err = validate_definition(&def).unwrap_err().to_string();
        assert!(err.contains("value_max > value"), "{}", err);

        let mut cond = Condition::new("humidity", Operator::Between, 60.0);
        cond.value_max = None;
        let def = RuleDefinition::new("u1", "gh-1", "Band", 1)
            .with_group(vec![cond])
            .with_action(Action::on("mister"));
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_value_max_only_for_between() {
        let mut cond = Condition::new("humidity", Operator::Gt, 60.0);
        cond.value_max = Some(70.0);
        let def = RuleDefinition::new("u1", "gh-1", "Odd", 1)
            .with_group(vec![cond])
            .with_action(Action::on("mister"));
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_set_value_range() {
        let def = base().with_action(Action::set_value("vent", 101.0));
        assert!(validate_definition(&def).is_err());

        let def = base().with_action(Action::set_value("vent", 55.0));
        assert!(validate_definition(&def).is_ok());

        let mut bad = Action::on("lamp");
        bad.value = Some(1.0);
        assert!(validate_definition(&base().with_action(bad)).is_err());
    }

    #[test]
    fn test_one_action_per_actuator() {
        let def = base().with_action(Action::off("fan_1"));
        let err = validate_definition(&def).unwrap_err().to_string();
        assert!(err.contains("fan_1"), "{}", err);
    }

    #[test]
    fn test_hysteresis_thresholds_must_differ() {
        assert!(validate_definition(&base().with_hysteresis(18.0, 18.0)).is_err());
        assert!(validate_definition(&base().with_hysteresis(15.0, 18.0)).is_ok());
        assert!(validate_definition(&base().with_hysteresis(30.0, 25.0)).is_ok());
    }

    #[test]
    fn test_duplicate_orders_rejected() {
        let mut def = base().with_group(vec![Condition::new("h", Operator::Lt, 1.0)]);
        def.groups[1].order = 0;
        assert!(validate_definition(&def).is_err());

        let mut def = base();
        def.groups[0]
            .conditions
            .push(Condition::new("h", Operator::Lt, 1.0));
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_empty_structure_rejected() {
        let def = RuleDefinition::new("u1", "gh-1", "Empty", 1).with_action(Action::on("x"));
        assert!(validate_definition(&def).is_err());

        let def = RuleDefinition::new("u1", "gh-1", "NoAction", 1)
            .with_group(vec![Condition::new("t", Operator::Gt, 1.0)]);
        assert!(validate_definition(&def).is_err());

        let def = RuleDefinition::new("u1", "gh-1", "EmptyGroup", 1)
            .with_group(vec![])
            .with_action(Action::on("x"));
        assert!(validate_definition(&def).is_err());
    }
}
