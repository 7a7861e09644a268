//! Named rules and the rule registry.

use crate::action::Action;
use crate::environment::ActionEnvironment;
use crate::error::{ActionError, ErrorCause};
use std::collections::BTreeMap;

/// A named, reusable sequence of actions.
pub struct Rule {
    id: String,
    actions: Vec<Action>,
}

impl Rule {
    pub fn new(id: &str, actions: Vec<Action>) -> Self {
        Self {
            id: id.to_string(),
            actions,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Executes the rule's actions in order, returning the value of the
    /// last action.
    pub fn execute(&self, environment: &mut ActionEnvironment<'_>) -> Result<bool, ActionError> {
        execute_actions(&self.actions, environment)
    }
}

/// Executes actions in order; the result is the value of the last action.
pub(crate) fn execute_actions(
    actions: &[Action],
    environment: &mut ActionEnvironment<'_>,
) -> Result<bool, ActionError> {
    let mut result = true;
    for action in actions {
        result = action.execute(environment)?;
    }
    Ok(result)
}

/// Registry of rules keyed by rule id.
#[derive(Default)]
pub struct Rules {
    rules: BTreeMap<String, Rule>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: Rule) {
        self.rules.insert(rule.id().to_string(), rule);
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    pub fn get(&self, rule_id: &str) -> Result<&Rule, ErrorCause> {
        self.rules.get(rule_id).ok_or_else(|| {
            ErrorCause::Internal(format!("Unable to find rule with ID \"{rule_id}\""))
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
