//! Change events emitted by rule-set providers.

use std::fmt;

use crate::definition::RuleDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Create,
    Remove,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Create => f.write_str("Create"),
            ChangeType::Remove => f.write_str("Remove"),
        }
    }
}

/// A rule-set change, scoped to the provider source that emitted it.
#[derive(Debug, Clone)]
pub struct RuleSetChangedEvent {
    pub src: String,
    pub rules: Vec<RuleDefinition>,
    pub change_type: ChangeType,
}
