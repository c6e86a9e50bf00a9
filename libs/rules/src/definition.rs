//! Serialized rule shapes as emitted by rule-set providers.

use serde::Deserialize;
use warden_pipeline::RawConfig;

/// A rule-set document, e.g. the content of a rule file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    #[serde(default)]
    pub version: Option<String>,
    pub rules: Vec<RuleDefinition>,
}

/// A single rule definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    pub id: String,

    /// Glob pattern matched against the full request URL.
    pub url: String,

    #[serde(default)]
    pub methods: Vec<String>,

    /// Where the request is forwarded on success. Optional for
    /// decision-only deployments.
    #[serde(default)]
    pub upstream: Option<String>,

    #[serde(default)]
    pub execute: Vec<StepReference>,

    #[serde(default)]
    pub on_error: Vec<StepReference>,
}

/// Reference to a handler prototype, with an optional per-rule override.
///
/// Exactly one of the family fields must be set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepReference {
    #[serde(default)]
    pub authenticator: Option<String>,
    #[serde(default)]
    pub authorizer: Option<String>,
    #[serde(default)]
    pub hydrator: Option<String>,
    #[serde(default)]
    pub mutator: Option<String>,
    #[serde(default)]
    pub error_handler: Option<String>,
    #[serde(default)]
    pub config: Option<RawConfig>,
}

impl StepReference {
    pub fn family_count(&self) -> usize {
        [
            self.authenticator.is_some(),
            self.authorizer.is_some(),
            self.hydrator.is_some(),
            self.mutator.is_some(),
            self.error_handler.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}
