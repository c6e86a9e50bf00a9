//! The active rule snapshot.
//!
//! Change events replace the rules of their source atomically: readers
//! hold on to the snapshot they started with, writers swap in a complete
//! replacement. A failing event leaves the previous snapshot untouched.

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::info;
use url::Url;

use warden_pipeline::error::Result;

use crate::event::{ChangeType, RuleSetChangedEvent};
use crate::factory::RuleFactory;
use crate::rule::Rule;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no rule matching '{0}'")]
    NoRuleFound(String),

    #[error("method '{method}' is not allowed by rule '{rule_id}'")]
    MethodNotAllowed { rule_id: String, method: String },
}

pub struct RuleRepository {
    factory: RuleFactory,
    rules: RwLock<Arc<Vec<Arc<Rule>>>>,
}

impl RuleRepository {
    pub fn new(factory: RuleFactory) -> Self {
        Self {
            factory,
            rules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// The current rule snapshot. In-flight requests keep using the
    /// snapshot they obtained even if an event replaces it concurrently.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Rule>>> {
        self.rules.read().expect("rule lock poisoned").clone()
    }

    /// The first rule matching the URL; its method set must allow the
    /// request method.
    pub fn find_rule(
        &self,
        url: &Url,
        method: &str,
    ) -> std::result::Result<Arc<Rule>, RepositoryError> {
        let snapshot = self.snapshot();

        let rule = snapshot
            .iter()
            .find(|rule| rule.matches_url(url))
            .ok_or_else(|| RepositoryError::NoRuleFound(url.to_string()))?;

        if !rule.matches_method(method) {
            return Err(RepositoryError::MethodNotAllowed {
                rule_id: rule.id().to_string(),
                method: method.to_string(),
            });
        }

        Ok(rule.clone())
    }

    /// Applies a change event: the rules of the event's source are
    /// replaced (`Create`) or dropped (`Remove`).
    pub fn apply(&self, event: RuleSetChangedEvent) -> Result<()> {
        let mut replacement: Vec<Arc<Rule>> = self
            .snapshot()
            .iter()
            .filter(|rule| rule.src_id() != event.src)
            .cloned()
            .collect();

        if event.change_type == ChangeType::Create {
            for definition in &event.rules {
                replacement.push(Arc::new(self.factory.create_rule(&event.src, definition)?));
            }
        }

        let mut rules = self.rules.write().expect("rule lock poisoned");
        *rules = Arc::new(replacement);

        info!(
            src = %event.src,
            change = %event.change_type,
            total = rules.len(),
            "applied rule set change"
        );

        Ok(())
    }
}

impl std::fmt::Debug for RuleRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRepository")
            .field("rules", &self.snapshot().len())
            .finish()
    }
}
