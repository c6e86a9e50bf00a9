//! Resolving rule definitions into executable rules.

use std::collections::HashMap;
use std::sync::Arc;

use globset::GlobBuilder;
use url::Url;

use warden_pipeline::error::{PipelineError, Result};
use warden_pipeline::handler::{Authenticator, Authorizer, ErrorHandler, Hydrator, Mutator};

use crate::definition::{RuleDefinition, StepReference};
use crate::rule::{PipelineStep, Rule};

/// The handler prototypes built from the global pipeline configuration,
/// addressable by id.
#[derive(Default)]
pub struct PrototypeRepository {
    authenticators: HashMap<String, Arc<dyn Authenticator>>,
    authorizers: HashMap<String, Arc<dyn Authorizer>>,
    hydrators: HashMap<String, Arc<dyn Hydrator>>,
    mutators: HashMap<String, Arc<dyn Mutator>>,
    error_handlers: HashMap<String, Arc<dyn ErrorHandler>>,
}

impl PrototypeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_authenticator(&mut self, handler: Arc<dyn Authenticator>) -> Result<()> {
        let id = handler.handler_id().to_string();
        if self.authenticators.insert(id.clone(), handler).is_some() {
            return Err(duplicate("authenticator", &id));
        }
        Ok(())
    }

    pub fn add_authorizer(&mut self, handler: Arc<dyn Authorizer>) -> Result<()> {
        let id = handler.handler_id().to_string();
        if self.authorizers.insert(id.clone(), handler).is_some() {
            return Err(duplicate("authorizer", &id));
        }
        Ok(())
    }

    pub fn add_hydrator(&mut self, handler: Arc<dyn Hydrator>) -> Result<()> {
        let id = handler.handler_id().to_string();
        if self.hydrators.insert(id.clone(), handler).is_some() {
            return Err(duplicate("hydrator", &id));
        }
        Ok(())
    }

    pub fn add_mutator(&mut self, handler: Arc<dyn Mutator>) -> Result<()> {
        let id = handler.handler_id().to_string();
        if self.mutators.insert(id.clone(), handler).is_some() {
            return Err(duplicate("mutator", &id));
        }
        Ok(())
    }

    pub fn add_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) -> Result<()> {
        let id = handler.handler_id().to_string();
        if self.error_handlers.insert(id.clone(), handler).is_some() {
            return Err(duplicate("error handler", &id));
        }
        Ok(())
    }
}

fn duplicate(family: &str, id: &str) -> PipelineError {
    PipelineError::configuration(format!("duplicate {family} id '{id}'"))
}

fn unknown(family: &str, id: &str) -> PipelineError {
    PipelineError::configuration(format!("no {family} prototype with id '{id}'"))
}

/// Builds [`Rule`]s by resolving step references against the prototype
/// repository and applying per-rule overrides.
pub struct RuleFactory {
    prototypes: Arc<PrototypeRepository>,
}

impl RuleFactory {
    pub fn new(prototypes: Arc<PrototypeRepository>) -> Self {
        Self { prototypes }
    }

    pub fn create_rule(&self, src_id: &str, definition: &RuleDefinition) -> Result<Rule> {
        let matcher = GlobBuilder::new(&definition.url)
            .literal_separator(false)
            .build()
            .map_err(|err| {
                PipelineError::configuration(format!(
                    "failed to compile the url pattern of rule '{}'",
                    definition.id
                ))
                .caused_by(err)
            })?
            .compile_matcher();

        let upstream = definition
            .upstream
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|err| {
                PipelineError::configuration(format!(
                    "invalid upstream url of rule '{}'",
                    definition.id
                ))
                .caused_by(err)
            })?;

        let mut authenticators = Vec::new();
        let mut steps = Vec::new();

        for step in &definition.execute {
            self.check_reference(&definition.id, step)?;
            let config = step.config.as_ref();

            if let Some(id) = &step.authenticator {
                if !steps.is_empty() {
                    return Err(PipelineError::configuration(format!(
                        "an authenticator must not follow other handlers in rule '{}'",
                        definition.id
                    )));
                }
                let prototype = self
                    .prototypes
                    .authenticators
                    .get(id)
                    .ok_or_else(|| unknown("authenticator", id))?;
                authenticators.push(prototype.clone().with_config(config)?);
            } else if let Some(id) = &step.authorizer {
                let prototype = self
                    .prototypes
                    .authorizers
                    .get(id)
                    .ok_or_else(|| unknown("authorizer", id))?;
                steps.push(PipelineStep::Authorizer(
                    prototype.clone().with_config(config)?,
                ));
            } else if let Some(id) = &step.hydrator {
                let prototype = self
                    .prototypes
                    .hydrators
                    .get(id)
                    .ok_or_else(|| unknown("hydrator", id))?;
                steps.push(PipelineStep::Hydrator(
                    prototype.clone().with_config(config)?,
                ));
            } else if let Some(id) = &step.mutator {
                let prototype = self
                    .prototypes
                    .mutators
                    .get(id)
                    .ok_or_else(|| unknown("mutator", id))?;
                steps.push(PipelineStep::Mutator(
                    prototype.clone().with_config(config)?,
                ));
            } else {
                return Err(PipelineError::configuration(format!(
                    "error handlers belong into 'on_error' of rule '{}'",
                    definition.id
                )));
            }
        }

        if authenticators.is_empty() {
            return Err(PipelineError::configuration(format!(
                "no authenticator defined for rule '{}'",
                definition.id
            )));
        }

        let mut error_handlers = Vec::new();
        for step in &definition.on_error {
            self.check_reference(&definition.id, step)?;
            let id = step.error_handler.as_ref().ok_or_else(|| {
                PipelineError::configuration(format!(
                    "only error handlers are allowed in 'on_error' of rule '{}'",
                    definition.id
                ))
            })?;
            let prototype = self
                .prototypes
                .error_handlers
                .get(id)
                .ok_or_else(|| unknown("error handler", id))?;
            error_handlers.push(prototype.clone().with_config(step.config.as_ref())?);
        }

        Ok(Rule {
            id: definition.id.clone(),
            src_id: src_id.to_string(),
            matcher,
            methods: definition.methods.clone(),
            upstream,
            authenticators,
            steps,
            error_handlers,
        })
    }

    fn check_reference(&self, rule_id: &str, step: &StepReference) -> Result<()> {
        if step.family_count() != 1 {
            return Err(PipelineError::configuration(format!(
                "a pipeline step of rule '{rule_id}' must reference exactly one handler"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeContext;
    use serde_json::json;
    use warden_pipeline::error::ErrorKind;
    use warden_pipeline::HandlerRegistry;

    fn prototypes() -> Arc<PrototypeRepository> {
        let registry = HandlerRegistry::new();
        let mut prototypes = PrototypeRepository::new();

        prototypes
            .add_authenticator(registry.create_authenticator("anon", "anonymous", None).unwrap())
            .unwrap();
        prototypes
            .add_authorizer(
                registry
                    .create_authorizer(
                        "allow_all",
                        "local",
                        Some(json!({"script": "true"}).as_object().unwrap()),
                    )
                    .unwrap(),
            )
            .unwrap();
        prototypes
            .add_mutator(
                registry
                    .create_mutator(
                        "id_header",
                        "header",
                        Some(
                            json!({"headers": {"X-User": "{{ Subject.ID }}"}})
                                .as_object()
                                .unwrap(),
                        ),
                    )
                    .unwrap(),
            )
            .unwrap();
        prototypes
            .add_error_handler(registry.create_error_handler("fallback", "default", None).unwrap())
            .unwrap();

        Arc::new(prototypes)
    }

    fn definition(value: serde_json::Value) -> RuleDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn duplicate_prototype_ids_are_rejected() {
        let registry = HandlerRegistry::new();
        let mut prototypes = PrototypeRepository::new();
        prototypes
            .add_authenticator(registry.create_authenticator("anon", "anonymous", None).unwrap())
            .unwrap();

        let err = prototypes
            .add_authenticator(registry.create_authenticator("anon", "anonymous", None).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate authenticator id"));
    }

    #[test]
    fn rules_require_an_authenticator() {
        let factory = RuleFactory::new(prototypes());
        let err = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:foo",
                    "url": "http://foo.bar/**",
                    "execute": [{"authorizer": "allow_all"}],
                })),
            )
            .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("no authenticator defined"));
    }

    #[test]
    fn unresolvable_references_are_rejected() {
        let factory = RuleFactory::new(prototypes());
        let err = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:foo",
                    "url": "http://foo.bar/**",
                    "execute": [{"authenticator": "nope"}],
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("no authenticator prototype"));
    }

    #[test]
    fn authenticators_must_come_first() {
        let factory = RuleFactory::new(prototypes());
        let err = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:foo",
                    "url": "http://foo.bar/**",
                    "execute": [
                        {"authenticator": "anon"},
                        {"authorizer": "allow_all"},
                        {"authenticator": "anon"},
                    ],
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("must not follow"));
    }

    #[test]
    fn ambiguous_step_references_are_rejected() {
        let factory = RuleFactory::new(prototypes());
        let err = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:foo",
                    "url": "http://foo.bar/**",
                    "execute": [{"authenticator": "anon", "authorizer": "allow_all"}],
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("exactly one handler"));
    }

    #[tokio::test]
    async fn built_rules_execute_their_pipeline() {
        let factory = RuleFactory::new(prototypes());
        let rule = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:foo",
                    "url": "http://foo.bar/api/**",
                    "methods": ["GET"],
                    "upstream": "http://backend:8080",
                    "execute": [
                        {"authenticator": "anon", "config": {"subject": "anon-user"}},
                        {"authorizer": "allow_all"},
                        {"mutator": "id_header"},
                    ],
                    "on_error": [{"error_handler": "fallback"}],
                })),
            )
            .unwrap();

        assert!(rule.matches_url(&Url::parse("http://foo.bar/api/baz").unwrap()));
        assert!(!rule.matches_url(&Url::parse("http://other.host/api").unwrap()));
        assert!(rule.matches_method("GET"));
        assert!(!rule.matches_method("DELETE"));

        let ctx = FakeContext::new();
        let upstream = rule.execute(&ctx).await.unwrap();
        assert_eq!(upstream.unwrap().as_str(), "http://backend:8080/");
        assert_eq!(
            ctx.upstream_headers(),
            vec![("X-User".to_string(), "anon-user".to_string())]
        );
    }

    #[tokio::test]
    async fn per_rule_overrides_do_not_leak_into_the_prototype() {
        let factory = RuleFactory::new(prototypes());

        let specialized = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:one",
                    "url": "http://foo.bar/**",
                    "execute": [{"authenticator": "anon", "config": {"subject": "special"}}],
                })),
            )
            .unwrap();
        let plain = factory
            .create_rule(
                "test",
                &definition(json!({
                    "id": "rule:two",
                    "url": "http://foo.bar/**",
                    "execute": [{"authenticator": "anon"}],
                })),
            )
            .unwrap();

        let ctx = FakeContext::new();
        let _ = specialized.execute(&ctx).await;

        let subject = crate::rule::authenticate(&plain.authenticators, &ctx)
            .await
            .unwrap();
        assert_eq!(subject.id, "anonymous");
    }
}
