//! Mutator rendering cookies for the upstream request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::handler::{is_empty_config, Mutator, RawConfig};
use crate::registry::decode_config;
use crate::subject::Subject;
use crate::template::Template;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    cookies: HashMap<String, Template>,
}

#[derive(Debug)]
pub struct CookieMutator {
    id: String,
    cookies: HashMap<String, Template>,
}

impl CookieMutator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("cookie mutator", config)?;

        if config.cookies.is_empty() {
            return Err(PipelineError::configuration("no cookie definitions provided"));
        }

        Ok(Self {
            id: id.to_string(),
            cookies: config.cookies,
        })
    }

    pub fn cookies(&self) -> &HashMap<String, Template> {
        &self.cookies
    }
}

#[async_trait]
impl Mutator for CookieMutator {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&Subject>) -> Result<()> {
        debug!(handler = %self.id, "mutating request using cookie mutator");

        let Some(subject) = subject else {
            return Err(PipelineError::internal(
                "failed to execute cookie mutator due to 'nil' subject",
            )
            .with_handler_id(&self.id));
        };

        for (name, template) in &self.cookies {
            let value = template.render(Some(subject), None).map_err(|err| {
                PipelineError::internal(format!("failed to render value for the '{name}' cookie"))
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;
            ctx.add_cookie_for_upstream(name, &value);
        }

        Ok(())
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Mutator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        Ok(Arc::new(Self::new(&self.id, config)?))
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

pub(crate) fn factory(
    id: &str,
    handler_type: &str,
    config: Option<&RawConfig>,
) -> Result<Option<Arc<dyn Mutator>>> {
    if handler_type != "cookie" {
        return Ok(None);
    }
    Ok(Some(Arc::new(CookieMutator::new(id, config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MockContext;
    use crate::error::ErrorKind;
    use mockall::predicate::eq;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawConfig {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn construction_requires_cookies() {
        let err = CookieMutator::new("cmut", None).unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("no cookie"));

        let err = CookieMutator::new("cmut", Some(&RawConfig::new())).unwrap_err();
        assert!(err.to_string().contains("no cookie"));
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let err = CookieMutator::new(
            "cmut",
            Some(&raw(json!({"cookies": {"foo": "bar"}, "foo": "bar"}))),
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("failed to decode"));
    }

    #[test]
    fn malformed_templates_fail_construction() {
        let err = CookieMutator::new(
            "cmut",
            Some(&raw(json!({"cookies": {"bar": "{{ broken"}}))),
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("failed to decode"));
    }

    #[test]
    fn valid_config_compiles_all_templates() {
        let mutator = CookieMutator::new(
            "cmut",
            Some(&raw(json!({"cookies": {
                "foo": "bar",
                "bar": "{{ Subject.ID }}",
            }}))),
        )
        .unwrap();

        assert_eq!(mutator.cookies().len(), 2);
        assert_eq!(mutator.handler_id(), "cmut");

        let value = mutator.cookies()["foo"].render(None, None).unwrap();
        assert_eq!(value, "bar");
        let value = mutator.cookies()["bar"]
            .render(Some(&Subject::new("baz")), None)
            .unwrap();
        assert_eq!(value, "baz");
    }

    #[test]
    fn prototype_and_override_behavior() {
        let prototype: Arc<dyn Mutator> = Arc::new(
            CookieMutator::new("cmut1", Some(&raw(json!({"cookies": {"foo": "bar"}}))))
                .unwrap(),
        );

        let configured = prototype.clone().with_config(None).unwrap();
        assert!(Arc::ptr_eq(&prototype, &configured));

        let configured = prototype
            .clone()
            .with_config(Some(&raw(json!({"cookies": {"baz": "qux"}}))))
            .unwrap();
        assert!(!Arc::ptr_eq(&prototype, &configured));
        assert_eq!(configured.handler_id(), "cmut1");
    }

    #[tokio::test]
    async fn rendered_cookies_are_added_for_the_upstream() {
        let mutator = CookieMutator::new(
            "cmut",
            Some(&raw(json!({"cookies": {"user": "{{ Subject.ID }}"}}))),
        )
        .unwrap();

        let mut ctx = MockContext::new();
        ctx.expect_add_cookie_for_upstream()
            .with(eq("user"), eq("baz"))
            .times(1)
            .return_const(());

        mutator
            .execute(&ctx, Some(&Subject::new("baz")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_subject_is_an_internal_error() {
        let mutator =
            CookieMutator::new("cmut", Some(&raw(json!({"cookies": {"foo": "bar"}}))))
                .unwrap();

        let err = mutator.execute(&MockContext::new(), None).await.unwrap_err();
        assert!(err.is(ErrorKind::Internal));
        assert_eq!(err.handler_id(), Some("cmut"));
    }
}
