//! Authenticator accepting every request with a configurable subject id.
//!
//! Placed at the end of an authenticator chain it turns "no usable
//! credential" into a well-known anonymous principal instead of an error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::handler::{is_empty_config, Authenticator, RawConfig};
use crate::registry::decode_config;
use crate::subject::Subject;

const DEFAULT_SUBJECT: &str = "anonymous";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    subject: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnonymousAuthenticator {
    id: String,
    subject: String,
}

impl AnonymousAuthenticator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("anonymous authenticator", config)?;

        Ok(Self {
            id: id.to_string(),
            subject: config.subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn execute(&self, _ctx: &dyn Context) -> Result<Subject> {
        debug!(handler = %self.id, "authenticating using anonymous authenticator");

        Ok(Subject::new(self.subject.clone()))
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let config: Config = decode_config("anonymous authenticator", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            subject: config.subject.unwrap_or_else(|| self.subject.clone()),
        }))
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

pub(crate) fn factory(
    id: &str,
    handler_type: &str,
    config: Option<&RawConfig>,
) -> Result<Option<Arc<dyn Authenticator>>> {
    if handler_type != "anonymous" {
        return Ok(None);
    }
    Ok(Some(Arc::new(AnonymousAuthenticator::new(id, config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MockContext;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawConfig {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn subject_can_be_configured() {
        let auth = AnonymousAuthenticator::new("auth1", Some(&raw(json!({"subject": "anon"}))))
            .unwrap();
        assert_eq!(auth.subject(), "anon");
        assert_eq!(auth.handler_id(), "auth1");
    }

    #[test]
    fn subject_defaults_to_anonymous() {
        let auth = AnonymousAuthenticator::new("auth1", None).unwrap();
        assert_eq!(auth.subject(), "anonymous");
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let err = AnonymousAuthenticator::new("auth1", Some(&raw(json!({"foo": "bar"}))))
            .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("failed to decode"));
    }

    #[tokio::test]
    async fn execute_produces_the_configured_subject() {
        let auth = AnonymousAuthenticator::new("anon_auth", Some(&raw(json!({"subject": "anon"}))))
            .unwrap();
        let ctx = MockContext::new();

        let subject = auth.execute(&ctx).await.unwrap();
        assert_eq!(subject.id, "anon");
        assert!(subject.attributes.is_empty());
    }

    #[tokio::test]
    async fn fallback_is_not_allowed() {
        let auth = AnonymousAuthenticator::new("auth1", None).unwrap();
        assert!(!auth.is_fallback_on_error_allowed());
    }

    #[test]
    fn empty_override_returns_the_prototype() {
        let prototype: Arc<dyn Authenticator> =
            Arc::new(AnonymousAuthenticator::new("auth2", None).unwrap());

        let configured = prototype.clone().with_config(None).unwrap();
        assert!(Arc::ptr_eq(&prototype, &configured));

        let configured = prototype.clone().with_config(Some(&RawConfig::new())).unwrap();
        assert!(Arc::ptr_eq(&prototype, &configured));
    }

    #[test]
    fn override_replaces_the_subject_without_touching_the_prototype() {
        let prototype =
            Arc::new(AnonymousAuthenticator::new("auth2", Some(&raw(json!({"subject": "anon"}))))
                .unwrap());

        let configured = prototype
            .clone()
            .with_config(Some(&raw(json!({"subject": "foo"}))))
            .unwrap();

        assert_eq!(prototype.subject(), "anon");
        assert_eq!(configured.handler_id(), "auth2");
    }

    #[test]
    fn override_with_unknown_keys_is_rejected() {
        let prototype = Arc::new(AnonymousAuthenticator::new("auth2", None).unwrap());
        let err = prototype
            .with_config(Some(&raw(json!({"foo": "bar"}))))
            .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("failed to decode"));
    }
}
