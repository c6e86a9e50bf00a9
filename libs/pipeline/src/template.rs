//! Text templates rendered against the pipeline state.
//!
//! Templates use handlebars syntax and see the current [`Subject`] under
//! `Subject` plus an optional free-form value map under `Values`:
//!
//! ```text
//! { "user_id": "{{ urlenc Subject.ID }}" }
//! ```
//!
//! Parsing happens at construction time, so a malformed template surfaces
//! as a configuration problem instead of a per-request failure.

use std::fmt;

use handlebars::{handlebars_helper, Handlebars};
use lazy_static::lazy_static;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use thiserror::Error;

use crate::subject::Subject;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to parse template: {0}")]
    Parse(#[from] Box<handlebars::TemplateError>),

    #[error("failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),
}

handlebars_helper!(urlenc: |value: String| urlencoding::encode(&value).into_owned());

lazy_static! {
    static ref REGISTRY: Handlebars<'static> = {
        let mut registry = Handlebars::new();
        registry.register_helper("urlenc", Box::new(urlenc));
        registry
    };
}

/// A parsed template.
#[derive(Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Result<Self, TemplateError> {
        let source = source.into();
        handlebars::Template::compile(&source).map_err(Box::new)?;
        Ok(Self { source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the template against the given subject and values.
    pub fn render(
        &self,
        subject: Option<&Subject>,
        values: Option<&Value>,
    ) -> Result<String, TemplateError> {
        let data = json!({
            "Subject": subject,
            "Values": values,
        });
        Ok(REGISTRY.render_template(&self.source, &data)?)
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let source = String::deserialize(deserializer)?;
        Template::new(source).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_subject_fields() {
        let template = Template::new("{{ Subject.ID }}").unwrap();
        let rendered = template.render(Some(&Subject::new("bar")), None).unwrap();
        assert_eq!(rendered, "bar");
    }

    #[test]
    fn renders_subject_attributes() {
        let mut subject = Subject::new("my-id");
        subject
            .attributes
            .insert("bar".to_string(), json!("baz"));

        let template = Template::new("{{ Subject.Attributes.bar }}").unwrap();
        assert_eq!(template.render(Some(&subject), None).unwrap(), "baz");
    }

    #[test]
    fn renders_values() {
        let template = Template::new("{{ Values.request_url }}").unwrap();
        let rendered = template
            .render(None, Some(&json!({"request_url": "http://foo.bar/baz"})))
            .unwrap();
        assert_eq!(rendered, "http://foo.bar/baz");
    }

    #[test]
    fn urlenc_helper_escapes() {
        let template = Template::new("user_id={{ urlenc Subject.ID }}").unwrap();
        let rendered = template.render(Some(&Subject::new("my id")), None).unwrap();
        assert_eq!(rendered, "user_id=my%20id");
    }

    #[test]
    fn literal_text_renders_verbatim() {
        let template = Template::new("bar").unwrap();
        assert_eq!(template.render(None, None).unwrap(), "bar");
    }

    #[test]
    fn malformed_template_fails_to_parse() {
        assert!(Template::new("{{ Subject.ID").is_err());
    }

    #[test]
    fn deserialization_parses_the_template() {
        let template: Template = serde_json::from_value(json!("{{ Subject.ID }}")).unwrap();
        assert_eq!(template.source(), "{{ Subject.ID }}");

        let result = serde_json::from_value::<Template>(json!("{{ broken"));
        assert!(result.is_err());
    }
}
