//! Boolean / object scripts evaluated against the pipeline state.
//!
//! Scripts are written in [rhai] and compiled once at construction time.
//! They run against a narrow capability surface instead of the full
//! [`Context`]: a `ctx` object exposing read-only request accessors and a
//! `subject` value that may be inspected and decorated. Post-processing
//! scripts additionally see the decoded response `payload`.
//!
//! Outcome contract: a thrown value denies with the thrown value as the
//! reason, a `false` result denies with "script returned false", anything
//! else (including no result at all) allows.
//!
//! [rhai]: https://rhai.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use rhai::{Dynamic, Engine, Scope, AST};
use thiserror::Error;
use url::Url;

use crate::context::Context;
use crate::subject::Subject;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to compile script: {0}")]
    Compilation(String),

    #[error("{0}")]
    Thrown(String),

    #[error("failed to execute script: {0}")]
    Evaluation(String),
}

/// Read-only request snapshot exposed to scripts as `ctx`.
///
/// Scripts see a snapshot, never a live request handle.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
}

impl ScriptRequest {
    pub fn from_context(ctx: &dyn Context) -> Self {
        Self {
            method: ctx.request_method(),
            url: ctx.request_url().to_string(),
            headers: ctx.request_headers(),
        }
    }

    fn request_method(&mut self) -> String {
        self.method.clone()
    }

    fn request_url(&mut self) -> String {
        self.url.clone()
    }

    fn request_header(&mut self, name: &str) -> String {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    }

    fn request_cookie(&mut self, name: &str) -> String {
        let cookies = self.request_header("Cookie");
        cookies
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
            .unwrap_or_default()
    }

    fn request_query_parameter(&mut self, name: &str) -> String {
        let Ok(url) = Url::parse(&self.url) else {
            return String::new();
        };
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default()
    }
}

lazy_static! {
    static ref ENGINE: Engine = {
        let mut engine = Engine::new();
        engine
            .register_type_with_name::<ScriptRequest>("Request")
            .register_fn("request_method", ScriptRequest::request_method)
            .register_fn("request_url", ScriptRequest::request_url)
            .register_fn("request_header", ScriptRequest::request_header)
            .register_fn("request_cookie", ScriptRequest::request_cookie)
            .register_fn("request_query_parameter", ScriptRequest::request_query_parameter);
        engine.set_max_operations(100_000);
        engine
    };
}

/// A compiled script.
#[derive(Clone)]
pub struct Script {
    source: String,
    ast: Arc<AST>,
}

impl Script {
    pub fn new(source: impl Into<String>) -> Result<Self, ScriptError> {
        let source = source.into();
        let ast = ENGINE
            .compile(&source)
            .map_err(|err| ScriptError::Compilation(err.to_string()))?;
        Ok(Self {
            source,
            ast: Arc::new(ast),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Runs the script with `ctx` and `subject` bound. On success returns
    /// the script result together with the (possibly decorated) subject as
    /// the script left it.
    pub fn evaluate(
        &self,
        ctx: &dyn Context,
        subject: &Subject,
    ) -> Result<(Dynamic, Subject), ScriptError> {
        let mut scope = Scope::new();
        scope.push("ctx", ScriptRequest::from_context(ctx));
        scope.push(
            "subject",
            rhai::serde::to_dynamic(subject)
                .map_err(|err| ScriptError::Evaluation(err.to_string()))?,
        );

        let result = self.run(&mut scope)?;

        let subject_after = scope
            .get_value::<Dynamic>("subject")
            .and_then(|value| rhai::serde::from_dynamic::<Subject>(&value).ok())
            .unwrap_or_else(|| subject.clone());

        Ok((result, subject_after))
    }

    /// Runs the script with `ctx` and the decoded response `payload` bound.
    pub fn evaluate_on_payload(
        &self,
        ctx: &dyn Context,
        payload: &serde_json::Value,
    ) -> Result<Dynamic, ScriptError> {
        let mut scope = Scope::new();
        scope.push("ctx", ScriptRequest::from_context(ctx));
        scope.push(
            "payload",
            rhai::serde::to_dynamic(payload)
                .map_err(|err| ScriptError::Evaluation(err.to_string()))?,
        );

        self.run(&mut scope)
    }

    fn run(&self, scope: &mut Scope) -> Result<Dynamic, ScriptError> {
        ENGINE
            .eval_ast_with_scope::<Dynamic>(scope, &self.ast)
            .map_err(|err| match *err {
                rhai::EvalAltResult::ErrorRuntime(value, _) => {
                    ScriptError::Thrown(value.to_string())
                }
                other => ScriptError::Evaluation(other.to_string()),
            })
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Script").field(&self.source).finish()
    }
}

impl PartialEq for Script {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
