//! Handler registry and the factory protocol.
//!
//! The registry is an explicit value built once during bootstrap: every
//! handler family holds an ordered list of factory functions, each
//! inspecting a type tag and claiming it or passing. The first claiming
//! factory wins. An unclaimed type tag is a configuration error.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::handler::{Authenticator, Authorizer, ErrorHandler, Hydrator, Mutator, RawConfig};
use crate::{authenticators, authorizers, error_handlers, hydrators, mutators};

/// Decodes a raw config map into a typed config struct. Unknown fields are
/// rejected by the target types (`deny_unknown_fields`), surfacing as a
/// configuration error here.
pub fn decode_config<T: DeserializeOwned>(what: &str, config: Option<&RawConfig>) -> Result<T> {
    let value = match config {
        Some(map) => Value::Object(map.clone()),
        None => Value::Object(Map::new()),
    };

    serde_json::from_value(value).map_err(|err| {
        PipelineError::configuration(format!("failed to decode {what} config")).caused_by(err)
    })
}

pub type AuthenticatorFactory =
    fn(id: &str, handler_type: &str, config: Option<&RawConfig>)
        -> Result<Option<Arc<dyn Authenticator>>>;
pub type AuthorizerFactory =
    fn(id: &str, handler_type: &str, config: Option<&RawConfig>)
        -> Result<Option<Arc<dyn Authorizer>>>;
pub type HydratorFactory =
    fn(id: &str, handler_type: &str, config: Option<&RawConfig>)
        -> Result<Option<Arc<dyn Hydrator>>>;
pub type MutatorFactory =
    fn(id: &str, handler_type: &str, config: Option<&RawConfig>)
        -> Result<Option<Arc<dyn Mutator>>>;
pub type ErrorHandlerFactory =
    fn(id: &str, handler_type: &str, config: Option<&RawConfig>)
        -> Result<Option<Arc<dyn ErrorHandler>>>;

/// Factories for all handler families.
pub struct HandlerRegistry {
    authenticators: Vec<AuthenticatorFactory>,
    authorizers: Vec<AuthorizerFactory>,
    hydrators: Vec<HydratorFactory>,
    mutators: Vec<MutatorFactory>,
    error_handlers: Vec<ErrorHandlerFactory>,
}

impl HandlerRegistry {
    /// A registry with all built-in handler types registered.
    pub fn new() -> Self {
        Self {
            authenticators: vec![
                authenticators::anonymous_factory,
                authenticators::jwt_factory,
                authenticators::oauth2_introspection_factory,
                authenticators::generic_factory,
            ],
            authorizers: vec![authorizers::local_factory, authorizers::remote_factory],
            hydrators: vec![hydrators::generic_factory],
            mutators: vec![
                mutators::header_factory,
                mutators::cookie_factory,
                mutators::jwt_factory,
            ],
            error_handlers: vec![
                error_handlers::default_factory,
                error_handlers::redirect_factory,
                error_handlers::www_authenticate_factory,
            ],
        }
    }

    pub fn register_authenticator_factory(&mut self, factory: AuthenticatorFactory) {
        self.authenticators.push(factory);
    }

    pub fn register_authorizer_factory(&mut self, factory: AuthorizerFactory) {
        self.authorizers.push(factory);
    }

    pub fn register_hydrator_factory(&mut self, factory: HydratorFactory) {
        self.hydrators.push(factory);
    }

    pub fn register_mutator_factory(&mut self, factory: MutatorFactory) {
        self.mutators.push(factory);
    }

    pub fn register_error_handler_factory(&mut self, factory: ErrorHandlerFactory) {
        self.error_handlers.push(factory);
    }

    pub fn create_authenticator(
        &self,
        id: &str,
        handler_type: &str,
        config: Option<&RawConfig>,
    ) -> Result<Arc<dyn Authenticator>> {
        for factory in &self.authenticators {
            if let Some(handler) = factory(id, handler_type, config)? {
                return Ok(handler);
            }
        }
        Err(unsupported("authenticator", handler_type))
    }

    pub fn create_authorizer(
        &self,
        id: &str,
        handler_type: &str,
        config: Option<&RawConfig>,
    ) -> Result<Arc<dyn Authorizer>> {
        for factory in &self.authorizers {
            if let Some(handler) = factory(id, handler_type, config)? {
                return Ok(handler);
            }
        }
        Err(unsupported("authorizer", handler_type))
    }

    pub fn create_hydrator(
        &self,
        id: &str,
        handler_type: &str,
        config: Option<&RawConfig>,
    ) -> Result<Arc<dyn Hydrator>> {
        for factory in &self.hydrators {
            if let Some(handler) = factory(id, handler_type, config)? {
                return Ok(handler);
            }
        }
        Err(unsupported("hydrator", handler_type))
    }

    pub fn create_mutator(
        &self,
        id: &str,
        handler_type: &str,
        config: Option<&RawConfig>,
    ) -> Result<Arc<dyn Mutator>> {
        for factory in &self.mutators {
            if let Some(handler) = factory(id, handler_type, config)? {
                return Ok(handler);
            }
        }
        Err(unsupported("mutator", handler_type))
    }

    pub fn create_error_handler(
        &self,
        id: &str,
        handler_type: &str,
        config: Option<&RawConfig>,
    ) -> Result<Arc<dyn ErrorHandler>> {
        for factory in &self.error_handlers {
            if let Some(handler) = factory(id, handler_type, config)? {
                return Ok(handler);
            }
        }
        Err(unsupported("error handler", handler_type))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(family: &str, handler_type: &str) -> PipelineError {
    PipelineError::configuration(format!("unsupported {family} type '{handler_type}'"))
}
