//! Pipeline core of the warden access decision engine.
//!
//! A request travels through an ordered pipeline of handlers:
//! authenticators produce a [`Subject`], authorizers permit or deny,
//! hydrators enrich the subject from remote systems, and mutators attach
//! headers and cookies for the upstream. If any step fails, condition
//! matched error handlers produce the client visible outcome.
//!
//! Handlers are built by type-tagged factories held in a
//! [`HandlerRegistry`] and follow the prototype/override pattern: one
//! immutable prototype per configured handler id, cheaply specialized per
//! rule via `with_config`.

pub mod authenticators;
pub mod authorizers;
pub mod cache;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod error_handlers;
pub mod extractors;
pub mod handler;
pub mod hydrators;
pub mod mutators;
pub mod oauth2;
pub mod registry;
pub mod script;
pub mod subject;
pub mod template;
pub mod truststore;

pub use cache::{Cache, InMemoryCache};
pub use context::{AppContext, ClientResponse, Context};
pub use error::{ErrorKind, PipelineError, Result};
pub use handler::{
    Authenticator, Authorizer, ErrorHandler, Hydrator, Mutator, RawConfig,
};
pub use registry::HandlerRegistry;
pub use subject::Subject;

#[cfg(test)]
pub use context::MockContext;
