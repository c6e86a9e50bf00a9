//! Authorizers: pipeline steps permitting or denying a request.

mod local;
mod remote;

pub use local::LocalAuthorizer;
pub use remote::RemoteAuthorizer;

pub(crate) use local::factory as local_factory;
pub(crate) use remote::factory as remote_factory;
