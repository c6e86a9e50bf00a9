//! Warden - identity-aware access decision service
//!
//! Sits in front of upstream services as a reverse-proxy companion or a
//! decision-only sidecar: every inbound request runs through the pipeline
//! of the first matching rule, and the verdict is encoded in the response
//! status plus the accumulated upstream headers and cookies.

pub mod api;
pub mod config;
pub mod logging;
pub mod state;

pub use config::Config;
pub use state::AppState;
