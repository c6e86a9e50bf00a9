//! Service configuration.
//!
//! Loaded from a YAML file with `WARDEN_` prefixed environment variable
//! overrides (`WARDEN_SERVE__PORT=8080` overrides `serve.port`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use warden_pipeline::RawConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for a single decision, including all outbound calls.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4456
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// A handler prototype definition: id, type tag and the type specific
/// configuration handed to the factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub handler_type: String,
    #[serde(default)]
    pub config: Option<RawConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub authenticators: Vec<HandlerDefinition>,
    #[serde(default)]
    pub authorizers: Vec<HandlerDefinition>,
    #[serde(default)]
    pub hydrators: Vec<HandlerDefinition>,
    #[serde(default)]
    pub mutators: Vec<HandlerDefinition>,
    #[serde(default)]
    pub error_handlers: Vec<HandlerDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Rule-set file, or a directory whose `*.yaml`/`*.yml` files are
    /// loaded at startup.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.serve.host, "0.0.0.0");
        assert_eq!(config.serve.port, 4456);
        assert_eq!(config.serve.timeout, Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.rules.file.is_none());
    }

    #[test]
    fn full_config_deserializes() {
        let config: Config = serde_yaml::from_str(
            r#"
serve:
  host: 127.0.0.1
  port: 8080
  timeout: 10s
logging:
  level: debug
  json: true
pipeline:
  authenticators:
    - id: anon
      type: anonymous
    - id: jwt_auth
      type: jwt
      config:
        jwks_endpoint:
          url: http://idp.example/jwks
        assertions:
          trusted_issuers:
            - https://idp.example
  error_handlers:
    - id: authenticate_things
      type: www_authenticate
      config:
        when:
          - error:
              - type: authentication_error
rules:
  file: /etc/warden/rules.yaml
"#,
        )
        .unwrap();

        assert_eq!(config.serve.port, 8080);
        assert_eq!(config.serve.timeout, Duration::from_secs(10));
        assert_eq!(config.pipeline.authenticators.len(), 2);
        assert_eq!(config.pipeline.authenticators[1].handler_type, "jwt");
        assert!(config.pipeline.authenticators[1].config.is_some());
        assert_eq!(config.pipeline.error_handlers.len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = serde_yaml::from_str::<Config>("serve:\n  hosst: foo\n");
        assert!(result.is_err());
    }
}
