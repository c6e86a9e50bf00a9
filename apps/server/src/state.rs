//! Shared application state: prototypes, rules and the cache.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;

use warden_pipeline::{Cache, HandlerRegistry, InMemoryCache};
use warden_rules::{
    ChangeType, PrototypeRepository, RuleFactory, RuleRepository, RuleSet, RuleSetChangedEvent,
};

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    pub repository: Arc<RuleRepository>,
    pub cache: Arc<dyn Cache>,
    pub timeout: Duration,
}

impl AppState {
    /// Builds all handler prototypes, wires the rule repository, and loads
    /// the configured rule file (if any).
    pub fn build(config: &Config) -> anyhow::Result<Self> {
        let registry = HandlerRegistry::new();
        let mut prototypes = PrototypeRepository::new();

        for def in &config.pipeline.authenticators {
            prototypes.add_authenticator(registry.create_authenticator(
                &def.id,
                &def.handler_type,
                def.config.as_ref(),
            )?)?;
        }
        for def in &config.pipeline.authorizers {
            prototypes.add_authorizer(registry.create_authorizer(
                &def.id,
                &def.handler_type,
                def.config.as_ref(),
            )?)?;
        }
        for def in &config.pipeline.hydrators {
            prototypes.add_hydrator(registry.create_hydrator(
                &def.id,
                &def.handler_type,
                def.config.as_ref(),
            )?)?;
        }
        for def in &config.pipeline.mutators {
            prototypes.add_mutator(registry.create_mutator(
                &def.id,
                &def.handler_type,
                def.config.as_ref(),
            )?)?;
        }
        for def in &config.pipeline.error_handlers {
            prototypes.add_error_handler(registry.create_error_handler(
                &def.id,
                &def.handler_type,
                def.config.as_ref(),
            )?)?;
        }

        let repository = Arc::new(RuleRepository::new(RuleFactory::new(Arc::new(prototypes))));

        if let Some(path) = &config.rules.file {
            load_rule_sets(&repository, path)?;
        }

        Ok(Self {
            repository,
            cache: Arc::new(InMemoryCache::new()),
            timeout: config.serve.timeout,
        })
    }
}

/// Loads rule sets from a file, or from every `*.yaml`/`*.yml` file in a
/// directory. Each file is applied as its own change event, so it can
/// later be replaced or removed independently.
fn load_rule_sets(repository: &RuleRepository, path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        return load_rule_file(repository, path);
    }

    let mut files: Vec<_> = std::fs::read_dir(path)
        .with_context(|| format!("failed to read rule directory {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|file| {
            matches!(
                file.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();

    for file in files {
        load_rule_file(repository, &file)?;
    }
    Ok(())
}

fn load_rule_file(repository: &RuleRepository, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    let rule_set: RuleSet = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse rule file {}", path.display()))?;

    let count = rule_set.rules.len();
    repository.apply(RuleSetChangedEvent {
        src: format!("file:{}", path.display()),
        rules: rule_set.rules,
        change_type: ChangeType::Create,
    })?;

    info!(file = %path.display(), rules = count, "loaded rule set");
    Ok(())
}
