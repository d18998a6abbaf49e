use crate::params::{OSArch, OSType, Pool, Scope};
use crate::providers::OpenStackConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfig {
    /// Identifies this controller in runner labels.
    pub id: String,
    /// URL instances call back with their bootstrap status.
    pub callback_url: String,
    /// Secret for signing instance callback tokens.
    pub jwt_secret: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_runner_prefix")]
    pub runner_prefix: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub openstack: OpenStackConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScopeConfig {
    #[serde(flatten)]
    pub scope: Scope,
    /// OAuth token used for all GitHub calls in this scope.
    pub token: String,
    pub webhook_secret: String,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    pub provider_name: String,
    #[serde(default)]
    pub min_idle_runners: u32,
    pub max_runners: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub os_arch: OSArch,
    pub os_type: OSType,
    pub image: String,
    pub flavor: String,
    pub tags: Vec<String>,
}

impl PoolConfig {
    /// Pool ids must be stable across restarts: runner labels written in one
    /// process lifetime still have to resolve in the next. Derive them from
    /// the fields that define the pool's identity.
    pub fn materialize(&self, scope_id: &str) -> Pool {
        let mut tags = self.tags.clone();
        tags.sort();
        let key = format!(
            "{}|{}|{}|{}|{}",
            scope_id,
            self.provider_name,
            self.image,
            self.flavor,
            tags.join(",")
        );
        Pool {
            id: Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string(),
            scope_id: scope_id.to_string(),
            provider_name: self.provider_name.clone(),
            min_idle_runners: self.min_idle_runners,
            max_runners: self.max_runners,
            enabled: self.enabled,
            os_arch: self.os_arch,
            os_type: self.os_type,
            image: self.image.clone(),
            flavor: self.flavor.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config"))
            .build()?;

        let cfg = settings.try_deserialize::<Config>()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let provider_names: HashSet<&str> =
            self.providers.iter().map(|p| p.name.as_str()).collect();
        if provider_names.len() != self.providers.len() {
            return Err(ConfigError::Validation("duplicate provider names".into()));
        }

        let mut scope_paths = HashSet::new();
        for scope in &self.scopes {
            let path = scope.scope.path();
            if !scope_paths.insert(path.clone()) {
                return Err(ConfigError::Validation(format!(
                    "scope {path} declared more than once"
                )));
            }

            let mut pool_ids = HashSet::new();
            for pool in &scope.pools {
                if !provider_names.contains(pool.provider_name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "scope {path} references unknown provider {}",
                        pool.provider_name
                    )));
                }
                if pool.max_runners == 0 {
                    return Err(ConfigError::Validation(format!(
                        "scope {path} has a pool with max_runners = 0"
                    )));
                }
                if !pool_ids.insert(pool.materialize(&path).id) {
                    return Err(ConfigError::Validation(format!(
                        "scope {path} has two pools with the same provider, image, flavor and tags"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_runner_prefix() -> String {
    "gha".to_string()
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(tags: &[&str]) -> PoolConfig {
        PoolConfig {
            provider_name: "openstack".into(),
            min_idle_runners: 1,
            max_runners: 4,
            enabled: true,
            os_arch: OSArch::Amd64,
            os_type: OSType::Linux,
            image: "ubuntu-22.04".into(),
            flavor: "m1.small".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn pool_ids_are_deterministic_and_order_insensitive() {
        let a = pool_config(&["linux", "x64"]).materialize("acme/widgets");
        let b = pool_config(&["x64", "linux"]).materialize("acme/widgets");
        assert_eq!(a.id, b.id);

        let other_scope = pool_config(&["linux", "x64"]).materialize("acme/gadgets");
        assert_ne!(a.id, other_scope.id);
    }

    #[test]
    fn scope_config_deserializes_tagged_scopes() {
        let repo: ScopeConfig = serde_json::from_value(serde_json::json!({
            "kind": "repository",
            "owner": "acme",
            "name": "widgets",
            "token": "ghp_x",
            "webhook_secret": "hush"
        }))
        .unwrap();
        assert_eq!(repo.scope.path(), "acme/widgets");

        let org: ScopeConfig = serde_json::from_value(serde_json::json!({
            "kind": "organization",
            "name": "acme",
            "token": "ghp_y",
            "webhook_secret": "hush"
        }))
        .unwrap();
        assert_eq!(org.scope.path(), "acme");
    }

    #[test]
    fn validation_rejects_unknown_provider() {
        let cfg = Config {
            controller: ControllerConfig {
                id: "ctrl".into(),
                callback_url: "https://controller/api/v1/callbacks/status".into(),
                jwt_secret: "hush".into(),
                bind_address: default_bind_address(),
                log_file: None,
                runner_prefix: default_runner_prefix(),
            },
            providers: vec![],
            scopes: vec![ScopeConfig {
                scope: Scope::Organization {
                    name: "acme".into(),
                },
                token: "ghp_x".into(),
                webhook_secret: "hush".into(),
                pools: vec![pool_config(&["linux"])],
            }],
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }
}
