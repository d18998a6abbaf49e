use super::PoolManager;
use crate::auth::InstanceTokenIssuer;
use crate::config::ScopeConfig;
use crate::errors::{Error, Result};
use crate::github::GithubClientFactory;
use crate::params::{ControllerInfo, WorkflowJobEvent};
use crate::providers::Provider;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Process-wide map from scope path to running [`PoolManager`]. Scopes are
/// added and removed at runtime; webhook deliveries are routed here.
pub struct PoolManagerRegistry {
    controller: ControllerInfo,
    store: Arc<dyn Store>,
    providers: HashMap<String, Arc<dyn Provider>>,
    token_issuer: Arc<dyn InstanceTokenIssuer>,
    github_factory: Arc<dyn GithubClientFactory>,
    /// Cancelling this shuts every manager down; each manager gets a child.
    shutdown: CancellationToken,
    managers: RwLock<HashMap<String, Arc<PoolManager>>>,
}

impl PoolManagerRegistry {
    pub fn new(
        controller: ControllerInfo,
        store: Arc<dyn Store>,
        providers: HashMap<String, Arc<dyn Provider>>,
        token_issuer: Arc<dyn InstanceTokenIssuer>,
        github_factory: Arc<dyn GithubClientFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            controller,
            store,
            providers,
            token_issuer,
            github_factory,
            shutdown,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Constructs a manager for the scope, runs its startup protocol and
    /// registers it. Startup failure leaves the registry unchanged.
    #[instrument(skip(self, cfg), fields(scope = %cfg.scope))]
    pub async fn start_scope(&self, cfg: ScopeConfig) -> Result<Arc<PoolManager>> {
        let path = cfg.scope.path();
        if self.managers.read().await.contains_key(&path) {
            return Err(Error::conflict(format!("scope {path} is already running")));
        }

        let github = self.github_factory.create(&cfg)?;
        let manager = PoolManager::new(
            cfg,
            self.controller.clone(),
            github,
            Arc::clone(&self.store),
            self.providers.clone(),
            Arc::clone(&self.token_issuer),
            self.shutdown.child_token(),
        );
        manager.start().await?;

        self.managers
            .write()
            .await
            .insert(path, Arc::clone(&manager));
        Ok(manager)
    }

    /// Signals the scope's manager to quit and waits for its loop, bounded
    /// by the manager's stop timeout. The manager is dropped from the map
    /// even when the wait times out.
    #[instrument(skip(self))]
    pub async fn stop_scope(&self, scope_path: &str) -> Result<()> {
        let manager = self
            .managers
            .write()
            .await
            .remove(scope_path)
            .ok_or_else(|| Error::not_found(format!("scope {scope_path}")))?;

        manager.stop();
        manager.wait().await
    }

    /// Applies a changed scope configuration, rebuilding the GitHub client
    /// when the OAuth token changed.
    #[instrument(skip(self, cfg), fields(scope = %cfg.scope))]
    pub async fn refresh_scope(&self, cfg: ScopeConfig) -> Result<()> {
        let path = cfg.scope.path();
        let manager = self
            .managers
            .read()
            .await
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("scope {path}")))?;

        let github = if manager.config().await.token != cfg.token {
            Some(self.github_factory.create(&cfg)?)
        } else {
            None
        };
        manager.refresh(cfg, github).await;
        Ok(())
    }

    /// Finds the manager a workflow-job event belongs to: the repository
    /// scope when one is registered, the organization scope otherwise.
    pub async fn route(&self, event: &WorkflowJobEvent) -> Result<Arc<PoolManager>> {
        let managers = self.managers.read().await;

        let repo_path = format!(
            "{}/{}",
            event.repository.owner.login, event.repository.name
        );
        if let Some(manager) = managers.get(&repo_path) {
            return Ok(Arc::clone(manager));
        }
        if let Some(org) = &event.organization {
            if let Some(manager) = managers.get(&org.login) {
                return Ok(Arc::clone(manager));
            }
        }
        Err(Error::not_found(format!(
            "no pool manager for {repo_path}"
        )))
    }

    pub async fn stop_all(&self) {
        let managers: Vec<(String, Arc<PoolManager>)> =
            self.managers.write().await.drain().collect();
        for (path, manager) in managers {
            manager.stop();
            if let Err(error) = manager.wait().await {
                tracing::warn!(scope = %path, %error, "pool manager did not stop in time");
            }
        }
    }

    /// Scope paths with a running manager, mostly for logging and tests.
    pub async fn running_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.managers.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockInstanceTokenIssuer;
    use crate::github::{GithubClient, MockGithubClient, MockGithubClientFactory};
    use crate::params::Scope;

    fn scope_cfg(owner: &str, name: &str, token: &str) -> ScopeConfig {
        ScopeConfig {
            scope: Scope::Repository {
                owner: owner.into(),
                name: name.into(),
            },
            token: token.into(),
            webhook_secret: "hush".into(),
            pools: vec![],
        }
    }

    fn startup_ready_client() -> Arc<dyn GithubClient> {
        let mut github = MockGithubClient::new();
        github
            .expect_list_runner_downloads()
            .returning(|_| Ok(vec![]));
        github.expect_list_runners().returning(|_| Ok(vec![]));
        Arc::new(github)
    }

    fn registry(factory: MockGithubClientFactory) -> PoolManagerRegistry {
        PoolManagerRegistry::new(
            ControllerInfo {
                id: "ctrl-1".into(),
                callback_url: "https://controller/api/v1/callbacks/status".into(),
                runner_prefix: "gha".into(),
            },
            Arc::new(crate::store::MemoryStore::new()),
            HashMap::new(),
            Arc::new(MockInstanceTokenIssuer::new()),
            Arc::new(factory),
            CancellationToken::new(),
        )
    }

    fn queued_event(owner: &str, name: &str) -> WorkflowJobEvent {
        serde_json::from_value(serde_json::json!({
            "action": "queued",
            "workflow_job": { "runner_name": null, "labels": ["linux"] },
            "repository": { "name": name, "owner": { "login": owner } },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn start_route_stop_round_trip() {
        let mut factory = MockGithubClientFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|_| Ok(startup_ready_client()));
        let registry = registry(factory);

        registry
            .start_scope(scope_cfg("acme", "widgets", "ghp_a"))
            .await
            .unwrap();
        assert_eq!(registry.running_scopes().await, vec!["acme/widgets"]);

        let manager = registry.route(&queued_event("acme", "widgets")).await.unwrap();
        assert_eq!(manager.scope_id(), "acme/widgets");

        assert!(matches!(
            registry.route(&queued_event("acme", "gadgets")).await,
            Err(Error::NotFound(_))
        ));

        registry.stop_scope("acme/widgets").await.unwrap();
        assert!(registry.running_scopes().await.is_empty());
        assert!(matches!(
            registry.stop_scope("acme/widgets").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_start_is_a_conflict() {
        let mut factory = MockGithubClientFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|_| Ok(startup_ready_client()));
        let registry = registry(factory);

        registry
            .start_scope(scope_cfg("acme", "widgets", "ghp_a"))
            .await
            .unwrap();
        assert!(matches!(
            registry.start_scope(scope_cfg("acme", "widgets", "ghp_a")).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn refresh_rebuilds_client_only_on_credential_change() {
        let mut factory = MockGithubClientFactory::new();
        // Once at start, once for the changed token; the unchanged-token
        // refresh must not hit the factory.
        factory
            .expect_create()
            .times(2)
            .returning(|_| Ok(startup_ready_client()));
        let registry = registry(factory);

        registry
            .start_scope(scope_cfg("acme", "widgets", "ghp_a"))
            .await
            .unwrap();

        let mut same_token = scope_cfg("acme", "widgets", "ghp_a");
        same_token.webhook_secret = "new-secret".into();
        registry.refresh_scope(same_token).await.unwrap();

        let manager = registry.route(&queued_event("acme", "widgets")).await.unwrap();
        assert_eq!(manager.webhook_secret().await, "new-secret");

        registry
            .refresh_scope(scope_cfg("acme", "widgets", "ghp_b"))
            .await
            .unwrap();

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn org_events_fall_back_to_org_scope() {
        let mut factory = MockGithubClientFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|_| Ok(startup_ready_client()));
        let registry = registry(factory);

        registry
            .start_scope(ScopeConfig {
                scope: Scope::Organization {
                    name: "acme".into(),
                },
                token: "ghp_a".into(),
                webhook_secret: "hush".into(),
                pools: vec![],
            })
            .await
            .unwrap();

        let event: WorkflowJobEvent = serde_json::from_value(serde_json::json!({
            "action": "queued",
            "workflow_job": { "runner_name": null, "labels": ["linux"] },
            "repository": { "name": "widgets", "owner": { "login": "acme" } },
            "organization": { "login": "acme" },
        }))
        .unwrap();
        let manager = registry.route(&event).await.unwrap();
        assert_eq!(manager.scope_id(), "acme");

        registry.stop_all().await;
    }
}
