use super::{controller_label, pool_id_from_labels, pool_label};
use crate::auth::InstanceTokenIssuer;
use crate::config::ScopeConfig;
use crate::errors::{Error, Result};
use crate::github::{self, GithubClient, Runner, RunnerApplicationDownload};
use crate::params::{
    BootstrapArgs, ControllerInfo, CreateInstanceParams, Instance, InstanceStatus, Pool,
    RunnerStatus, UpdateInstanceParams, WorkflowJobEvent,
};
use crate::providers::Provider;
use crate::store::Store;
use futures::{StreamExt, stream};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const CONSOLIDATE_INTERVAL: Duration = Duration::from_secs(5);
const TOOLS_REFRESH_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);
const STOP_TIMEOUT: Duration = Duration::from_secs(20);
const PROVISION_CONCURRENCY: usize = 4;

/// Owns one scope: keeps the instances recorded in the store, the servers at
/// the provider and the runners registered on GitHub in agreement with the
/// scope's pool declarations.
///
/// All mutating work inside a scope is serialized by the state mutex:
/// consolidate ticks, webhook events and config refreshes queue behind each
/// other. Different scopes run in parallel.
pub struct PoolManager {
    scope_id: String,
    controller: ControllerInfo,
    store: Arc<dyn Store>,
    providers: HashMap<String, Arc<dyn Provider>>,
    token_issuer: Arc<dyn InstanceTokenIssuer>,
    state: Mutex<ManagerState>,
    quit: CancellationToken,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

struct ManagerState {
    cfg: ScopeConfig,
    github: Arc<dyn GithubClient>,
    tools: Vec<RunnerApplicationDownload>,
}

impl PoolManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ScopeConfig,
        controller: ControllerInfo,
        github: Arc<dyn GithubClient>,
        store: Arc<dyn Store>,
        providers: HashMap<String, Arc<dyn Provider>>,
        token_issuer: Arc<dyn InstanceTokenIssuer>,
        quit: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            scope_id: cfg.scope.path(),
            controller,
            store,
            providers,
            token_issuer,
            state: Mutex::new(ManagerState {
                cfg,
                github,
                tools: vec![],
            }),
            quit,
            done: Mutex::new(None),
        })
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub async fn webhook_secret(&self) -> String {
        self.state.lock().await.cfg.webhook_secret.clone()
    }

    pub async fn config(&self) -> ScopeConfig {
        self.state.lock().await.cfg.clone()
    }

    /// Runs the startup protocol and spawns the reconciliation loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.startup().await?;

        let (tx, rx) = oneshot::channel();
        *self.done.lock().await = Some(rx);
        tokio::spawn(Arc::clone(self).run_loop(tx));
        Ok(())
    }

    /// Signals the loop to exit. Pair with [`wait`](Self::wait).
    pub fn stop(&self) {
        self.quit.cancel();
    }

    /// Blocks until the loop signals done, up to 20 seconds.
    pub async fn wait(&self) -> Result<()> {
        let rx = self.done.lock().await.take();
        let Some(rx) = rx else {
            return Ok(());
        };
        match tokio::time::timeout(STOP_TIMEOUT, rx).await {
            // A dropped sender still means the loop is gone.
            Ok(_) => Ok(()),
            Err(_) => Err(Error::timeout("waiting for pool manager to stop")),
        }
    }

    /// Swaps the scope configuration, and the GitHub client when the caller
    /// rebuilt one for a changed credential.
    pub async fn refresh(&self, cfg: ScopeConfig, github: Option<Arc<dyn GithubClient>>) {
        let mut state = self.state.lock().await;
        if let Some(github) = github {
            state.github = github;
        }
        state.cfg = cfg;
    }

    /// Startup protocol, sequential and fail fast: cache the tools manifest,
    /// list the scope's runners on GitHub, then reconcile both directions of
    /// drift accumulated while the controller was down.
    #[instrument(skip(self), fields(scope = %self.scope_id))]
    pub(crate) async fn startup(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let tools = state.github.list_runner_downloads(&state.cfg.scope).await?;
        state.tools = tools;

        let runners = state.github.list_runners(&state.cfg.scope).await?;
        self.cleanup_orphaned_provider_instances(&runners).await?;
        self.cleanup_orphaned_github_runners(&state, &runners).await?;
        Ok(())
    }

    /// Local instances whose runner never shows up in GitHub's list linger
    /// when a webhook was missed while the controller was offline. Mark them
    /// for deletion; consolidate finishes the job. Rows still pending either
    /// way are left alone.
    async fn cleanup_orphaned_provider_instances(&self, runners: &[Runner]) -> Result<()> {
        let instances = self.store.list_scope_instances(&self.scope_id).await?;
        let registered: HashSet<&str> = runners.iter().map(|r| r.name.as_str()).collect();

        for instance in instances {
            if matches!(
                instance.status,
                InstanceStatus::PendingCreate | InstanceStatus::PendingDelete
            ) {
                continue;
            }
            if !registered.contains(instance.name.as_str()) {
                tracing::warn!(
                    instance = %instance.name,
                    "no github runner for instance, marking for deletion"
                );
                self.store
                    .update_instance(
                        &instance.id,
                        UpdateInstanceParams {
                            status: Some(InstanceStatus::PendingDelete),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Offline runners carrying one of our pool labels are leftovers of
    /// instances deleted out of band, or instances that stopped without
    /// deregistering. Remove the former from GitHub; start the latter again.
    async fn cleanup_orphaned_github_runners(
        &self,
        state: &ManagerState,
        runners: &[Runner],
    ) -> Result<()> {
        for runner in runners.iter().filter(|r| r.status == "offline") {
            let Some(pool_id) = pool_id_from_labels(&runner.labels) else {
                // Not a runner we manage.
                continue;
            };
            let pool = match self.store.get_pool(&self.scope_id, pool_id).await {
                Ok(pool) => pool,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };

            match self
                .store
                .get_pool_instance_by_name(&pool.id, &runner.name)
                .await
            {
                Err(Error::NotFound(_)) => {
                    // No local record; a previous forceful removal may have
                    // failed halfway.
                    tracing::warn!(runner = %runner.name, "removing orphaned github runner");
                    state.github.remove_runner(&state.cfg.scope, runner.id).await?;
                }
                Err(err) => return Err(err),
                Ok(instance) => match instance.status {
                    // Consolidate will finish these.
                    InstanceStatus::PendingDelete => continue,
                    InstanceStatus::Running => {
                        let provider = self.provider_for(&pool)?;
                        if let Some(provider_id) = instance.provider_id.as_deref() {
                            tracing::info!(
                                instance = %instance.name,
                                "instance up but runner offline, starting it"
                            );
                            provider.start(provider_id).await?;
                        }
                    }
                    _ => continue,
                },
            }
        }
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, done: oneshot::Sender<()>) {
        tracing::info!(scope = %self.scope_id, "starting reconciliation loop");

        let mut consolidate_tick = tokio::time::interval(CONSOLIDATE_INTERVAL);
        consolidate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Tools were fetched during startup; the first refresh is due a full
        // period later. Two independent timers so a long consolidate never
        // starves the refresh and vice versa.
        let mut tools_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + TOOLS_REFRESH_INTERVAL,
            TOOLS_REFRESH_INTERVAL,
        );
        tools_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = consolidate_tick.tick() => self.consolidate().await,
                _ = tools_tick.tick() => {
                    if let Err(error) = self.refresh_tools().await {
                        tracing::error!(scope = %self.scope_id, %error, "failed to refresh tools cache");
                    }
                }
                _ = self.quit.cancelled() => break,
            }
        }

        tracing::info!(scope = %self.scope_id, "reconciliation loop exited");
        let _ = done.send(());
    }

    async fn refresh_tools(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let tools = state.github.list_runner_downloads(&state.cfg.scope).await?;
        state.tools = tools;
        Ok(())
    }

    /// One reconciliation pass, run to completion under the scope mutex.
    /// Per-instance failures are logged and retried on a later tick.
    #[instrument(skip(self), fields(scope = %self.scope_id))]
    pub(crate) async fn consolidate(&self) {
        let state = self.state.lock().await;
        self.delete_pending_instances().await;
        self.add_pending_instances(&state).await;
        self.ensure_min_idle_runners().await;
    }

    async fn delete_pending_instances(&self) {
        let instances = match self.store.list_scope_instances(&self.scope_id).await {
            Ok(instances) => instances,
            Err(error) => {
                tracing::error!(%error, "failed to list instances");
                return;
            }
        };

        for instance in instances
            .into_iter()
            .filter(|i| i.status == InstanceStatus::PendingDelete)
        {
            if let Err(error) = self.delete_instance_from_provider(&instance).await {
                tracing::error!(instance = %instance.name, %error, "failed to delete instance");
            }
        }
    }

    async fn delete_instance_from_provider(&self, instance: &Instance) -> Result<()> {
        let pool = self.store.get_pool(&self.scope_id, &instance.pool_id).await?;
        let provider = self.provider_for(&pool)?;

        // Rows that never reached the provider have no provider id.
        if let Some(provider_id) = instance.provider_id.as_deref() {
            match provider.delete_instance(provider_id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.store.delete_instance(&pool.id, &instance.name).await
    }

    async fn add_pending_instances(&self, state: &ManagerState) {
        let instances = match self.store.list_scope_instances(&self.scope_id).await {
            Ok(instances) => instances,
            Err(error) => {
                tracing::error!(%error, "failed to list instances");
                return;
            }
        };

        let pending: Vec<Instance> = instances
            .into_iter()
            .filter(|i| i.status == InstanceStatus::PendingCreate)
            .collect();
        if pending.is_empty() {
            return;
        }

        let results = stream::iter(pending.into_iter().map(|instance| async move {
            let name = instance.name.clone();
            let result = self.provision(state, &instance).await;
            (name, result)
        }))
        .buffer_unordered(PROVISION_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        for (name, result) in results {
            if let Err(error) = result {
                tracing::error!(instance = %name, %error, "failed to provision instance");
            }
        }
    }

    /// Creation pipeline: registration token, signed callback token, provider
    /// call, store update. A failed step leaves the row in pending_create for
    /// the next tick, except a fatal provider error which parks it in error.
    #[instrument(skip(self, state, instance), fields(scope = %self.scope_id, instance = %instance.name))]
    async fn provision(&self, state: &ManagerState, instance: &Instance) -> Result<()> {
        let pool = self.store.get_pool(&self.scope_id, &instance.pool_id).await?;
        let provider = self.provider_for(&pool)?;

        let mut labels = pool.tags.clone();
        labels.push(pool_label(&pool.id));
        labels.push(controller_label(&self.controller.id));

        let registration_token = state
            .github
            .create_registration_token(&state.cfg.scope)
            .await?;
        let instance_token = self.token_issuer.issue(instance, &state.cfg.scope)?;

        let bootstrap = BootstrapArgs {
            name: instance.name.clone(),
            tools: state.tools.clone(),
            scope_url: github::scope_url(&state.cfg.scope),
            registration_token: registration_token.token,
            callback_url: instance.callback_url.clone(),
            instance_token,
            os_type: pool.os_type,
            os_arch: pool.os_arch,
            flavor: pool.flavor.clone(),
            image: pool.image.clone(),
            labels,
        };

        let created = match provider.create_instance(bootstrap).await {
            Ok(created) => created,
            Err(err @ Error::Fatal(_)) => {
                if let Err(update_err) = self
                    .store
                    .update_instance(
                        &instance.id,
                        UpdateInstanceParams {
                            status: Some(InstanceStatus::Error),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    tracing::error!(error = %update_err, "failed to mark instance as errored");
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.store
            .update_instance(
                &instance.id,
                UpdateInstanceParams {
                    provider_id: Some(created.provider_id),
                    os_name: created.os_name,
                    os_version: created.os_version,
                    addresses: (!created.addresses.is_empty()).then_some(created.addresses),
                    status: Some(created.status),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn ensure_min_idle_runners(&self) {
        let pools = match self.store.list_pools(&self.scope_id).await {
            Ok(pools) => pools,
            Err(error) => {
                tracing::error!(%error, "failed to list pools");
                return;
            }
        };

        for pool in pools {
            if !pool.enabled {
                tracing::debug!(pool = %pool.id, "pool is disabled, skipping");
                continue;
            }
            let existing = match self.store.list_instances(&pool.id).await {
                Ok(existing) => existing,
                Err(error) => {
                    tracing::error!(pool = %pool.id, %error, "failed to list pool instances");
                    continue;
                }
            };
            if existing.len() >= pool.max_runners as usize {
                tracing::debug!(
                    pool = %pool.id,
                    max_runners = pool.max_runners,
                    "max runners reached, skipping idle top-up"
                );
                continue;
            }

            let idle_or_pending = existing
                .iter()
                .filter(|i| i.runner_status != RunnerStatus::Active)
                .count();
            let headroom = pool.max_runners as usize - existing.len();
            let required = (pool.min_idle_runners as usize)
                .saturating_sub(idle_or_pending)
                .min(headroom);

            if required > 0 {
                tracing::info!(
                    pool = %pool.id,
                    required,
                    idle_or_pending,
                    "topping up idle runners"
                );
            }
            for _ in 0..required {
                if let Err(error) = self.add_runner(&pool).await {
                    tracing::error!(pool = %pool.id, %error, "failed to add idle runner");
                }
            }
        }
    }

    /// Creates the store row only; the next consolidate tick provisions it.
    async fn add_runner(&self, pool: &Pool) -> Result<()> {
        let name = generate_instance_name(&self.controller.runner_prefix);
        self.store
            .create_instance(
                &pool.id,
                CreateInstanceParams {
                    name,
                    status: InstanceStatus::PendingCreate,
                    runner_status: RunnerStatus::Pending,
                    os_type: pool.os_type,
                    os_arch: pool.os_arch,
                    callback_url: self.controller.callback_url.clone(),
                },
            )
            .await?;
        Ok(())
    }

    /// Webhook entry point. Contends for the scope mutex with the
    /// reconciliation loop; errors propagate so GitHub retries delivery.
    #[instrument(skip(self, event), fields(scope = %self.scope_id, action = %event.action))]
    pub async fn handle_workflow_job(&self, event: WorkflowJobEvent) -> Result<()> {
        let state = self.state.lock().await;
        if !state.cfg.scope.matches_event(&event) {
            return Err(Error::bad_request("event does not belong to this scope"));
        }

        match event.action.as_str() {
            "queued" => self.acquire_new_instance(&event).await?,
            "in_progress" => {
                let Some(runner_name) = runner_name(&event) else {
                    return Ok(());
                };
                self.set_runner_status(runner_name, RunnerStatus::Active)
                    .await?;
            }
            "completed" => {
                // Jobs that never got assigned carry no runner name.
                let Some(runner_name) = runner_name(&event) else {
                    tracing::debug!("no runner was assigned, skipping");
                    return Ok(());
                };
                self.set_instance_status(runner_name, InstanceStatus::PendingDelete)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// A queued job books capacity: pick the pool serving the requested
    /// labels and create a pending row, respecting the pool ceiling.
    async fn acquire_new_instance(&self, event: &WorkflowJobEvent) -> Result<()> {
        let requested = &event.workflow_job.labels;
        if requested.is_empty() {
            return Ok(());
        }

        let pool = match self.store.find_pool_by_tags(&self.scope_id, requested).await {
            Ok(pool) => pool,
            Err(Error::NotFound(_)) => {
                tracing::debug!(labels = ?requested, "no pool serves the requested labels");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if !pool.enabled {
            tracing::info!(pool = %pool.id, "selected pool is disabled");
            return Ok(());
        }

        let existing = self.store.list_instances(&pool.id).await?;
        if existing.len() >= pool.max_runners as usize {
            tracing::info!(
                pool = %pool.id,
                max_runners = pool.max_runners,
                "max runners reached, not booking capacity"
            );
            return Ok(());
        }

        self.add_runner(&pool).await
    }

    async fn set_runner_status(&self, runner_name: &str, status: RunnerStatus) -> Result<()> {
        let Some(instance) = self.instance_for_runner(runner_name).await? else {
            return Ok(());
        };
        tracing::info!(instance = %instance.name, %status, "updating runner status");
        self.store
            .update_instance(
                &instance.id,
                UpdateInstanceParams {
                    runner_status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn set_instance_status(&self, runner_name: &str, status: InstanceStatus) -> Result<()> {
        let Some(instance) = self.instance_for_runner(runner_name).await? else {
            return Ok(());
        };
        tracing::info!(instance = %instance.name, %status, "updating instance status");
        self.store
            .update_instance(
                &instance.id,
                UpdateInstanceParams {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// GitHub also delivers events for runners this controller does not own;
    /// those resolve to `None`.
    async fn instance_for_runner(&self, runner_name: &str) -> Result<Option<Instance>> {
        match self.store.get_instance_by_name(runner_name).await {
            Ok(instance) => Ok(Some(instance)),
            Err(Error::NotFound(_)) => {
                tracing::debug!(runner = %runner_name, "event for a runner we do not manage");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn provider_for(&self, pool: &Pool) -> Result<&Arc<dyn Provider>> {
        self.providers.get(&pool.provider_name).ok_or_else(|| {
            Error::fatal(format!(
                "unknown provider {} for pool {}",
                pool.provider_name, pool.id
            ))
        })
    }
}

fn runner_name(event: &WorkflowJobEvent) -> Option<&str> {
    event
        .workflow_job
        .runner_name
        .as_deref()
        .filter(|name| !name.is_empty())
}

fn generate_instance_name(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .filter(|c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(12)
        .map(char::from)
        .collect();
    format!("{prefix}-{suffix}")
}
