mod auth;
mod cloud_config;
mod config;
mod errors;
mod github;
mod params;
mod pool;
mod providers;
mod store;
mod webhook;

use crate::auth::{InstanceTokenIssuer, JwtTokenAuthority};
use crate::config::Config;
use crate::github::OctocrabFactory;
use crate::params::ControllerInfo;
use crate::pool::PoolManagerRegistry;
use crate::providers::{OpenStackProvider, Provider};
use crate::store::{MemoryStore, Store};
use crate::webhook::AppState;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    let _guard = init_tracing(&config)?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for provider_config in &config.providers {
        let provider = OpenStackProvider::new(provider_config.openstack.clone())
            .await
            .with_context(|| format!("initializing provider {}", provider_config.name))?;
        providers.insert(provider_config.name.clone(), Arc::new(provider));
    }

    // Pools are declared in the config file; the store is the engine's view.
    for scope in &config.scopes {
        let scope_id = scope.scope.path();
        for pool in &scope.pools {
            store
                .create_pool(pool.materialize(&scope_id))
                .await
                .with_context(|| format!("seeding pools for scope {scope_id}"))?;
        }
    }

    let token_authority = Arc::new(JwtTokenAuthority::new(config.controller.jwt_secret.clone()));
    let shutdown = CancellationToken::new();
    let registry = Arc::new(PoolManagerRegistry::new(
        ControllerInfo {
            id: config.controller.id.clone(),
            callback_url: config.controller.callback_url.clone(),
            runner_prefix: config.controller.runner_prefix.clone(),
        },
        Arc::clone(&store),
        providers,
        Arc::clone(&token_authority) as Arc<dyn InstanceTokenIssuer>,
        Arc::new(OctocrabFactory),
        shutdown.clone(),
    ));

    for scope in config.scopes.clone() {
        let path = scope.scope.path();
        registry
            .start_scope(scope)
            .await
            .with_context(|| format!("starting pool manager for scope {path}"))?;
        tracing::info!(scope = %path, "pool manager started");
    }

    let app = webhook::router(AppState {
        registry: Arc::clone(&registry),
        store,
        token_authority,
    });

    let listener = tokio::net::TcpListener::bind(&config.controller.bind_address)
        .await
        .with_context(|| format!("binding {}", config.controller.bind_address))?;
    tracing::info!(address = %config.controller.bind_address, "listening for webhooks");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    shutdown.cancel();
    registry.stop_all().await;
    Ok(())
}

fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env();
    match &config.controller.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}
