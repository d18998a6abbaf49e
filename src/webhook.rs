use crate::auth::JwtTokenAuthority;
use crate::errors::{Error, Result};
use crate::params::{
    InstanceStatus, InstanceStatusUpdate, RunnerStatus, UpdateInstanceParams, WorkflowJobEvent,
};
use crate::pool::PoolManagerRegistry;
use crate::store::Store;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::instrument;

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PoolManagerRegistry>,
    pub store: Arc<dyn Store>,
    pub token_authority: Arc<JwtTokenAuthority>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks", post(workflow_job))
        .route("/api/v1/callbacks/status", post(instance_callback))
        .with_state(state)
}

/// Workflow-job deliveries from GitHub. The event is routed to its scope's
/// manager first; only that manager knows the secret to verify the delivery
/// signature with.
#[instrument(skip_all)]
async fn workflow_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let event: WorkflowJobEvent = serde_json::from_slice(&body)
        .map_err(|e| Error::bad_request(format!("malformed webhook payload: {e}")))?;

    let manager = state.registry.route(&event).await?;
    let secret = manager.webhook_secret().await;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::unauthorized("missing delivery signature"))?;
    verify_signature(&secret, &body, signature)?;

    manager.handle_workflow_job(event).await?;
    Ok(StatusCode::OK)
}

/// Instances report in after bootstrapping, authenticated by the token baked
/// into their user data. The runner is idle from here until a webhook says
/// otherwise.
#[instrument(skip_all)]
async fn instance_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<InstanceStatusUpdate>,
) -> Result<StatusCode> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::unauthorized("missing instance token"))?;
    let claims = state.token_authority.verify(token)?;

    let instance = state.store.get_instance_by_name(&claims.sub).await?;
    tracing::info!(
        instance = %instance.name,
        status = %update.status.unwrap_or(RunnerStatus::Idle),
        message = update.message.as_deref().unwrap_or(""),
        "instance called home"
    );
    // An instance that calls home is up: advance the infrastructure state
    // out of the creation path. Rows already marked for deletion or errored
    // keep their state.
    let status = instance
        .status
        .can_transition_to(InstanceStatus::Running)
        .then_some(InstanceStatus::Running);
    state
        .store
        .update_instance(
            &instance.id,
            UpdateInstanceParams {
                status,
                runner_status: Some(update.status.unwrap_or(RunnerStatus::Idle)),
                os_name: update.os_name,
                os_version: update.os_version,
                addresses: update.addresses,
                ..Default::default()
            },
        )
        .await?;
    Ok(StatusCode::OK)
}

/// HMAC-SHA256 of the raw body, hex encoded, `sha256=` prefixed.
pub(crate) fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<()> {
    let hex_digest = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| Error::unauthorized("malformed delivery signature"))?;
    let digest = hex::decode(hex_digest)
        .map_err(|_| Error::unauthorized("malformed delivery signature"))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::fatal(format!("building webhook hmac: {e}")))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| Error::unauthorized("delivery signature mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{InstanceTokenIssuer, MockInstanceTokenIssuer};
    use crate::github::MockGithubClientFactory;
    use crate::params::{
        ControllerInfo, CreateInstanceParams, OSArch, OSType, Pool, Scope,
    };
    use crate::pool::PoolManagerRegistry;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn app_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(PoolManagerRegistry::new(
            ControllerInfo {
                id: "ctrl-1".into(),
                callback_url: "https://controller/api/v1/callbacks/status".into(),
                runner_prefix: "gha".into(),
            },
            Arc::clone(&store),
            HashMap::new(),
            Arc::new(MockInstanceTokenIssuer::new()),
            Arc::new(MockGithubClientFactory::new()),
            CancellationToken::new(),
        ));
        AppState {
            registry,
            store,
            token_authority: Arc::new(JwtTokenAuthority::new("hush".into())),
        }
    }

    async fn seed_creating_instance(state: &AppState, name: &str) -> String {
        state
            .store
            .create_pool(Pool {
                id: "p1".into(),
                scope_id: "acme/widgets".into(),
                provider_name: "openstack".into(),
                min_idle_runners: 0,
                max_runners: 2,
                enabled: true,
                os_arch: OSArch::Amd64,
                os_type: OSType::Linux,
                image: "ubuntu-22.04".into(),
                flavor: "m1.small".into(),
                tags: vec!["linux".into()],
            })
            .await
            .unwrap();
        let instance = state
            .store
            .create_instance(
                "p1",
                CreateInstanceParams {
                    name: name.into(),
                    status: InstanceStatus::PendingCreate,
                    runner_status: RunnerStatus::Pending,
                    os_type: OSType::Linux,
                    os_arch: OSArch::Amd64,
                    callback_url: "https://controller/api/v1/callbacks/status".into(),
                },
            )
            .await
            .unwrap();
        state
            .store
            .update_instance(
                &instance.id,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::Creating),
                    provider_id: Some("srv-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        instance.id
    }

    async fn bearer_headers(state: &AppState, name: &str) -> HeaderMap {
        let instance = state.store.get_instance_by_name(name).await.unwrap();
        let scope = Scope::Repository {
            owner: "acme".into(),
            name: "widgets".into(),
        };
        let token = state.token_authority.issue(&instance, &scope).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn callback_marks_instance_running_and_idle() {
        let state = app_state();
        seed_creating_instance(&state, "gha-abc").await;
        let headers = bearer_headers(&state, "gha-abc").await;

        let update: InstanceStatusUpdate = serde_json::from_value(serde_json::json!({
            "os_name": "ubuntu",
            "os_version": "22.04",
            "message": "runner configured"
        }))
        .unwrap();
        let status = instance_callback(State(state.clone()), headers, Json(update))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let instance = state.store.get_instance_by_name("gha-abc").await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.runner_status, RunnerStatus::Idle);
        assert_eq!(instance.os_name.as_deref(), Some("ubuntu"));
    }

    #[tokio::test]
    async fn callback_does_not_revive_deleting_instance() {
        let state = app_state();
        let id = seed_creating_instance(&state, "gha-abc").await;
        state
            .store
            .update_instance(
                &id,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::PendingDelete),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let headers = bearer_headers(&state, "gha-abc").await;

        let update: InstanceStatusUpdate =
            serde_json::from_value(serde_json::json!({})).unwrap();
        instance_callback(State(state.clone()), headers, Json(update))
            .await
            .unwrap();

        let instance = state.store.get_instance_by_name("gha-abc").await.unwrap();
        assert_eq!(instance.status, InstanceStatus::PendingDelete);
    }

    #[tokio::test]
    async fn callback_rejects_missing_token() {
        let state = app_state();
        let update: InstanceStatusUpdate =
            serde_json::from_value(serde_json::json!({})).unwrap();
        let result = instance_callback(State(state), HeaderMap::new(), Json(update)).await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"action":"queued"}"#;
        let signature = sign("hush", body);
        verify_signature("hush", body, &signature).unwrap();
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = br#"{"action":"queued"}"#;
        let signature = sign("other", body);
        assert!(matches!(
            verify_signature("hush", body, &signature),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn rejects_tampered_body() {
        let signature = sign("hush", br#"{"action":"queued"}"#);
        assert!(matches!(
            verify_signature("hush", br#"{"action":"completed"}"#, &signature),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn rejects_unprefixed_signature() {
        assert!(matches!(
            verify_signature("hush", b"{}", "deadbeef"),
            Err(Error::Unauthorized(_))
        ));
    }
}
