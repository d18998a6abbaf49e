use crate::cloud_config;
use crate::errors::{Error, Result};
use crate::params::{BootstrapArgs, InstanceStatus, ProviderInstance};
use base64::prelude::*;
use chrono::TimeDelta;
use openstack_sdk::{
    AsyncOpenStack,
    api::{
        self, QueryAsync,
        compute::v2::server::{create_20, delete, list_detailed, os_start, os_stop},
    },
    auth::AuthState,
    config::ConfigFile,
    types::ServiceType,
};
use openstack_types::compute::v2::server::response::{
    create::ServerResponse as CreateServerResponse,
    list_detailed::ServerResponse as ListServerResponse,
};
use serde::Deserialize;
use std::borrow::Cow;
use thiserror::Error as ThisError;
use tokio::sync::Mutex;
use tracing::instrument;

/// Settings for one named OpenStack backend.
#[derive(Clone, Debug, Deserialize)]
pub struct OpenStackConfig {
    pub cloud: String,
    pub network: String,
    pub key_name: String,
}

#[derive(Debug, ThisError)]
pub enum OpenStackError {
    #[error("openstack profile not found: {0}")]
    MissingProfile(String),

    #[error("failed to build network request")]
    BuildNetworkRequest(#[from] create_20::NetworksBuilderError),

    #[error(transparent)]
    Serialization(#[from] serde_yaml::Error),

    #[error("failed to build server request")]
    BuildServerRequest(#[from] create_20::ServerBuilderError),

    #[error("failed to build request")]
    BuildRequest(#[from] create_20::RequestBuilderError),

    #[error("failed to build server list request")]
    BuildServerListRequest(#[from] list_detailed::RequestBuilderError),

    #[error("failed to build server deletion request")]
    BuildServerDeletionRequest(#[from] delete::RequestBuilderError),

    #[error("failed to build server start request")]
    BuildServerStartRequest(#[from] os_start::RequestBuilderError),

    #[error("failed to build server stop request")]
    BuildServerStopRequest(#[from] os_stop::RequestBuilderError),

    #[error(transparent)]
    Api(#[from] openstack_sdk::api::ApiError<openstack_sdk::RestError>),

    #[error(transparent)]
    OpenStack(#[from] openstack_sdk::OpenStackError),

    #[error(transparent)]
    Config(#[from] openstack_sdk::config::ConfigError),
}

impl From<OpenStackError> for Error {
    fn from(err: OpenStackError) -> Self {
        match err {
            OpenStackError::MissingProfile(_)
            | OpenStackError::Serialization(_)
            | OpenStackError::Config(_) => Error::fatal(err.to_string()),
            OpenStackError::BuildNetworkRequest(_)
            | OpenStackError::BuildServerRequest(_)
            | OpenStackError::BuildRequest(_)
            | OpenStackError::BuildServerListRequest(_)
            | OpenStackError::BuildServerDeletionRequest(_)
            | OpenStackError::BuildServerStartRequest(_)
            | OpenStackError::BuildServerStopRequest(_) => Error::fatal(err.to_string()),
            OpenStackError::Api(_) | OpenStackError::OpenStack(_) => {
                Error::transient(err.to_string())
            }
        }
    }
}

/// Compute-backed [`Provider`](super::Provider) implementation. One
/// authenticated session per backend, re-authorized when the token is close
/// to expiry.
pub struct OpenStackProvider {
    config: OpenStackConfig,
    session: Mutex<AsyncOpenStack>,
}

impl OpenStackProvider {
    #[instrument(skip(config), fields(cloud = %config.cloud))]
    pub async fn new(config: OpenStackConfig) -> Result<Self> {
        let profile = ConfigFile::new()
            .map_err(OpenStackError::from)?
            .get_cloud_config(&config.cloud)
            .map_err(OpenStackError::from)?
            .ok_or_else(|| OpenStackError::MissingProfile(config.cloud.clone()))?;

        let mut session = AsyncOpenStack::new(&profile)
            .await
            .map_err(OpenStackError::from)?;
        session
            .discover_service_endpoint(&ServiceType::Compute)
            .await
            .map_err(OpenStackError::from)?;

        Ok(Self {
            config,
            session: Mutex::new(session),
        })
    }

    async fn refresh_session(
        &self,
        session: &mut AsyncOpenStack,
    ) -> std::result::Result<(), OpenStackError> {
        match session.get_auth_state(Some(TimeDelta::seconds(10))) {
            Some(AuthState::Expired) | Some(AuthState::AboutToExpire) => {
                session.authorize(None, false, true).await?;
                session
                    .discover_service_endpoint(&ServiceType::Compute)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn list_servers(
        &self,
        session: &AsyncOpenStack,
    ) -> std::result::Result<Vec<ListServerResponse>, OpenStackError> {
        let ep = list_detailed::Request::builder().build()?;
        let servers: Vec<ListServerResponse> = ep.query_async(session).await?;
        Ok(servers)
    }

    async fn find_server(&self, provider_id: &str) -> Result<Option<ListServerResponse>> {
        let mut session = self.session.lock().await;
        self.refresh_session(&mut session)
            .await
            .map_err(Error::from)?;
        let servers = self.list_servers(&session).await.map_err(Error::from)?;
        Ok(servers.into_iter().find(|s| s.id == provider_id))
    }
}

#[async_trait::async_trait]
impl super::Provider for OpenStackProvider {
    #[instrument(
        skip(self, bootstrap),
        fields(
            cloud = %self.config.cloud,
            name = %bootstrap.name,
            image = %bootstrap.image,
            flavor = %bootstrap.flavor,
        )
    )]
    async fn create_instance(&self, bootstrap: BootstrapArgs) -> Result<ProviderInstance> {
        let user_data = cloud_config::Data::from_bootstrap(&bootstrap)?
            .to_user_data()
            .map_err(OpenStackError::from)?;

        let mut session = self.session.lock().await;
        self.refresh_session(&mut session)
            .await
            .map_err(Error::from)?;

        let ep = create_20::Request::builder()
            .server(
                create_20::ServerBuilder::default()
                    .name(&bootstrap.name)
                    .image_ref(&bootstrap.image)
                    .flavor_ref(&bootstrap.flavor)
                    .networks(vec![
                        create_20::NetworksBuilder::default()
                            .uuid(&self.config.network)
                            .build()
                            .map_err(OpenStackError::from)?,
                    ])
                    .key_name(&self.config.key_name)
                    .user_data(Some(Cow::Owned(BASE64_STANDARD.encode(user_data))))
                    .build()
                    .map_err(OpenStackError::from)?,
            )
            .build()
            .map_err(OpenStackError::from)?;

        let created: CreateServerResponse = ep
            .query_async(&*session)
            .await
            .map_err(OpenStackError::from)?;

        tracing::info!(server_id = %created.id, "created server");

        // The server is still building at this point; the instance callback
        // and drift detection fill in addresses and OS details later.
        Ok(ProviderInstance {
            provider_id: created.id,
            os_name: None,
            os_version: None,
            addresses: vec![],
            status: InstanceStatus::Creating,
        })
    }

    #[instrument(skip(self), fields(cloud = %self.config.cloud, provider_id))]
    async fn delete_instance(&self, provider_id: &str) -> Result<()> {
        if self.find_server(provider_id).await?.is_none() {
            tracing::debug!("server already gone");
            return Ok(());
        }

        let session = self.session.lock().await;
        let ep = delete::Request::builder()
            .id(provider_id)
            .build()
            .map_err(OpenStackError::from)?;
        api::ignore(ep)
            .query_async(&*session)
            .await
            .map_err(OpenStackError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(cloud = %self.config.cloud, provider_id))]
    async fn start(&self, provider_id: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        self.refresh_session(&mut session)
            .await
            .map_err(Error::from)?;
        let ep = os_start::Request::builder()
            .id(provider_id)
            .build()
            .map_err(OpenStackError::from)?;
        api::ignore(ep)
            .query_async(&*session)
            .await
            .map_err(OpenStackError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(cloud = %self.config.cloud, provider_id))]
    async fn stop(&self, provider_id: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        self.refresh_session(&mut session)
            .await
            .map_err(Error::from)?;
        let ep = os_stop::Request::builder()
            .id(provider_id)
            .build()
            .map_err(OpenStackError::from)?;
        api::ignore(ep)
            .query_async(&*session)
            .await
            .map_err(OpenStackError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(cloud = %self.config.cloud, provider_id))]
    async fn get_instance(&self, provider_id: &str) -> Result<ProviderInstance> {
        let server = self
            .find_server(provider_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("server {provider_id}")))?;
        Ok(ProviderInstance {
            provider_id: server.id,
            os_name: None,
            os_version: None,
            addresses: vec![],
            status: map_server_status(server.status.as_deref()),
        })
    }
}

fn map_server_status(status: Option<&str>) -> InstanceStatus {
    match status {
        Some("BUILD") | Some("REBUILD") => InstanceStatus::Creating,
        Some("ERROR") => InstanceStatus::Error,
        Some("DELETED") | Some("SOFT_DELETED") => InstanceStatus::Deleted,
        _ => InstanceStatus::Running,
    }
}
