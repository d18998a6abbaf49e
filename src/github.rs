use crate::config::ScopeConfig;
use crate::errors::{Error, Result};
use crate::params::Scope;
use chrono::{DateTime, Utc};
use octocrab::models::{RunnerId, actions::SelfHostedRunner};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

pub const GITHUB_BASE_URL: &str = "https://github.com";

/// URL instances register against: the repository page or the organization
/// page, depending on the scope kind.
pub fn scope_url(scope: &Scope) -> String {
    format!("{}/{}", GITHUB_BASE_URL, scope.path())
}

/// A self-hosted runner as GitHub reports it, reduced to what the engine
/// consumes.
#[derive(Clone, Debug)]
pub struct Runner {
    pub id: u64,
    pub name: String,
    /// `online` or `offline`.
    pub status: String,
    pub labels: Vec<String>,
}

/// One entry of the runner tools manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerApplicationDownload {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
}

/// Short-lived token a runner presents when registering with GitHub.
#[derive(Clone, Debug, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The slice of the GitHub API the reconciliation engine consumes.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GithubClient: Send + Sync {
    async fn list_runners(&self, scope: &Scope) -> Result<Vec<Runner>>;

    async fn list_runner_downloads(&self, scope: &Scope) -> Result<Vec<RunnerApplicationDownload>>;

    async fn create_registration_token(&self, scope: &Scope) -> Result<RegistrationToken>;

    /// Idempotent: removing a runner GitHub no longer knows about succeeds.
    async fn remove_runner(&self, scope: &Scope, runner_id: u64) -> Result<()>;
}

/// Builds a [`GithubClient`] for a scope. The registry uses this to swap a
/// manager's client when the scope credential changes.
#[cfg_attr(test, mockall::automock)]
pub trait GithubClientFactory: Send + Sync {
    fn create(&self, cfg: &ScopeConfig) -> Result<Arc<dyn GithubClient>>;
}

pub struct OctocrabFactory;

impl GithubClientFactory for OctocrabFactory {
    fn create(&self, cfg: &ScopeConfig) -> Result<Arc<dyn GithubClient>> {
        Ok(Arc::new(OctocrabGithub::new(cfg.token.clone())))
    }
}

/// [`GithubClient`] backed by octocrab, one REST client per call so a
/// refreshed credential takes effect immediately.
pub struct OctocrabGithub {
    token: String,
}

impl OctocrabGithub {
    pub fn new(token: String) -> Self {
        Self { token }
    }

    fn client(&self) -> Result<Octocrab> {
        octocrab::OctocrabBuilder::default()
            .personal_token(self.token.clone())
            .build()
            .map_err(|e| Error::fatal(format!("building github client: {e}")))
    }
}

#[async_trait::async_trait]
impl GithubClient for OctocrabGithub {
    #[instrument(skip(self), fields(scope = %scope))]
    async fn list_runners(&self, scope: &Scope) -> Result<Vec<Runner>> {
        let octocrab = self.client()?;
        let mut page = match scope {
            Scope::Repository { owner, name } => octocrab
                .actions()
                .list_repo_self_hosted_runners(owner, name)
                .send()
                .await
                .map_err(|e| classify("listing repo runners", e))?,
            Scope::Organization { name } => octocrab
                .actions()
                .list_org_self_hosted_runners(name)
                .send()
                .await
                .map_err(|e| classify("listing org runners", e))?,
        };

        let mut runners = vec![];
        loop {
            for runner in &page.items {
                runners.push(into_runner(runner));
            }

            page = match octocrab
                .get_page(&page.next)
                .await
                .map_err(|e| classify("fetching runner page", e))?
            {
                Some(next_page) => next_page,
                None => break,
            };
        }

        Ok(runners)
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn list_runner_downloads(&self, scope: &Scope) -> Result<Vec<RunnerApplicationDownload>> {
        let octocrab = self.client()?;
        let route = match scope {
            Scope::Repository { owner, name } => {
                format!("/repos/{owner}/{name}/actions/runners/downloads")
            }
            Scope::Organization { name } => format!("/orgs/{name}/actions/runners/downloads"),
        };

        octocrab
            .get(route, None::<&()>)
            .await
            .map_err(|e| classify("fetching runner downloads", e))
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn create_registration_token(&self, scope: &Scope) -> Result<RegistrationToken> {
        let octocrab = self.client()?;
        let route = match scope {
            Scope::Repository { owner, name } => {
                format!("/repos/{owner}/{name}/actions/runners/registration-token")
            }
            Scope::Organization { name } => {
                format!("/orgs/{name}/actions/runners/registration-token")
            }
        };

        octocrab
            .post(route, None::<&()>)
            .await
            .map_err(|e| classify("creating registration token", e))
    }

    #[instrument(skip(self), fields(scope = %scope, runner_id))]
    async fn remove_runner(&self, scope: &Scope, runner_id: u64) -> Result<()> {
        let octocrab = self.client()?;
        let result = match scope {
            Scope::Repository { owner, name } => {
                octocrab
                    .actions()
                    .delete_repo_runner(owner, name, RunnerId(runner_id))
                    .await
            }
            Scope::Organization { name } => {
                octocrab
                    .actions()
                    .delete_org_runner(name, RunnerId(runner_id))
                    .await
            }
        };

        match result {
            Ok(()) => {
                tracing::info!("removed github runner");
                Ok(())
            }
            Err(e) => match classify("removing runner", e) {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

fn into_runner(runner: &SelfHostedRunner) -> Runner {
    Runner {
        id: runner.id.0,
        name: runner.name.clone(),
        status: runner.status.clone(),
        labels: runner.labels.iter().map(|l| l.name.clone()).collect(),
    }
}

/// Map octocrab failures onto the crate error kinds so the pool manager can
/// tell retryable rate limits from credential problems.
fn classify(context: &str, err: octocrab::Error) -> Error {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            let msg = format!("{context}: {err}");
            match status {
                404 => Error::NotFound(msg),
                401 | 403 => Error::Unauthorized(msg),
                409 => Error::Conflict(msg),
                429 | 500..=599 => Error::Transient(msg),
                _ => Error::Fatal(msg),
            }
        }
        _ => Error::Transient(format!("{context}: {err}")),
    }
}
