use crate::github::RunnerApplicationDownload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Infrastructure state of an instance. Transitions only move forward, with
/// `error` reachable from the live states and recoverable into
/// `pending_delete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    PendingCreate,
    Creating,
    Running,
    PendingDelete,
    Deleting,
    Deleted,
    Error,
}

impl InstanceStatus {
    /// Legal transitions. Writing the current status back is always allowed,
    /// which keeps field-wise merges idempotent.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (PendingCreate, Creating | Running | Error) => true,
            (Creating, Running | PendingDelete | Error) => true,
            (Running, PendingDelete | Error) => true,
            (PendingDelete, Deleting | Error) => true,
            (Deleting, Deleted | Error) => true,
            (Error, PendingDelete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::PendingCreate => "pending_create",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::PendingDelete => "pending_delete",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Workload state of the runner registered on GitHub. Updated by webhooks
/// and by the instance callback, orthogonal to [`InstanceStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Idle,
    Active,
    Terminated,
    Offline,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerStatus::Pending => "pending",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Active => "active",
            RunnerStatus::Terminated => "terminated",
            RunnerStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OSType {
    Linux,
    Windows,
}

impl OSType {
    /// OS name used by the runner downloads manifest.
    pub fn tools_os(&self) -> &'static str {
        match self {
            OSType::Linux => "linux",
            OSType::Windows => "win",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OSArch {
    Amd64,
    Arm64,
}

impl OSArch {
    /// Architecture name used by the runner downloads manifest.
    pub fn tools_arch(&self) -> &'static str {
        match self {
            OSArch::Amd64 => "x64",
            OSArch::Arm64 => "arm64",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Public,
    Private,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub kind: AddressKind,
}

/// The unit of ownership over pools and instances: a repository or an
/// organization on GitHub. The path doubles as the scope identifier in the
/// store and the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Repository { owner: String, name: String },
    Organization { name: String },
}

impl Scope {
    pub fn path(&self) -> String {
        match self {
            Scope::Repository { owner, name } => format!("{owner}/{name}"),
            Scope::Organization { name } => name.clone(),
        }
    }

    /// Whether a workflow-job event belongs to this scope. Events are routed
    /// by the registry; a mismatch here means the routing went wrong.
    pub fn matches_event(&self, event: &WorkflowJobEvent) -> bool {
        match self {
            Scope::Repository { owner, name } => {
                event.repository.owner.login == *owner && event.repository.name == *name
            }
            Scope::Organization { name } => event
                .organization
                .as_ref()
                .is_some_and(|org| org.login == *name),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Declarative template for instances. Created from configuration, never
/// mutated by the reconciliation engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub scope_id: String,
    pub provider_name: String,
    pub min_idle_runners: u32,
    pub max_runners: u32,
    pub enabled: bool,
    pub os_arch: OSArch,
    pub os_type: OSType,
    pub image: String,
    pub flavor: String,
    pub tags: Vec<String>,
}

impl Pool {
    /// A pool serves a job when its tag set is a superset of the requested
    /// labels. GitHub labels match case-insensitively.
    pub fn matches_labels(&self, requested: &[String]) -> bool {
        requested
            .iter()
            .all(|label| self.tags.iter().any(|tag| tag.eq_ignore_ascii_case(label)))
    }
}

/// The controller's record of one provisioned compute resource and its
/// runner workload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub pool_id: String,
    pub provider_id: Option<String>,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    pub os_type: OSType,
    pub os_arch: OSArch,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub addresses: Vec<Address>,
    pub callback_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct CreateInstanceParams {
    pub name: String,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    pub os_type: OSType,
    pub os_arch: OSArch,
    pub callback_url: String,
}

/// Field-wise merge parameters: only `Some` fields overwrite.
#[derive(Clone, Debug, Default)]
pub struct UpdateInstanceParams {
    pub provider_id: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub addresses: Option<Vec<Address>>,
    pub status: Option<InstanceStatus>,
    pub runner_status: Option<RunnerStatus>,
}

/// What a provider reports after creating or inspecting an instance.
#[derive(Clone, Debug)]
pub struct ProviderInstance {
    pub provider_id: String,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub addresses: Vec<Address>,
    pub status: InstanceStatus,
}

/// Everything a provider needs to boot an instance that can register itself
/// as a runner and call home.
#[derive(Clone, Debug)]
pub struct BootstrapArgs {
    pub name: String,
    pub tools: Vec<RunnerApplicationDownload>,
    pub scope_url: String,
    pub registration_token: String,
    pub callback_url: String,
    pub instance_token: String,
    pub os_type: OSType,
    pub os_arch: OSArch,
    pub flavor: String,
    pub image: String,
    pub labels: Vec<String>,
}

/// Process-wide settings every pool manager needs, passed explicitly at
/// construction.
#[derive(Clone, Debug)]
pub struct ControllerInfo {
    pub id: String,
    pub callback_url: String,
    pub runner_prefix: String,
}

// Inbound webhook payload, the subset of GitHub's workflow_job event the
// engine consumes.

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: String,
    pub workflow_job: WorkflowJob,
    pub repository: Repository,
    #[serde(default)]
    pub organization: Option<Organization>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowJob {
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: Owner,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Organization {
    pub login: String,
}

/// Body of the instance bootstrap callback.
#[derive(Clone, Debug, Deserialize)]
pub struct InstanceStatusUpdate {
    #[serde(default)]
    pub status: Option<RunnerStatus>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<Address>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_legal() {
        use InstanceStatus::*;
        assert!(PendingCreate.can_transition_to(Creating));
        assert!(PendingCreate.can_transition_to(Running));
        assert!(Creating.can_transition_to(Running));
        assert!(Running.can_transition_to(PendingDelete));
        assert!(PendingDelete.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
    }

    #[test]
    fn error_recovery_only_into_pending_delete() {
        use InstanceStatus::*;
        assert!(Error.can_transition_to(PendingDelete));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Creating));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        use InstanceStatus::*;
        assert!(!Running.can_transition_to(Creating));
        assert!(!Running.can_transition_to(PendingCreate));
        assert!(!PendingDelete.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(PendingDelete));
    }

    #[test]
    fn same_state_write_is_idempotent() {
        use InstanceStatus::*;
        for status in [
            PendingCreate,
            Creating,
            Running,
            PendingDelete,
            Deleting,
            Deleted,
            Error,
        ] {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn scope_paths() {
        let repo = Scope::Repository {
            owner: "acme".into(),
            name: "widgets".into(),
        };
        let org = Scope::Organization {
            name: "acme".into(),
        };
        assert_eq!(repo.path(), "acme/widgets");
        assert_eq!(org.path(), "acme");
    }

    #[test]
    fn scope_event_matching() {
        let event: WorkflowJobEvent = serde_json::from_value(serde_json::json!({
            "action": "queued",
            "workflow_job": { "runner_name": null, "labels": ["linux"] },
            "repository": { "name": "widgets", "owner": { "login": "acme" } },
            "organization": { "login": "acme" }
        }))
        .unwrap();

        let repo = Scope::Repository {
            owner: "acme".into(),
            name: "widgets".into(),
        };
        let other = Scope::Repository {
            owner: "acme".into(),
            name: "gadgets".into(),
        };
        let org = Scope::Organization {
            name: "acme".into(),
        };
        assert!(repo.matches_event(&event));
        assert!(!other.matches_event(&event));
        assert!(org.matches_event(&event));
    }

    #[test]
    fn pool_label_matching_is_superset_and_case_insensitive() {
        let pool = Pool {
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
            tags: vec!["Linux".into(), "x64".into(), "gpu".into()],
        };
        assert!(pool.matches_labels(&["linux".into(), "GPU".into()]));
        assert!(pool.matches_labels(&[]));
        assert!(!pool.matches_labels(&["linux".into(), "windows".into()]));
    }
}
