mod openstack;

pub use openstack::{OpenStackConfig, OpenStackProvider};

use crate::errors::Result;
use crate::params::{BootstrapArgs, ProviderInstance};

/// Capability surface an infrastructure backend must expose to the pool
/// managers. Cancellation is carried by dropping the returned future.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Provision the infrastructure for one runner. Returns the
    /// provider-assigned id plus whatever OS metadata and addresses the
    /// backend reports at creation time.
    async fn create_instance(&self, bootstrap: BootstrapArgs) -> Result<ProviderInstance>;

    /// Best-effort idempotent delete; an already-gone instance is success.
    async fn delete_instance(&self, provider_id: &str) -> Result<()>;

    /// Start a stopped instance, used in drift recovery.
    async fn start(&self, provider_id: &str) -> Result<()>;

    async fn stop(&self, provider_id: &str) -> Result<()>;

    /// `NotFound` when the backend no longer knows the id.
    async fn get_instance(&self, provider_id: &str) -> Result<ProviderInstance>;
}
