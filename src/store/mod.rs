mod memory;

pub use memory::MemoryStore;

use crate::errors::Result;
use crate::params::{CreateInstanceParams, Instance, Pool, UpdateInstanceParams};

/// Durable record of pools and instances. Implementations must be internally
/// thread-safe; reads are repeatable but callers re-read rather than assume a
/// list reflects a write issued elsewhere.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn create_pool(&self, pool: Pool) -> Result<Pool>;

    async fn list_pools(&self, scope_id: &str) -> Result<Vec<Pool>>;

    async fn get_pool(&self, scope_id: &str, pool_id: &str) -> Result<Pool>;

    /// The pool whose tag set is a superset of the requested labels; ties
    /// break on the lowest pool id.
    async fn find_pool_by_tags(&self, scope_id: &str, tags: &[String]) -> Result<Pool>;

    async fn list_instances(&self, pool_id: &str) -> Result<Vec<Instance>>;

    async fn list_scope_instances(&self, scope_id: &str) -> Result<Vec<Instance>>;

    async fn get_instance_by_name(&self, name: &str) -> Result<Instance>;

    async fn get_pool_instance_by_name(&self, pool_id: &str, name: &str) -> Result<Instance>;

    async fn create_instance(&self, pool_id: &str, params: CreateInstanceParams)
    -> Result<Instance>;

    /// Field-wise merge; only `Some` fields overwrite. Status changes must
    /// follow the instance state machine.
    async fn update_instance(&self, id: &str, params: UpdateInstanceParams) -> Result<Instance>;

    /// Removing an absent instance is success.
    async fn delete_instance(&self, pool_id: &str, name: &str) -> Result<()>;
}
