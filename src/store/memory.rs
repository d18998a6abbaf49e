use super::Store;
use crate::errors::{Error, Result};
use crate::params::{CreateInstanceParams, Instance, Pool, UpdateInstanceParams};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory [`Store`]. Pools and instances live for the lifetime of the
/// process; pool ids are deterministic (seeded from config) so runner labels
/// survive a restart even though instance rows do not.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    pools: HashMap<String, Pool>,
    instances: HashMap<String, Instance>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        let mut state = self.state.write().await;
        if state.pools.contains_key(&pool.id) {
            return Err(Error::conflict(format!("pool {} already exists", pool.id)));
        }
        state.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool)
    }

    async fn list_pools(&self, scope_id: &str) -> Result<Vec<Pool>> {
        let state = self.state.read().await;
        let mut pools: Vec<Pool> = state
            .pools
            .values()
            .filter(|p| p.scope_id == scope_id)
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pools)
    }

    async fn get_pool(&self, scope_id: &str, pool_id: &str) -> Result<Pool> {
        let state = self.state.read().await;
        state
            .pools
            .get(pool_id)
            .filter(|p| p.scope_id == scope_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {pool_id}")))
    }

    async fn find_pool_by_tags(&self, scope_id: &str, tags: &[String]) -> Result<Pool> {
        let state = self.state.read().await;
        state
            .pools
            .values()
            .filter(|p| p.scope_id == scope_id && p.matches_labels(tags))
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no pool matching tags {tags:?}")))
    }

    async fn list_instances(&self, pool_id: &str) -> Result<Vec<Instance>> {
        let state = self.state.read().await;
        let mut instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| i.pool_id == pool_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn list_scope_instances(&self, scope_id: &str) -> Result<Vec<Instance>> {
        let state = self.state.read().await;
        let mut instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| {
                state
                    .pools
                    .get(&i.pool_id)
                    .is_some_and(|p| p.scope_id == scope_id)
            })
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn get_instance_by_name(&self, name: &str) -> Result<Instance> {
        let state = self.state.read().await;
        state
            .instances
            .values()
            .find(|i| i.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {name}")))
    }

    async fn get_pool_instance_by_name(&self, pool_id: &str, name: &str) -> Result<Instance> {
        let state = self.state.read().await;
        state
            .instances
            .values()
            .find(|i| i.pool_id == pool_id && i.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {name} in pool {pool_id}")))
    }

    async fn create_instance(
        &self,
        pool_id: &str,
        params: CreateInstanceParams,
    ) -> Result<Instance> {
        let mut state = self.state.write().await;
        if !state.pools.contains_key(pool_id) {
            return Err(Error::not_found(format!("pool {pool_id}")));
        }
        // Names are the join key with GitHub's runner registry, unique
        // across the whole controller.
        if state.instances.values().any(|i| i.name == params.name) {
            return Err(Error::conflict(format!(
                "instance name {} already in use",
                params.name
            )));
        }

        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            name: params.name,
            pool_id: pool_id.to_string(),
            provider_id: None,
            status: params.status,
            runner_status: params.runner_status,
            os_type: params.os_type,
            os_arch: params.os_arch,
            os_name: None,
            os_version: None,
            addresses: vec![],
            callback_url: params.callback_url,
            created_at: now,
            updated_at: now,
        };
        state
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn update_instance(&self, id: &str, params: UpdateInstanceParams) -> Result<Instance> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("instance {id}")))?;

        if let Some(status) = params.status {
            if !instance.status.can_transition_to(status) {
                return Err(Error::conflict(format!(
                    "instance {} cannot move from {} to {}",
                    instance.name, instance.status, status
                )));
            }
            instance.status = status;
        }
        if let Some(runner_status) = params.runner_status {
            instance.runner_status = runner_status;
        }
        if let Some(provider_id) = params.provider_id {
            instance.provider_id = Some(provider_id);
        }
        if let Some(os_name) = params.os_name {
            instance.os_name = Some(os_name);
        }
        if let Some(os_version) = params.os_version {
            instance.os_version = Some(os_version);
        }
        if let Some(addresses) = params.addresses {
            instance.addresses = addresses;
        }
        instance.updated_at = Utc::now();
        Ok(instance.clone())
    }

    async fn delete_instance(&self, pool_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let id = state
            .instances
            .values()
            .find(|i| i.pool_id == pool_id && i.name == name)
            .map(|i| i.id.clone());
        if let Some(id) = id {
            state.instances.remove(&id);
        }
        Ok(())
    }
}
