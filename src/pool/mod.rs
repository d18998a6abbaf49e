mod manager;
mod registry;

pub use manager::PoolManager;
pub use registry::PoolManagerRegistry;

/// Labels stamped on every runner so ownership survives in GitHub's registry
/// even when the local store does not.
pub const POOL_ID_LABEL_PREFIX: &str = "pool-id:";
pub const CONTROLLER_LABEL_PREFIX: &str = "controller-id:";

pub(crate) fn pool_label(pool_id: &str) -> String {
    format!("{POOL_ID_LABEL_PREFIX}{pool_id}")
}

pub(crate) fn controller_label(controller_id: &str) -> String {
    format!("{CONTROLLER_LABEL_PREFIX}{controller_id}")
}

pub(crate) fn pool_id_from_labels(labels: &[String]) -> Option<&str> {
    labels
        .iter()
        .find_map(|label| label.strip_prefix(POOL_ID_LABEL_PREFIX))
}
