use crate::agent::types::NodeId;
use crate::core::config::AppConfig;

/// Immutable state shared by the node and its background tasks
pub struct AppContext {
    pub config: AppConfig,
    pub node_id: NodeId,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let node_id = NodeId::from_name(&config.general.name);
        Self { config, node_id }
    }
}
