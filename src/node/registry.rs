use std::collections::HashMap;
use std::sync::Arc;

use super::executor::NodeExecutor;

/// Node lookup by fully-qualified name.
///
/// A worker registers the nodes it can host; the broker subscription and the
/// runner both resolve through this table.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. The last registration for a name wins.
    pub fn register(&mut self, node: Arc<dyn NodeExecutor>) {
        self.nodes.insert(node.node_name().to_string(), node);
    }

    #[must_use]
    pub fn get(&self, node_name: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.nodes.get(node_name).cloned()
    }

    /// Names this worker declares capability for.
    #[must_use]
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
