//! Builder for [`Pool`].

use std::{collections::HashSet, sync::Arc};

use super::{Pool, PoolError};
use crate::{
    config::{NodeConfig, PoolSettings},
    node::Node,
    transport::Transport,
};

/// Builder for a single-chain [`Pool`].
///
/// Nodes keep their insertion order, which breaks priority ties during selection.
///
/// # Examples
///
/// ```no_run
/// # use chainpool_core::{PoolBuilder, config::NodeConfig, transport::HttpTransport};
/// # use std::sync::Arc;
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PoolBuilder::new(1)
///     .node(
///         NodeConfig::new("primary", "https://eth.example.com").with_order(1),
///         Arc::new(HttpTransport::new("https://eth.example.com")?),
///     )
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder {
    chain_id: u64,
    settings: PoolSettings,
    nodes: Vec<(NodeConfig, Arc<dyn Transport>)>,
}

impl PoolBuilder {
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, settings: PoolSettings::default(), nodes: Vec::new() }
    }

    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn node(mut self, config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        self.nodes.push((config, transport));
        self
    }

    #[must_use]
    pub fn nodes<I>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = (NodeConfig, Arc<dyn Transport>)>,
    {
        self.nodes.extend(nodes);
        self
    }

    /// Builds the pool. Nodes start `Unreachable` (or `Unusable` when disabled); nothing runs
    /// until [`Pool::start`].
    ///
    /// # Errors
    ///
    /// - [`PoolError::NoNodesConfigured`] without nodes
    /// - [`PoolError::DuplicateNode`] if two nodes share a name
    pub fn build(self) -> Result<Pool, PoolError> {
        if self.nodes.is_empty() {
            return Err(PoolError::NoNodesConfigured { chain_id: self.chain_id });
        }

        let mut names = HashSet::with_capacity(self.nodes.len());
        for (config, _) in &self.nodes {
            if !names.insert(config.name.as_str()) {
                return Err(PoolError::DuplicateNode(config.name.clone()));
            }
        }

        let nodes: Vec<Arc<Node>> = self
            .nodes
            .into_iter()
            .map(|(config, transport)| {
                Arc::new(Node::new(config, self.chain_id, transport, &self.settings))
            })
            .collect();

        Ok(Pool::new(self.chain_id, nodes.into(), Arc::new(self.settings)))
    }
}
