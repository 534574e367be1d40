//! One [`Pool`] per configured chain.
//!
//! Built once at startup and handed to collaborators by reference. There is no process-wide
//! registry: whoever needs a pool gets the `ChainSet` (or the `Arc<Pool>`) explicitly.

use futures::future::join_all;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::info;

use crate::{
    config::{ChainConfig, NodeConfig},
    pool::{Pool, PoolBuilder, PoolError},
    transport::{HttpTransport, Transport, TransportError},
};

#[derive(Error, Debug)]
pub enum ChainSetError {
    #[error("chain {0} configured more than once")]
    DuplicateChain(u64),

    #[error("chain {chain_id}: {source}")]
    Pool {
        chain_id: u64,
        #[source]
        source: PoolError,
    },

    #[error("chain {chain_id}, node {node}: {source}")]
    Transport {
        chain_id: u64,
        node: String,
        #[source]
        source: TransportError,
    },
}

pub struct ChainSet {
    pools: BTreeMap<u64, Arc<Pool>>,
}

impl ChainSet {
    /// Builds one pool per chain, creating each node's transport with `make_transport`.
    ///
    /// # Errors
    ///
    /// Fails on a repeated chain id, a transport that cannot be created, or a pool that
    /// cannot be built (no nodes, duplicate node names).
    pub fn from_config<F>(chains: &[ChainConfig], mut make_transport: F) -> Result<Self, ChainSetError>
    where
        F: FnMut(u64, &NodeConfig) -> Result<Arc<dyn Transport>, TransportError>,
    {
        let mut pools = BTreeMap::new();

        for chain in chains {
            if pools.contains_key(&chain.chain_id) {
                return Err(ChainSetError::DuplicateChain(chain.chain_id));
            }

            let mut builder = PoolBuilder::new(chain.chain_id).settings(chain.pool.clone());
            for node in &chain.nodes {
                let transport = make_transport(chain.chain_id, node).map_err(|source| {
                    ChainSetError::Transport {
                        chain_id: chain.chain_id,
                        node: node.name.clone(),
                        source,
                    }
                })?;
                builder = builder.node(node.clone(), transport);
            }

            let pool = builder
                .build()
                .map_err(|source| ChainSetError::Pool { chain_id: chain.chain_id, source })?;
            pools.insert(chain.chain_id, Arc::new(pool));
        }

        Ok(Self { pools })
    }

    /// Builds the chain set with an [`HttpTransport`] per node. A node's `ws_url`, when set,
    /// carries its new-head subscription.
    ///
    /// # Errors
    ///
    /// See [`ChainSet::from_config`].
    pub fn with_http_transports(chains: &[ChainConfig]) -> Result<Self, ChainSetError> {
        Self::from_config(chains, |_, node| {
            let http = HttpTransport::new(node.url.clone())?.with_ws_url(node.ws_url.clone());
            let transport: Arc<dyn Transport> = Arc::new(http);
            Ok(transport)
        })
    }

    #[must_use]
    pub fn pool(&self, chain_id: u64) -> Option<&Arc<Pool>> {
        self.pools.get(&chain_id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<Pool>> {
        self.pools.values()
    }

    #[must_use]
    pub fn chain_ids(&self) -> Vec<u64> {
        self.pools.keys().copied().collect()
    }

    /// Starts every pool.
    ///
    /// # Errors
    ///
    /// Returns the first pool that refuses to start; pools started before it keep running.
    pub fn start_all(&self) -> Result<(), ChainSetError> {
        for (chain_id, pool) in &self.pools {
            pool.start().map_err(|source| ChainSetError::Pool { chain_id: *chain_id, source })?;
        }
        info!(chains = self.pools.len(), "all pools started");
        Ok(())
    }

    /// Stops every pool concurrently and waits for all of them.
    pub async fn stop_all(&self) {
        join_all(self.pools.values().map(|pool| pool.stop())).await;
        info!(chains = self.pools.len(), "all pools stopped");
    }
}
