//! Node session
//!
//! A [`Node`] owns the block store, the network task and the [`Blobs`]
//! engine built on them for the lifetime of one share or receive.

use libp2p::PeerId;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::blobs::Blobs;
use crate::config::NodeConfig;
use crate::error::ParcelError;
use crate::p2p::{spawn_network, NetworkHandle};
use crate::storage::{BlockStore, StoreBacking};

pub struct Node {
    engine: Blobs,
    network: NetworkHandle,
    swarm_task: JoinHandle<()>,
    backing: StoreBacking,
}

impl Node {
    /// Open storage, start networking and build the engine
    ///
    /// Any failure here is an [`ParcelError::EngineStartFailed`].
    pub async fn start(config: &NodeConfig) -> Result<Self, ParcelError> {
        config
            .validate()
            .map_err(|e| ParcelError::EngineStartFailed(e.to_string()))?;
        let network_config = config
            .network_config()
            .map_err(|e| ParcelError::EngineStartFailed(e.to_string()))?;

        let backing = config.backing();
        let store = BlockStore::open(&backing).map_err(|e| {
            ParcelError::EngineStartFailed(format!("Cannot open block store: {}", e))
        })?;
        let store = Arc::new(store);

        let (network, swarm_task) = spawn_network(Arc::clone(&store), &network_config)
            .await
            .map_err(|e| ParcelError::EngineStartFailed(format!("Cannot start network: {}", e)))?;

        let engine = Blobs::new(store, network.clone())
            .with_chunk_size(config.chunk_size)
            .map_err(|e| ParcelError::EngineStartFailed(e.to_string()))?;

        match &backing {
            StoreBacking::Memory => info!("Node {} started (ephemeral)", network.local_peer_id()),
            StoreBacking::Durable(path) => {
                info!("Node {} started (data in {:?})", network.local_peer_id(), path)
            }
        }

        Ok(Self {
            engine,
            network,
            swarm_task,
            backing,
        })
    }

    pub fn engine(&self) -> &Blobs {
        &self.engine
    }

    pub fn peer_id(&self) -> PeerId {
        self.network.local_peer_id()
    }

    pub fn backing(&self) -> &StoreBacking {
        &self.backing
    }

    /// Stop the network task and wait for it to exit
    pub async fn shutdown(self) {
        self.network.shutdown().await;
        if let Err(e) = self.swarm_task.await {
            warn!("Network task ended abnormally: {}", e);
        }
        info!("Node {} stopped", self.network.local_peer_id());
    }
}
