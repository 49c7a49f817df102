use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::barrier::{ConsistencyBarrier, ExportReport, ImportReport, ProcessingReport};
use crate::config::MeshConfig;
use crate::error::Result;
use crate::fanout::{FanoutCoordinator, PartialQuery, Targets};
use crate::proxy::{NodeProxy, Transport};
use crate::types::{Entry, NodeAddress};

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub addr: NodeAddress,
    pub db_size: u64,
    pub processing: bool,
    pub filters: Vec<String>,
}

/// Point-in-time view of every node reachable through the anchor.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub anchor: NodeAddress,
    pub observed_at_ms: i64,
    pub nodes: Vec<NodeStatus>,
    pub unreachable: Vec<NodeAddress>,
}

impl MeshStatus {
    pub fn total_size(&self) -> u64 {
        self.nodes.iter().map(|n| n.db_size).sum()
    }

    pub fn busy(&self) -> usize {
        self.nodes.iter().filter(|n| n.processing).count()
    }
}

/// A mesh seen through one anchor node.
///
/// Owns the worker pool and the barrier settings; both are reused by
/// every call.
pub struct Mesh<T: Transport> {
    anchor: NodeProxy<T>,
    fanout: Arc<FanoutCoordinator<T>>,
    barrier: ConsistencyBarrier<T>,
    config: MeshConfig,
}

impl<T: Transport> Mesh<T> {
    pub fn new(transport: Arc<T>, anchor: NodeAddress, config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let fanout = Arc::new(FanoutCoordinator::new(transport, config.max_concurrency));
        let barrier = ConsistencyBarrier::new(fanout.clone(), config.clone());
        info!(
            %anchor,
            max_concurrency = config.max_concurrency,
            deadline = ?config.deadline,
            "Mesh client ready"
        );
        Ok(Self {
            anchor: fanout.proxy(anchor),
            fanout,
            barrier,
            config,
        })
    }

    pub fn anchor(&self) -> &NodeProxy<T> {
        &self.anchor
    }

    pub fn node(&self, addr: NodeAddress) -> NodeProxy<T> {
        self.fanout.proxy(addr)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn fanout(&self) -> &FanoutCoordinator<T> {
        &self.fanout
    }

    /// Entries carrying every tag in `tags`, from every neighbor of the anchor.
    pub async fn query_all(&self, tags: &[String]) -> Result<Vec<Entry>> {
        self.fanout.fanout_query(&self.anchor, tags).await
    }

    pub async fn query_all_partial(&self, tags: &[String]) -> Result<PartialQuery> {
        self.fanout.fanout_query_partial(&self.anchor, tags).await
    }

    pub async fn db_size_total(&self) -> Result<u64> {
        self.fanout.db_size_total(&self.anchor).await
    }

    /// True if any node of the mesh is mid-pipeline right now.
    pub async fn is_processing(&self) -> Result<bool> {
        let flags = self
            .fanout
            .processing_flags(&self.anchor, Targets::MeshWide)
            .await?;
        Ok(crate::aggregate::any(flags.into_iter().map(|(_, busy)| busy)))
    }

    pub async fn process_blocking(&self) -> Result<ProcessingReport> {
        self.barrier.process_blocking(&self.anchor).await
    }

    pub async fn import_db_blocking(&self, dir: &Path) -> Result<ImportReport> {
        self.barrier.import_db_blocking(&self.anchor, dir).await
    }

    pub async fn export_db_blocking(&self, dir: &Path) -> Result<ExportReport> {
        self.barrier.export_db_blocking(&self.anchor, dir).await
    }

    pub async fn await_mesh(&self, min_nodes: usize) -> Result<Vec<NodeAddress>> {
        self.barrier.await_mesh(&self.anchor, min_nodes).await
    }

    /// Size, processing flag and filters of every node. Unreachable nodes are
    /// listed rather than failing the call.
    pub async fn status(&self) -> Result<MeshStatus> {
        let outcome = self
            .fanout
            .fanout_map_settled(&self.anchor, Targets::MeshWide, |node| async move {
                Ok(NodeStatus {
                    db_size: node.db_size().await?,
                    processing: node.processing().await?,
                    filters: node.installed_filters().await?,
                    addr: node.addr().clone(),
                })
            })
            .await?;
        let unreachable = outcome.failed_nodes();
        let mut nodes: Vec<NodeStatus> = outcome.results.into_iter().map(|(_, s)| s).collect();
        nodes.sort_by(|a, b| a.addr.cmp(&b.addr));
        Ok(MeshStatus {
            anchor: self.anchor.addr().clone(),
            observed_at_ms: Utc::now().timestamp_millis(),
            nodes,
            unreachable,
        })
    }
}
