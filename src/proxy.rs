use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::error::MeshError;
use crate::types::{Entry, NodeAddress};

/// Primitive operations of one mesh node, as offered by the node engine.
///
/// Every call is a single round-trip to the node named by `node`.
/// Implementations own the wire protocol and never retry.
pub trait Transport: Send + Sync + 'static {
    /// The node's current, possibly stale, view of reachable peers.
    fn neighbors(
        &self,
        node: &NodeAddress,
    ) -> impl Future<Output = Result<Vec<NodeAddress>>> + Send;

    /// Virtual agents on the node's consistent-hash ring.
    fn ring_size(&self, node: &NodeAddress) -> impl Future<Output = Result<u64>> + Send;

    /// Entries of the node's local shard carrying every tag in `tags`.
    fn query(
        &self,
        node: &NodeAddress,
        tags: &[String],
    ) -> impl Future<Output = Result<Vec<Entry>>> + Send;

    /// Start a round of the installed filters. Returns before the round ends.
    fn process(&self, node: &NodeAddress) -> impl Future<Output = Result<()>> + Send;

    fn processing(&self, node: &NodeAddress) -> impl Future<Output = Result<bool>> + Send;

    fn db_size(&self, node: &NodeAddress) -> impl Future<Output = Result<u64>> + Send;

    /// Start ingesting a directory of shard files. Returns before ingestion ends.
    fn import_db(
        &self,
        node: &NodeAddress,
        dir: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Start writing shard files into `dir`. Returns before the files exist.
    fn export_db(
        &self,
        node: &NodeAddress,
        dir: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_entry(
        &self,
        node: &NodeAddress,
        entry: &Entry,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_db_file(
        &self,
        node: &NodeAddress,
        path: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_filter_dir(
        &self,
        node: &NodeAddress,
        dir: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    fn install_filter(
        &self,
        node: &NodeAddress,
        name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn clear_filters(&self, node: &NodeAddress) -> impl Future<Output = Result<()>> + Send;

    fn installed_filters(
        &self,
        node: &NodeAddress,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Every entry held by the node's local shard.
    fn get_entries(&self, node: &NodeAddress) -> impl Future<Output = Result<Vec<Entry>>> + Send;
}

/// Marks a transport error as a refusal by a node that received the call.
///
/// Transports wrap such errors with it (e.g. `bail!(Rejected(..))`); every
/// other transport error is treated as the node being unreachable.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Rejected(pub String);

/// Handle to a single mesh node.
///
/// Stateless apart from the address. A transport failure carrying
/// [`Rejected`] comes back as [`MeshError::NodeRejected`], any other as
/// [`MeshError::NodeUnreachable`], both naming this node.
pub struct NodeProxy<T: Transport> {
    addr: NodeAddress,
    transport: Arc<T>,
}

impl<T: Transport> Clone for NodeProxy<T> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for NodeProxy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProxy").field("addr", &self.addr).finish()
    }
}

impl<T: Transport> NodeProxy<T> {
    pub fn new(addr: NodeAddress, transport: Arc<T>) -> Self {
        Self { addr, transport }
    }

    pub fn addr(&self) -> &NodeAddress {
        &self.addr
    }

    fn failure(&self, source: anyhow::Error) -> MeshError {
        let addr = self.addr.clone();
        if source.chain().any(|cause| cause.is::<Rejected>()) {
            MeshError::NodeRejected { addr, source }
        } else {
            MeshError::NodeUnreachable { addr, source }
        }
    }

    pub async fn neighbors(&self) -> crate::Result<Vec<NodeAddress>> {
        self.transport
            .neighbors(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn num_neighbors(&self) -> crate::Result<usize> {
        Ok(self.neighbors().await?.len())
    }

    pub async fn ring_size(&self) -> crate::Result<u64> {
        self.transport
            .ring_size(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn query(&self, tags: &[String]) -> crate::Result<Vec<Entry>> {
        self.transport
            .query(&self.addr, tags)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn process(&self) -> crate::Result<()> {
        self.transport
            .process(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn processing(&self) -> crate::Result<bool> {
        self.transport
            .processing(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn db_size(&self) -> crate::Result<u64> {
        self.transport
            .db_size(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn import_db(&self, dir: &Path) -> crate::Result<()> {
        self.transport
            .import_db(&self.addr, dir)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn export_db(&self, dir: &Path) -> crate::Result<()> {
        self.transport
            .export_db(&self.addr, dir)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn add_entry(&self, entry: &Entry) -> crate::Result<()> {
        self.transport
            .add_entry(&self.addr, entry)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn add_db_file(&self, path: &Path) -> crate::Result<()> {
        self.transport
            .add_db_file(&self.addr, path)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn add_filter_dir(&self, dir: &Path) -> crate::Result<()> {
        self.transport
            .add_filter_dir(&self.addr, dir)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn install_filter(&self, name: &str) -> crate::Result<()> {
        self.transport
            .install_filter(&self.addr, name)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn clear_filters(&self) -> crate::Result<()> {
        self.transport
            .clear_filters(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn installed_filters(&self) -> crate::Result<Vec<String>> {
        self.transport
            .installed_filters(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn get_entries(&self) -> crate::Result<Vec<Entry>> {
        self.transport
            .get_entries(&self.addr)
            .await
            .map_err(|e| self.failure(e))
    }
}
