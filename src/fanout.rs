use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::aggregate;
use crate::error::{MeshError, Result};
use crate::proxy::{NodeProxy, Transport};
use crate::types::{Entry, NodeAddress};

/// Which nodes a fan-out round is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targets {
    /// Exactly the anchor's reported neighbors, as reported.
    Neighbors,
    /// The anchor plus its neighbors, each address once, anchor first.
    MeshWide,
}

/// Every sub-operation of a settled fan-out, successful or not.
#[derive(Debug)]
pub struct FanoutOutcome<R> {
    pub results: Vec<(NodeAddress, R)>,
    pub failures: Vec<(NodeAddress, MeshError)>,
    pub total: usize,
}

impl<R> FanoutOutcome<R> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_nodes(&self) -> Vec<NodeAddress> {
        self.failures.iter().map(|(addr, _)| addr.clone()).collect()
    }

    /// Results of a fully successful fan-out; otherwise `FanoutPartialFailure`.
    pub fn into_complete(self) -> Result<Vec<R>> {
        let failed = self.failed_nodes();
        let mut failures = self.failures.into_iter();
        match failures.next() {
            None => Ok(self.results.into_iter().map(|(_, r)| r).collect()),
            Some((_, first)) => Err(MeshError::FanoutPartialFailure {
                failed,
                total: self.total,
                source: Box::new(first),
            }),
        }
    }
}

/// Entries gathered from the nodes that answered a tag query.
#[derive(Debug, Clone, Serialize)]
pub struct PartialQuery {
    pub entries: Vec<Entry>,
    pub failed: Vec<NodeAddress>,
}

/// Dispatches one logical operation to many nodes at once.
///
/// All fan-outs share one semaphore, so at most `max_concurrency` node calls
/// are in flight regardless of mesh size or how many fan-outs run together.
pub struct FanoutCoordinator<T: Transport> {
    transport: Arc<T>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl<T: Transport> FanoutCoordinator<T> {
    pub fn new(transport: Arc<T>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn proxy(&self, addr: NodeAddress) -> NodeProxy<T> {
        NodeProxy::new(addr, self.transport.clone())
    }

    /// Fetch a fresh mesh view from the anchor. Never cached.
    pub async fn targets(
        &self,
        anchor: &NodeProxy<T>,
        targets: Targets,
    ) -> Result<Vec<NodeAddress>> {
        let view = anchor.neighbors().await?;
        Ok(match targets {
            Targets::Neighbors => view,
            Targets::MeshWide => {
                let mut seen = HashSet::with_capacity(view.len() + 1);
                seen.insert(anchor.addr().clone());
                let mut nodes = vec![anchor.addr().clone()];
                nodes.extend(view.into_iter().filter(|addr| seen.insert(addr.clone())));
                nodes
            }
        })
    }

    fn spawn_all<F, Fut, R>(
        &self,
        nodes: Vec<NodeAddress>,
        op: F,
    ) -> JoinSet<(NodeAddress, Result<R>)>
    where
        F: Fn(NodeProxy<T>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let mut set = JoinSet::new();
        for addr in nodes {
            let permits = self.permits.clone();
            let call = op(self.proxy(addr.clone()));
            set.spawn(async move {
                // The semaphore is never closed, so acquisition only fails on shutdown.
                let _permit = permits.acquire_owned().await.ok();
                (addr, call.await)
            });
        }
        set
    }

    /// Run `op` on every node; the first failure aborts the rest and is returned unchanged.
    pub async fn dispatch<F, Fut, R>(&self, nodes: Vec<NodeAddress>, op: F) -> Result<Vec<R>>
    where
        F: Fn(NodeProxy<T>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let mut results = Vec::with_capacity(nodes.len());
        let mut set = self.spawn_all(nodes, op);
        while let Some(joined) = set.join_next().await {
            match joined? {
                (_, Ok(result)) => results.push(result),
                (addr, Err(e)) => {
                    warn!("Fan-out aborted by node {addr}: {e}");
                    set.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Run `op` on every node and keep every outcome.
    pub async fn dispatch_settled<F, Fut, R>(
        &self,
        nodes: Vec<NodeAddress>,
        op: F,
    ) -> Result<FanoutOutcome<R>>
    where
        F: Fn(NodeProxy<T>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let total = nodes.len();
        let mut outcome = FanoutOutcome {
            results: Vec::with_capacity(total),
            failures: Vec::new(),
            total,
        };
        let mut set = self.spawn_all(nodes, op);
        while let Some(joined) = set.join_next().await {
            match joined? {
                (addr, Ok(result)) => outcome.results.push((addr, result)),
                (addr, Err(e)) => {
                    warn!("Node {addr} failed during fan-out: {e}");
                    outcome.failures.push((addr, e));
                }
            }
        }
        Ok(outcome)
    }

    pub async fn fanout_map<F, Fut, R>(
        &self,
        anchor: &NodeProxy<T>,
        targets: Targets,
        op: F,
    ) -> Result<Vec<R>>
    where
        F: Fn(NodeProxy<T>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let nodes = self.targets(anchor, targets).await?;
        debug!(nodes = nodes.len(), ?targets, "Fanning out");
        self.dispatch(nodes, op).await
    }

    pub async fn fanout_map_settled<F, Fut, R>(
        &self,
        anchor: &NodeProxy<T>,
        targets: Targets,
        op: F,
    ) -> Result<FanoutOutcome<R>>
    where
        F: Fn(NodeProxy<T>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let nodes = self.targets(anchor, targets).await?;
        debug!(nodes = nodes.len(), ?targets, "Fanning out (settled)");
        self.dispatch_settled(nodes, op).await
    }

    /// Concatenation of `query(tags)` over every neighbor of the anchor.
    #[tracing::instrument(skip(self, anchor), fields(anchor = %anchor.addr()))]
    pub async fn fanout_query(&self, anchor: &NodeProxy<T>, tags: &[String]) -> Result<Vec<Entry>> {
        let tags: Arc<[String]> = tags.into();
        let lists = self
            .fanout_map(anchor, Targets::Neighbors, move |node| {
                let tags = tags.clone();
                async move { node.query(&tags).await }
            })
            .await?;
        Ok(aggregate::concat(lists))
    }

    /// Like [`Self::fanout_query`] but keeps the entries of the nodes that answered.
    #[tracing::instrument(skip(self, anchor), fields(anchor = %anchor.addr()))]
    pub async fn fanout_query_partial(
        &self,
        anchor: &NodeProxy<T>,
        tags: &[String],
    ) -> Result<PartialQuery> {
        let tags: Arc<[String]> = tags.into();
        let outcome = self
            .fanout_map_settled(anchor, Targets::Neighbors, move |node| {
                let tags = tags.clone();
                async move { node.query(&tags).await }
            })
            .await?;
        let failed = outcome.failed_nodes();
        let entries = aggregate::concat(outcome.results.into_iter().map(|(_, list)| list));
        Ok(PartialQuery { entries, failed })
    }

    /// Sum of `db_size` over the anchor and its neighbors.
    pub async fn db_size_total(&self, anchor: &NodeProxy<T>) -> Result<u64> {
        let sizes = self
            .fanout_map(anchor, Targets::MeshWide, |node| async move { node.db_size().await })
            .await?;
        Ok(aggregate::sum(sizes))
    }

    /// Per-node `processing` flags of the chosen targets.
    pub async fn processing_flags(
        &self,
        anchor: &NodeProxy<T>,
        targets: Targets,
    ) -> Result<Vec<(NodeAddress, bool)>> {
        self.fanout_map(anchor, targets, |node| async move {
            let busy = node.processing().await?;
            Ok((node.addr().clone(), busy))
        })
        .await
    }
}
