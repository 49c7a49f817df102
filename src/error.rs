use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::NodeAddress;

/// Failures surfaced by the mesh coordinator.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A node could not be contacted or gave no usable answer. Never retried here.
    #[error("node {addr} unreachable: {source:#}")]
    NodeUnreachable {
        addr: NodeAddress,
        #[source]
        source: anyhow::Error,
    },

    /// The node received the call and refused it. Retrying will not help.
    #[error("node {addr} rejected the request: {source:#}")]
    NodeRejected {
        addr: NodeAddress,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed manifest {}: {reason}", path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    /// A fan-out whose caller required every node to answer saw failures.
    #[error("fan-out incomplete: {} of {total} nodes failed", failed.len())]
    FanoutPartialFailure {
        failed: Vec<NodeAddress>,
        total: usize,
        #[source]
        source: Box<MeshError>,
    },

    /// Export refused because the target already holds shard files.
    #[error("export directory {} already holds {files} shard file(s)", dir.display())]
    ExportDirNotEmpty { dir: PathBuf, files: usize },

    #[error("{barrier} barrier gave up after {waited:?}")]
    DeadlineExceeded {
        barrier: &'static str,
        waited: Duration,
    },

    #[error("invalid node address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fan-out task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl MeshError {
    /// Address of the node behind a per-node failure, if any.
    pub fn node(&self) -> Option<&NodeAddress> {
        match self {
            Self::NodeUnreachable { addr, .. } | Self::NodeRejected { addr, .. } => Some(addr),
            Self::FanoutPartialFailure { source, .. } => source.node(),
            _ => None,
        }
    }
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;
