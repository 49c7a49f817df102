//! meshcoord - treat a mesh of sharded database nodes as one logical store
//!
//! Each node of the mesh holds only a shard of the data and runs its filter
//! pipeline, imports and exports asynchronously. This crate is the client side
//! of that arrangement: it fans operations out to every node, merges the
//! answers, and blocks until mesh-wide conditions hold.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use meshcoord::{sim::SimMesh, DbKey, Entry, Mesh, MeshConfig, NodeAddress};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> meshcoord::Result<()> {
//! let nodes = Arc::new(SimMesh::new("127.0.0.1", 2));
//! let mesh = Mesh::new(nodes, NodeAddress::new("127.0.0.1", 0), MeshConfig::default())?;
//!
//! let entry = Entry::new(DbKey::new(1, 1, 1), "VAL").with_tags(["BTC"]);
//! mesh.anchor().add_entry(&entry).await?;
//!
//! assert_eq!(mesh.db_size_total().await?, 1);
//! assert_eq!(mesh.query_all(&["BTC".to_string()]).await?.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`proxy::Transport`] / [`NodeProxy`] - one round-trip to one node; you
//!   provide the transport
//! - [`fanout::FanoutCoordinator`] - the same operation on every node through
//!   one bounded worker pool
//! - [`aggregate`] - reducers over per-node results
//! - [`barrier::ConsistencyBarrier`] - polling waits for processing, import,
//!   export and mesh membership
//! - [`manifest`] - shard file headers and expected import sizes
//! - [`sim`] - an in-memory mesh for tests and demos
//!
//! # Non-goals
//!
//! The node engine itself: tag storage, filter execution, the wire protocol
//! and the gossip that keeps neighbor lists current.

pub mod aggregate;
pub mod barrier;
pub mod config;
pub mod error;
pub mod fanout;
pub mod manifest;
pub mod mesh;
pub mod proxy;
pub mod sim;
pub mod types;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use mesh::Mesh;
pub use proxy::{NodeProxy, Rejected, Transport};
pub use types::{DbKey, Entry, NodeAddress};

#[cfg(test)]
mod tests;
