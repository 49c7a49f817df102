//! In-memory stand-in for a mesh of node engines.
//!
//! Each simulated node holds one shard; entries are routed to their owner by
//! key hash no matter which node receives them. `process`, `import_db` and
//! `export_db` complete in the background after a per-node latency, so the
//! coordinator observes them only by polling, the same way it does against
//! live nodes.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fs_err::{self as fs, File, OpenOptions};
use tracing::{debug, info, warn};

use crate::manifest::{self, SHARD_HEADER_LEN};
use crate::proxy::{Rejected, Transport};
use crate::types::{DbKey, Entry, NodeAddress};

/// Virtual agents each member contributes to the consistent-hash ring.
pub const VAGENTS_PER_NODE: u64 = 100;

/// A filter expands one entry into zero or more new entries.
pub type FilterFn = Arc<dyn Fn(&Entry) -> Vec<Entry> + Send + Sync>;

/// Background work latencies. Node `i` takes `(i + 1)` times the base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimLatency {
    pub process: Duration,
    pub import: Duration,
    pub export: Duration,
}

impl Default for SimLatency {
    fn default() -> Self {
        Self {
            process: Duration::from_millis(200),
            import: Duration::from_millis(200),
            export: Duration::from_millis(200),
        }
    }
}

struct NodeState {
    addr: NodeAddress,
    entries: Vec<Entry>,
    filters: Vec<String>,
    /// Directories registered with `add_filter_dir`. Filters are resolved
    /// from the in-memory library; these are only reported back.
    filter_dirs: Vec<PathBuf>,
    /// Filter rounds currently running on this node.
    rounds: u32,
    /// Reports processing regardless of `rounds`.
    held: bool,
    unreachable: bool,
    /// Overrides the neighbor list this node reports.
    view: Option<Vec<NodeAddress>>,
}

impl NodeState {
    fn processing(&self) -> bool {
        self.held || self.rounds > 0
    }
}

struct SimNode {
    state: RwLock<NodeState>,
}

impl SimNode {
    fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().expect("Failed to lock node state")
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().expect("Failed to lock node state")
    }
}

struct Shared {
    nodes: Vec<SimNode>,
    index: HashMap<NodeAddress, usize>,
    library: RwLock<HashMap<String, FilterFn>>,
    latency: SimLatency,
    next_seq: AtomicI64,
}

/// A simulated mesh. Cheap to clone; clones share the same nodes.
#[derive(Clone)]
pub struct SimMesh {
    shared: Arc<Shared>,
}

impl SimMesh {
    /// Nodes `host,0` .. `host,{n-1}`.
    pub fn new(host: &str, n: u32) -> Self {
        Self::with_latency(host, n, SimLatency::default())
    }

    pub fn with_latency(host: &str, n: u32, latency: SimLatency) -> Self {
        let addrs: Vec<NodeAddress> = (0..n).map(|id| NodeAddress::new(host, id)).collect();
        let index = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| (addr.clone(), i))
            .collect();
        let nodes = addrs
            .into_iter()
            .map(|addr| SimNode {
                state: RwLock::new(NodeState {
                    addr,
                    entries: Vec::new(),
                    filters: Vec::new(),
                    filter_dirs: Vec::new(),
                    rounds: 0,
                    held: false,
                    unreachable: false,
                    view: None,
                }),
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                nodes,
                index,
                library: RwLock::new(HashMap::new()),
                latency,
                next_seq: AtomicI64::new(1),
            }),
        }
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.shared
            .nodes
            .iter()
            .map(|node| node.read().addr.clone())
            .collect()
    }

    /// Make a filter available to `install_filter` under `name`.
    pub fn register_filter<F>(&self, name: &str, filter: F)
    where
        F: Fn(&Entry) -> Vec<Entry> + Send + Sync + 'static,
    {
        self.shared
            .library
            .write()
            .expect("Failed to lock filter library")
            .insert(name.to_string(), Arc::new(filter));
    }

    pub fn set_unreachable(&self, addr: &NodeAddress, unreachable: bool) {
        if let Some(node) = self.lookup(addr) {
            node.write().unreachable = unreachable;
        }
    }

    /// Keep a node reporting `processing() == true` until released.
    pub fn hold_processing(&self, addr: &NodeAddress, held: bool) {
        if let Some(node) = self.lookup(addr) {
            node.write().held = held;
        }
    }

    /// Replace the neighbor list `addr` reports; `None` restores the full membership.
    pub fn set_view(&self, addr: &NodeAddress, view: Option<Vec<NodeAddress>>) {
        if let Some(node) = self.lookup(addr) {
            node.write().view = view;
        }
    }

    /// Entry count of every node, in address order.
    pub fn local_sizes(&self) -> Vec<(NodeAddress, usize)> {
        self.shared
            .nodes
            .iter()
            .map(|node| {
                let state = node.read();
                (state.addr.clone(), state.entries.len())
            })
            .collect()
    }

    /// Filter directories registered on `addr`, in registration order.
    pub fn filter_dirs(&self, addr: &NodeAddress) -> Vec<PathBuf> {
        self.lookup(addr)
            .map(|node| node.read().filter_dirs.clone())
            .unwrap_or_default()
    }

    fn lookup(&self, addr: &NodeAddress) -> Option<&SimNode> {
        self.shared.index.get(addr).map(|&i| &self.shared.nodes[i])
    }

    /// The node answering a call; fails like a refused connection.
    fn reach(&self, addr: &NodeAddress) -> Result<&SimNode> {
        let Some(node) = self.lookup(addr) else {
            bail!("no node listening at {addr}");
        };
        if node.read().unreachable {
            bail!("connection to {addr} refused");
        }
        Ok(node)
    }

    fn owner(&self, key: &DbKey) -> &SimNode {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slot = hasher.finish() % self.shared.nodes.len() as u64;
        &self.shared.nodes[slot as usize]
    }

    /// Store entries on their owning nodes. Unkeyed entries get a fresh key.
    fn insert(&self, origin: &NodeAddress, entries: Vec<Entry>) {
        for mut entry in entries {
            if entry.key == DbKey::default() {
                let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.key = DbKey::new(0, i64::from(origin.id()), seq);
            }
            self.owner(&entry.key).write().entries.push(entry);
        }
    }

    fn filter(&self, name: &str) -> Option<FilterFn> {
        self.shared
            .library
            .read()
            .expect("Failed to lock filter library")
            .get(name)
            .cloned()
    }

    /// One filter round over a node's entries as they were when the round started.
    fn run_round(&self, index: usize, snapshot: Vec<Entry>, filters: Vec<FilterFn>) {
        let node = &self.shared.nodes[index];
        let addr = node.read().addr.clone();
        let produced: Vec<Entry> = snapshot
            .iter()
            .flat_map(|entry| filters.iter().flat_map(move |f| f(entry)))
            .collect();
        debug!(%addr, produced = produced.len(), "Filter round finished");
        self.insert(&addr, produced);
        let mut state = node.write();
        state.rounds = state.rounds.saturating_sub(1);
    }

    fn import_files(&self, origin: &NodeAddress, dir: &Path) -> Result<usize> {
        let mut imported = 0;
        for path in manifest::list_shard_files(dir)? {
            let (declared, entries) = read_shard_file(&path)?;
            if declared != entries.len() as u64 {
                warn!(
                    path = %path.display(),
                    declared,
                    found = entries.len(),
                    "Shard header disagrees with its body"
                );
            }
            imported += entries.len();
            self.insert(origin, entries);
        }
        Ok(imported)
    }
}

/// Header plus bincode-encoded entries.
pub fn encode_shard(entries: &[Entry]) -> Result<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(entries, bincode::config::standard())
        .context("Failed to encode shard body")?;
    let mut bytes = Vec::with_capacity(SHARD_HEADER_LEN + body.len());
    manifest::write_shard_header(&mut bytes, entries.len() as u64)?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Returns the declared count and the decoded entries.
pub fn decode_shard(bytes: &[u8]) -> Result<(u64, Vec<Entry>)> {
    let Some(declared) = manifest::decode_shard_header(bytes) else {
        bail!("shard shorter than its header");
    };
    let (entries, _) = bincode::serde::decode_from_slice::<Vec<Entry>, _>(
        &bytes[SHARD_HEADER_LEN..],
        bincode::config::standard(),
    )
    .context("Failed to decode shard body")?;
    Ok((declared, entries))
}

pub fn read_shard_file(path: &Path) -> Result<(u64, Vec<Entry>)> {
    let bytes = fs::read(path)?;
    decode_shard(&bytes).with_context(|| format!("Invalid shard file {}", path.display()))
}

/// Write a shard file atomically: staged under a hidden name, then renamed.
pub fn write_shard_file(path: &Path, entries: &[Entry]) -> Result<()> {
    let encoded = encode_shard(entries)?;
    let file_name = path
        .file_name()
        .context("Shard path has no file name")?
        .to_string_lossy();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?,
        );
        writer.write_all(&encoded)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Entries from a text file holding one JSON entry per line.
pub fn read_entry_file(path: &Path) -> Result<Vec<Entry>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid entry", path.display(), n + 1))
        })
        .collect()
}

impl Transport for SimMesh {
    async fn neighbors(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>> {
        let view = self.reach(node)?.read().view.clone();
        Ok(view.unwrap_or_else(|| self.addresses()))
    }

    async fn ring_size(&self, node: &NodeAddress) -> Result<u64> {
        let members = self.neighbors(node).await?.len() as u64;
        Ok(members * VAGENTS_PER_NODE)
    }

    async fn query(&self, node: &NodeAddress, tags: &[String]) -> Result<Vec<Entry>> {
        let node = self.reach(node)?;
        let state = node.read();
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.matches(tags))
            .cloned()
            .collect())
    }

    async fn process(&self, node: &NodeAddress) -> Result<()> {
        self.reach(node)?;
        info!(%node, "Starting a filter round on every node");
        for (index, sim_node) in self.shared.nodes.iter().enumerate() {
            let (snapshot, filters) = {
                let mut state = sim_node.write();
                state.rounds += 1;
                let filters: Vec<FilterFn> =
                    state.filters.iter().filter_map(|name| self.filter(name)).collect();
                (state.entries.clone(), filters)
            };
            let mesh = self.clone();
            let delay = self.shared.latency.process * (index as u32 + 1);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                mesh.run_round(index, snapshot, filters);
            });
        }
        Ok(())
    }

    async fn processing(&self, node: &NodeAddress) -> Result<bool> {
        Ok(self.reach(node)?.read().processing())
    }

    async fn db_size(&self, node: &NodeAddress) -> Result<u64> {
        Ok(self.reach(node)?.read().entries.len() as u64)
    }

    async fn import_db(&self, node: &NodeAddress, dir: &Path) -> Result<()> {
        self.reach(node)?;
        if !dir.is_dir() {
            bail!(Rejected(format!("import directory {} does not exist", dir.display())));
        }
        let mesh = self.clone();
        let origin = node.clone();
        let dir = dir.to_path_buf();
        let delay = self.shared.latency.import;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match mesh.import_files(&origin, &dir) {
                Ok(imported) => info!(%origin, imported, "Imported {}", dir.display()),
                Err(e) => warn!(%origin, "Import of {} failed: {e:#}", dir.display()),
            }
        });
        Ok(())
    }

    async fn export_db(&self, node: &NodeAddress, dir: &Path) -> Result<()> {
        self.reach(node)?;
        if !dir.is_dir() {
            bail!(Rejected(format!("export directory {} does not exist", dir.display())));
        }
        for (index, sim_node) in self.shared.nodes.iter().enumerate() {
            let (id, entries) = {
                let state = sim_node.read();
                (state.addr.id(), state.entries.clone())
            };
            let path = dir.join(format!("node_{id}.shard"));
            let delay = self.shared.latency.export * (index as u32 + 1);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match write_shard_file(&path, &entries) {
                    Ok(()) => debug!(count = entries.len(), "Exported {}", path.display()),
                    Err(e) => warn!("Export to {} failed: {e:#}", path.display()),
                }
            });
        }
        Ok(())
    }

    async fn add_entry(&self, node: &NodeAddress, entry: &Entry) -> Result<()> {
        self.reach(node)?;
        self.insert(node, vec![entry.clone()]);
        Ok(())
    }

    async fn add_db_file(&self, node: &NodeAddress, path: &Path) -> Result<()> {
        self.reach(node)?;
        let entries = read_entry_file(path).map_err(|e| Rejected(format!("{e:#}")))?;
        debug!(%node, count = entries.len(), "Adding entries from {}", path.display());
        self.insert(node, entries);
        Ok(())
    }

    async fn add_filter_dir(&self, node: &NodeAddress, dir: &Path) -> Result<()> {
        self.reach(node)?;
        if !dir.is_dir() {
            bail!(Rejected(format!("filter directory {} does not exist", dir.display())));
        }
        for sim_node in &self.shared.nodes {
            let mut state = sim_node.write();
            if !state.filter_dirs.iter().any(|d| d == dir) {
                state.filter_dirs.push(dir.to_path_buf());
            }
        }
        Ok(())
    }

    async fn install_filter(&self, node: &NodeAddress, name: &str) -> Result<()> {
        self.reach(node)?;
        if self.filter(name).is_none() {
            bail!(Rejected(format!("unknown filter {name}")));
        }
        for sim_node in &self.shared.nodes {
            let mut state = sim_node.write();
            if !state.filters.iter().any(|f| f == name) {
                state.filters.push(name.to_string());
            }
        }
        Ok(())
    }

    async fn clear_filters(&self, node: &NodeAddress) -> Result<()> {
        self.reach(node)?;
        for sim_node in &self.shared.nodes {
            sim_node.write().filters.clear();
        }
        Ok(())
    }

    async fn installed_filters(&self, node: &NodeAddress) -> Result<Vec<String>> {
        Ok(self.reach(node)?.read().filters.clone())
    }

    async fn get_entries(&self, node: &NodeAddress) -> Result<Vec<Entry>> {
        Ok(self.reach(node)?.read().entries.clone())
    }
}
