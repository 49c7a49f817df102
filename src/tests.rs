use crate::aggregate;
use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::fanout::Targets;
use crate::manifest::{self, plan_import, SHARD_HEADER_LEN};
use crate::mesh::Mesh;
use crate::proxy::Transport;
use crate::sim::{self, SimLatency, SimMesh};
use crate::types::{DbKey, Entry, NodeAddress};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOST: &str = "127.0.0.1";

fn addr(id: u32) -> NodeAddress {
    NodeAddress::new(HOST, id)
}

fn mesh_of(nodes: &SimMesh, config: MeshConfig) -> Mesh<SimMesh> {
    Mesh::new(Arc::new(nodes.clone()), addr(0), config).unwrap()
}

fn tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

fn block(n: u32) -> Entry {
    Entry::new(DbKey::default(), format!("{{\"height\": {n}}}")).with_tags(["BTC", "block"])
}

/// Expands a block into six transactions.
fn block_to_tx(entry: &Entry) -> Vec<Entry> {
    if !entry.has_tag("block") {
        return vec![];
    }
    (0..6)
        .map(|i| Entry::new(DbKey::default(), format!("tx {i}")).with_tags(["BTC", "tx"]))
        .collect()
}

fn write_entry_file(dir: &Path, name: &str, entries: &[Entry]) -> PathBuf {
    let path = dir.join(name);
    let lines: Vec<String> = entries
        .iter()
        .map(|e| serde_json::to_string(e).unwrap())
        .collect();
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[tokio::test]
async fn test_address_parse_and_display() {
    let parsed: NodeAddress = "127.0.0.1,3".parse().unwrap();
    assert_eq!(parsed, addr(3));
    assert_eq!(parsed.host(), "127.0.0.1");
    assert_eq!(parsed.id(), 3);
    assert_eq!(parsed.to_string(), "127.0.0.1,3");

    // Whitespace around either half is tolerated
    let spaced: NodeAddress = " 10.0.0.1 , 7 ".parse().unwrap();
    assert_eq!(spaced, NodeAddress::new("10.0.0.1", 7));
}

#[tokio::test]
async fn test_address_rejects_malformed() {
    for input in ["127.0.0.1", ",3", "127.0.0.1,", "127.0.0.1,x", "127.0.0.1,-1"] {
        let err = input.parse::<NodeAddress>().unwrap_err();
        assert!(
            matches!(err, MeshError::InvalidAddress { .. }),
            "{input:?} gave {err:?}"
        );
    }
}

#[tokio::test]
async fn test_address_serializes_as_string() {
    let json = serde_json::to_string(&addr(3)).unwrap();
    assert_eq!(json, "\"127.0.0.1,3\"");
    let back: NodeAddress = serde_json::from_str(&json).unwrap();
    assert_eq!(back, addr(3));
    assert!(serde_json::from_str::<NodeAddress>("\"nope\"").is_err());
}

#[tokio::test]
async fn test_entry_value_and_tags() {
    let mut entry = Entry::default();
    assert_eq!(entry.value, "");
    entry.add_to_value("foo");
    assert_eq!(entry.value, "foo\n");
    entry.set_value("my value");
    assert_eq!(entry.value, "my value");

    entry.add_tag("TEST1");
    entry.add_tag("TEST2");
    entry.add_tag("TEST1");
    assert_eq!(entry.tags.len(), 2);
    assert!(entry.has_tag("TEST2"));

    // Superset semantics: every queried tag must be present
    assert!(entry.matches(&["TEST1"]));
    assert!(entry.matches(&["TEST1", "TEST2"]));
    assert!(!entry.matches(&["TEST1", "OTHER"]));
    let empty: [&str; 0] = [];
    assert!(!entry.matches(&empty));
}

#[tokio::test]
async fn test_dbkey_ordering() {
    let mut keys = vec![
        DbKey::new(2, 0, 0),
        DbKey::new(1, 5, -3),
        DbKey::new(1, 5, -4),
        DbKey::new(1, -2, 9),
    ];
    keys.sort();
    assert_eq!(
        keys,
        vec![
            DbKey::new(1, -2, 9),
            DbKey::new(1, 5, -4),
            DbKey::new(1, 5, -3),
            DbKey::new(2, 0, 0),
        ]
    );
}

#[tokio::test]
async fn test_aggregate_reducers() {
    assert_eq!(aggregate::sum([3, 0, 4]), 7);
    assert_eq!(aggregate::sum(Vec::<u64>::new()), 0);
    assert_eq!(aggregate::concat(vec![vec![1, 2], vec![], vec![3]]), vec![1, 2, 3]);
    // Duplicates across nodes are kept
    assert_eq!(aggregate::concat(vec![vec![1], vec![1]]).len(), 2);
    assert!(aggregate::any([false, true]));
    assert!(!aggregate::any([false, false]));
    assert!(!aggregate::any(Vec::<bool>::new()));
}

#[tokio::test]
async fn test_config_defaults_and_validation() {
    let config = MeshConfig::default();
    assert_eq!(config.max_concurrency, 32);
    assert_eq!(config.mesh_poll_interval, Duration::from_secs(15));
    assert_eq!(config.import_poll_interval, Duration::from_secs(10));
    assert!(config.deadline.is_some());
    assert!(config.validate().is_ok());

    let zero_pool = MeshConfig::default().with_max_concurrency(0);
    assert!(matches!(zero_pool.validate(), Err(MeshError::InvalidConfig(_))));

    let zero_interval =
        MeshConfig::default().with_import_polling(Duration::from_secs(1), Duration::ZERO);
    assert!(zero_interval.validate().is_err());

    let nodes = SimMesh::new(HOST, 1);
    assert!(Mesh::new(Arc::new(nodes), addr(0), zero_pool).is_err());
}

#[tokio::test]
async fn test_plan_import_sums_headers() {
    let dir = TempDir::new().unwrap();
    sim::write_shard_file(&dir.path().join("b.shard"), &[block(1), block(2)]).unwrap();
    sim::write_shard_file(&dir.path().join("a.shard"), &vec![block(3); 5]).unwrap();
    // Hidden files and subdirectories are not part of the manifest
    std::fs::write(dir.path().join(".staging.tmp"), 99u64.to_le_bytes()).unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();

    let plan = plan_import(dir.path()).unwrap();
    assert_eq!(plan.total, 7);
    assert_eq!(plan.files.len(), 2);
    assert_eq!(plan.files[0].path, dir.path().join("a.shard"));
    assert_eq!(plan.files[0].entries, 5);
    assert_eq!(plan.files[1].entries, 2);
}

#[tokio::test]
async fn test_plan_import_trusts_header_only() {
    let dir = TempDir::new().unwrap();
    // Header claims 42 entries, the body is not inspected
    let mut bytes = manifest::encode_shard_header(42).to_vec();
    bytes.extend_from_slice(b"opaque engine data");
    std::fs::write(dir.path().join("shard"), bytes).unwrap();

    let plan = plan_import(dir.path()).unwrap();
    assert_eq!(plan.total, 42);

    let empty = TempDir::new().unwrap();
    assert_eq!(plan_import(empty.path()).unwrap().total, 0);
}

#[tokio::test]
async fn test_plan_import_rejects_short_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("truncated"), [1u8, 0, 0]).unwrap();

    let err = plan_import(dir.path()).unwrap_err();
    match err {
        MeshError::MalformedManifest { path, .. } => {
            assert_eq!(path, dir.path().join("truncated"))
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(manifest::decode_shard_header(&[0u8; SHARD_HEADER_LEN - 1]), None);
}

#[tokio::test]
async fn test_plan_import_missing_dir() {
    let dir = TempDir::new().unwrap();
    let err = plan_import(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, MeshError::Io(_)));
}

#[tokio::test]
async fn test_shard_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node_0.shard");
    let entries = vec![block(1).with_tags(["extra"]), block(2)];
    sim::write_shard_file(&path, &entries).unwrap();

    assert_eq!(manifest::read_shard_header(&path).unwrap(), 2);
    let (declared, decoded) = sim::read_shard_file(&path).unwrap();
    assert_eq!(declared, 2);
    assert_eq!(decoded, entries);
    // The staging file was renamed into place
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_size_additivity() {
    let nodes = SimMesh::new(HOST, 3);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..20).map(block).collect();
    let file = write_entry_file(dir.path(), "blocks.txt", &blocks);

    assert_eq!(mesh.db_size_total().await.unwrap(), 0);
    mesh.anchor().add_db_file(&file).await.unwrap();

    let local: usize = nodes.local_sizes().iter().map(|(_, n)| n).sum();
    assert_eq!(local, 20);
    assert_eq!(mesh.db_size_total().await.unwrap(), 20);

    let mut per_node = 0;
    for address in nodes.addresses() {
        per_node += mesh.node(address).db_size().await.unwrap();
    }
    assert_eq!(per_node, 20);
}

#[tokio::test]
async fn test_add_entry() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());

    let mut entry = Entry::new(DbKey::new(1, 1, 1), "VAL");
    entry.add_tag("TEST1");
    entry.add_tag("TEST2");
    mesh.anchor().add_entry(&entry).await.unwrap();

    assert_eq!(mesh.db_size_total().await.unwrap(), 1);
    let found = mesh.query_all(&tags(&["TEST1", "TEST2"])).await.unwrap();
    assert_eq!(found, vec![entry]);
}

#[tokio::test]
async fn test_repeated_add_db_file_accumulates() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let file = write_entry_file(dir.path(), "btc.txt", &[block(1), block(2)]);

    for round in 1..=3 {
        mesh.anchor().add_db_file(&file).await.unwrap();
        assert_eq!(mesh.db_size_total().await.unwrap(), 2 * round);
    }
}

#[tokio::test]
async fn test_add_db_file_rejects_invalid_lines() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.txt");
    std::fs::write(&path, "{\"tags\": [\"BTC\"]}\nnot json\n").unwrap();

    let err = mesh.anchor().add_db_file(&path).await.unwrap_err();
    assert!(matches!(err, MeshError::NodeRejected { .. }));
    assert_eq!(err.node(), Some(&addr(0)));
    assert_eq!(mesh.db_size_total().await.unwrap(), 0);
}

#[tokio::test]
async fn test_neighbors_include_self() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    assert_eq!(mesh.anchor().num_neighbors().await.unwrap(), 2);
    assert_eq!(mesh.node(addr(1)).neighbors().await.unwrap(), vec![addr(0), addr(1)]);
}

#[tokio::test]
async fn test_query_all_across_nodes() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let eth = Entry::new(DbKey::default(), "{}").with_tags(["ETH", "block"]);
    let file = write_entry_file(dir.path(), "mixed.txt", &[block(1), block(2), eth]);
    mesh.anchor().add_db_file(&file).await.unwrap();

    let btc = mesh.query_all(&tags(&["BTC"])).await.unwrap();
    assert_eq!(btc.len(), 2);
    assert!(btc.iter().all(|e| e.has_tag("BTC")));

    assert_eq!(mesh.query_all(&tags(&["block"])).await.unwrap().len(), 3);
    assert_eq!(mesh.query_all(&tags(&["ETH", "block"])).await.unwrap().len(), 1);
    assert!(mesh.query_all(&tags(&["DOGE"])).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_query_all_matches_independent_queries() {
    let nodes = SimMesh::new(HOST, 4);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..12).map(block).collect();
    let file = write_entry_file(dir.path(), "blocks.txt", &blocks);
    mesh.anchor().add_db_file(&file).await.unwrap();

    let query = tags(&["BTC"]);
    let mut expected = Vec::new();
    for neighbor in mesh.anchor().neighbors().await.unwrap() {
        expected.extend(mesh.node(neighbor).query(&query).await.unwrap());
    }
    let mut fanned = mesh.query_all(&query).await.unwrap();

    // Order across nodes is unspecified
    expected.sort_by_key(|e| e.key);
    fanned.sort_by_key(|e| e.key);
    assert_eq!(fanned, expected);
}

#[tokio::test]
async fn test_query_all_uses_reported_view() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..10).map(block).collect();
    mesh.anchor()
        .add_db_file(&write_entry_file(dir.path(), "b.txt", &blocks))
        .await
        .unwrap();

    // A stale view that only knows the anchor limits the fan-out to it
    nodes.set_view(&addr(0), Some(vec![addr(0)]));
    let anchor_only = mesh.anchor().query(&tags(&["BTC"])).await.unwrap();
    let fanned = mesh.query_all(&tags(&["BTC"])).await.unwrap();
    assert_eq!(fanned.len(), anchor_only.len());

    nodes.set_view(&addr(0), None);
    assert_eq!(mesh.query_all(&tags(&["BTC"])).await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_query_all_aborts_on_unreachable_neighbor() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    nodes.set_unreachable(&addr(1), true);

    let err = mesh.query_all(&tags(&["BTC"])).await.unwrap_err();
    assert!(matches!(err, MeshError::NodeUnreachable { .. }));
    assert_eq!(err.node(), Some(&addr(1)));

    // Sizes fail the same way
    assert!(mesh.db_size_total().await.is_err());
}

#[tokio::test]
async fn test_unreachable_anchor_fails_before_fanout() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    nodes.set_unreachable(&addr(0), true);

    let err = mesh.query_all(&tags(&["BTC"])).await.unwrap_err();
    assert_eq!(err.node(), Some(&addr(0)));
}

#[tokio::test]
async fn test_partial_query_keeps_answers() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..10).map(block).collect();
    mesh.anchor()
        .add_db_file(&write_entry_file(dir.path(), "b.txt", &blocks))
        .await
        .unwrap();
    let on_anchor = mesh.anchor().query(&tags(&["BTC"])).await.unwrap().len();

    nodes.set_unreachable(&addr(1), true);
    let partial = mesh.query_all_partial(&tags(&["BTC"])).await.unwrap();
    assert_eq!(partial.failed, vec![addr(1)]);
    assert_eq!(partial.entries.len(), on_anchor);
}

#[tokio::test]
async fn test_settled_outcome_reports_partial_failure() {
    let nodes = SimMesh::new(HOST, 3);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    nodes.set_unreachable(&addr(2), true);

    let outcome = mesh
        .fanout()
        .fanout_map_settled(mesh.anchor(), Targets::MeshWide, |node| async move {
            node.db_size().await
        })
        .await
        .unwrap();
    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.results.len(), 2);
    assert!(!outcome.is_complete());

    match outcome.into_complete().unwrap_err() {
        MeshError::FanoutPartialFailure {
            failed,
            total,
            source,
        } => {
            assert_eq!(failed, vec![addr(2)]);
            assert_eq!(total, 3);
            assert!(matches!(*source, MeshError::NodeUnreachable { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_db_size_total_counts_anchor_once() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..8).map(block).collect();
    mesh.anchor()
        .add_db_file(&write_entry_file(dir.path(), "b.txt", &blocks))
        .await
        .unwrap();

    // The anchor is always counted, whether or not it lists itself
    nodes.set_view(&addr(0), Some(vec![addr(1)]));
    assert_eq!(mesh.db_size_total().await.unwrap(), 8);
    nodes.set_view(&addr(0), Some(vec![addr(1), addr(0), addr(1)]));
    assert_eq!(mesh.db_size_total().await.unwrap(), 8);
}

/// Delegates to a simulated mesh and records how many `db_size` calls overlap.
struct CountingTransport {
    inner: SimMesh,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Transport for CountingTransport {
    async fn neighbors(&self, node: &NodeAddress) -> anyhow::Result<Vec<NodeAddress>> {
        self.inner.neighbors(node).await
    }

    async fn ring_size(&self, node: &NodeAddress) -> anyhow::Result<u64> {
        self.inner.ring_size(node).await
    }

    async fn query(&self, node: &NodeAddress, tags: &[String]) -> anyhow::Result<Vec<Entry>> {
        self.inner.query(node, tags).await
    }

    async fn process(&self, node: &NodeAddress) -> anyhow::Result<()> {
        self.inner.process(node).await
    }

    async fn processing(&self, node: &NodeAddress) -> anyhow::Result<bool> {
        self.inner.processing(node).await
    }

    async fn db_size(&self, node: &NodeAddress) -> anyhow::Result<u64> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.db_size(node).await
    }

    async fn import_db(&self, node: &NodeAddress, dir: &Path) -> anyhow::Result<()> {
        self.inner.import_db(node, dir).await
    }

    async fn export_db(&self, node: &NodeAddress, dir: &Path) -> anyhow::Result<()> {
        self.inner.export_db(node, dir).await
    }

    async fn add_entry(&self, node: &NodeAddress, entry: &Entry) -> anyhow::Result<()> {
        self.inner.add_entry(node, entry).await
    }

    async fn add_db_file(&self, node: &NodeAddress, path: &Path) -> anyhow::Result<()> {
        self.inner.add_db_file(node, path).await
    }

    async fn add_filter_dir(&self, node: &NodeAddress, dir: &Path) -> anyhow::Result<()> {
        self.inner.add_filter_dir(node, dir).await
    }

    async fn install_filter(&self, node: &NodeAddress, name: &str) -> anyhow::Result<()> {
        self.inner.install_filter(node, name).await
    }

    async fn clear_filters(&self, node: &NodeAddress) -> anyhow::Result<()> {
        self.inner.clear_filters(node).await
    }

    async fn installed_filters(&self, node: &NodeAddress) -> anyhow::Result<Vec<String>> {
        self.inner.installed_filters(node).await
    }

    async fn get_entries(&self, node: &NodeAddress) -> anyhow::Result<Vec<Entry>> {
        self.inner.get_entries(node).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_fanout_respects_concurrency_limit() {
    let transport = Arc::new(CountingTransport {
        inner: SimMesh::new(HOST, 10),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let config = MeshConfig::default().with_max_concurrency(3);
    let mesh = Mesh::new(transport.clone(), addr(0), config).unwrap();
    assert_eq!(mesh.fanout().max_concurrency(), 3);

    assert_eq!(mesh.db_size_total().await.unwrap(), 0);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 3);

    // The pool is shared by concurrent fan-outs on the same client
    transport.peak.store(0, Ordering::SeqCst);
    let (a, b) = tokio::join!(mesh.db_size_total(), mesh.db_size_total());
    assert_eq!(a.unwrap() + b.unwrap(), 0);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 3);
    assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_processing_flag_reports_running_round() {
    let nodes = SimMesh::with_latency(
        HOST,
        2,
        SimLatency {
            process: Duration::from_millis(50),
            ..SimLatency::default()
        },
    );
    let mesh = mesh_of(&nodes, MeshConfig::default());

    assert!(!mesh.anchor().processing().await.unwrap());
    assert!(!mesh.is_processing().await.unwrap());

    mesh.anchor().process().await.unwrap();
    assert!(mesh.anchor().processing().await.unwrap());
    assert!(mesh.is_processing().await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!mesh.is_processing().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_process_blocking_expands_blocks() {
    let nodes = SimMesh::new(HOST, 2);
    nodes.register_filter("BTC_block_to_tx", block_to_tx);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    mesh.anchor()
        .add_db_file(&write_entry_file(dir.path(), "btc.txt", &[block(1)]))
        .await
        .unwrap();
    mesh.anchor().install_filter("BTC_block_to_tx").await.unwrap();

    let report = mesh.process_blocking().await.unwrap();

    assert_eq!(mesh.db_size_total().await.unwrap(), 7);
    assert_eq!(mesh.query_all(&tags(&["tx"])).await.unwrap().len(), 6);
    assert_eq!(report.observed.len(), 2);
    assert!(!mesh.is_processing().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_process_blocking_waits_for_slow_neighbors() {
    let nodes = SimMesh::with_latency(
        HOST,
        2,
        SimLatency {
            process: Duration::from_secs(10),
            ..SimLatency::default()
        },
    );
    let mesh = mesh_of(&nodes, MeshConfig::default());

    // Anchor finishes at 10s, the neighbor at 20s. Anchor polls land at
    // 1s, 6s and 11s; mesh rounds at 11s and 26s.
    let report = mesh.process_blocking().await.unwrap();
    assert_eq!(report.anchor_polls, 3);
    assert_eq!(report.mesh_rounds, 2);
    assert!(report.elapsed >= Duration::from_secs(26));
    assert!(report.elapsed < Duration::from_secs(27));
    for address in nodes.addresses() {
        assert!(!mesh.node(address).processing().await.unwrap());
    }
}

#[tokio::test(start_paused = true)]
async fn test_process_blocking_follows_growing_view() {
    let nodes = SimMesh::with_latency(
        HOST,
        3,
        SimLatency {
            process: Duration::from_secs(10),
            ..SimLatency::default()
        },
    );
    nodes.set_view(&addr(0), Some(vec![addr(0), addr(1)]));
    nodes.hold_processing(&addr(2), true);
    let mesh = mesh_of(&nodes, MeshConfig::default());

    // The anchor learns about node 2 between the first and second mesh
    // rounds; node 2 keeps processing until 50s.
    let membership = nodes.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        membership.set_view(&addr(0), Some(vec![addr(0), addr(1), addr(2)]));
        tokio::time::sleep(Duration::from_secs(35)).await;
        membership.hold_processing(&addr(2), false);
    });

    // Mesh rounds land at 11s, 26s, 41s and 56s
    let report = mesh.process_blocking().await.unwrap();
    assert_eq!(report.anchor_polls, 3);
    assert_eq!(report.mesh_rounds, 4);
    let mut observed = report.observed.clone();
    observed.sort();
    assert_eq!(observed, vec![addr(0), addr(1), addr(2)]);
    assert!(report.elapsed >= Duration::from_secs(56));
    assert!(!mesh.node(addr(2)).processing().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_process_blocking_deadline() {
    let nodes = SimMesh::new(HOST, 2);
    nodes.hold_processing(&addr(1), true);
    let config = MeshConfig::default().with_deadline(Some(Duration::from_secs(60)));
    let mesh = mesh_of(&nodes, config);

    let err = mesh.process_blocking().await.unwrap_err();
    match err {
        MeshError::DeadlineExceeded { barrier, waited } => {
            assert_eq!(barrier, "processing");
            assert!(waited >= Duration::from_secs(60));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    nodes.hold_processing(&addr(1), false);
    assert!(mesh.process_blocking().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_process_blocking_fails_on_unreachable_neighbor() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    nodes.set_unreachable(&addr(1), true);

    let err = mesh.process_blocking().await.unwrap_err();
    assert_eq!(err.node(), Some(&addr(1)));
}

#[tokio::test(start_paused = true)]
async fn test_import_db_blocking_into_empty_mesh() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    sim::write_shard_file(&dir.path().join("node_0.shard"), &[block(1), block(2)]).unwrap();

    assert_eq!(mesh.db_size_total().await.unwrap(), 0);
    let report = mesh.import_db_blocking(dir.path()).await.unwrap();

    assert_eq!(report.initial_total, 0);
    assert_eq!(report.plan.total, 2);
    assert_eq!(report.final_total, 2);
    assert_eq!(mesh.db_size_total().await.unwrap(), 2);
    let per_node: u64 = nodes.local_sizes().iter().map(|(_, n)| *n as u64).sum();
    assert_eq!(per_node, 2);
}

#[tokio::test(start_paused = true)]
async fn test_import_db_blocking_adds_to_existing_entries() {
    let nodes = SimMesh::with_latency(
        HOST,
        3,
        SimLatency {
            import: Duration::from_secs(5),
            ..SimLatency::default()
        },
    );
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let existing = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..3).map(block).collect();
    mesh.anchor()
        .add_db_file(&write_entry_file(existing.path(), "b.txt", &blocks))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    sim::write_shard_file(&dir.path().join("a.shard"), &[block(10)]).unwrap();
    sim::write_shard_file(&dir.path().join("b.shard"), &[block(11), block(12)]).unwrap();

    // Import lands at 5s: the poll after the 2s settle misses it, the next one at 12s sees it
    let report = mesh.import_db_blocking(dir.path()).await.unwrap();
    assert_eq!(report.initial_total, 3);
    assert_eq!(report.final_total, 6);
    assert_eq!(report.polls, 2);
    assert!(report.elapsed >= Duration::from_secs(12));
    assert!(report.elapsed < Duration::from_secs(13));
}

#[tokio::test(start_paused = true)]
async fn test_import_rejects_malformed_manifest() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    sim::write_shard_file(&dir.path().join("good.shard"), &[block(1)]).unwrap();
    std::fs::write(dir.path().join("short.shard"), [2u8, 0, 0, 0]).unwrap();

    let err = mesh.import_db_blocking(dir.path()).await.unwrap_err();
    assert!(matches!(err, MeshError::MalformedManifest { .. }));

    // Planning failed, so nothing was imported
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mesh.db_size_total().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_import_with_inflated_header_hits_deadline() {
    let nodes = SimMesh::new(HOST, 2);
    let config = MeshConfig::default().with_deadline(Some(Duration::from_secs(60)));
    let mesh = mesh_of(&nodes, config);
    let dir = TempDir::new().unwrap();

    // Header promises three entries, the body carries two
    let mut bytes = sim::encode_shard(&[block(1), block(2)]).unwrap();
    bytes[..SHARD_HEADER_LEN].copy_from_slice(&manifest::encode_shard_header(3));
    std::fs::write(dir.path().join("node_0.shard"), bytes).unwrap();

    let err = mesh.import_db_blocking(dir.path()).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::DeadlineExceeded {
            barrier: "import",
            ..
        }
    ));
    assert_eq!(mesh.db_size_total().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_export_then_import_into_fresh_mesh() {
    let source = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&source, MeshConfig::default());
    let data = TempDir::new().unwrap();
    mesh.anchor()
        .add_db_file(&write_entry_file(data.path(), "btc.txt", &[block(1), block(2)]))
        .await
        .unwrap();

    let export = TempDir::new().unwrap();
    let report = mesh.export_db_blocking(export.path()).await.unwrap();
    assert_eq!(report.plan.files.len(), 2);
    assert_eq!(report.plan.total, 2);

    // A new mesh with different ids imports what the first one exported
    let target = SimMesh::new("127.0.0.2", 2);
    let fresh = Mesh::new(
        Arc::new(target.clone()),
        NodeAddress::new("127.0.0.2", 0),
        MeshConfig::default(),
    )
    .unwrap();
    assert_eq!(fresh.await_mesh(2).await.unwrap().len(), 2);
    assert_eq!(fresh.db_size_total().await.unwrap(), 0);

    fresh.import_db_blocking(export.path()).await.unwrap();
    assert_eq!(fresh.db_size_total().await.unwrap(), 2);
    let mut imported = fresh.query_all(&tags(&["BTC"])).await.unwrap();
    let mut original = mesh.query_all(&tags(&["BTC"])).await.unwrap();
    imported.sort_by_key(|e| e.key);
    original.sort_by_key(|e| e.key);
    assert_eq!(imported, original);
}

#[tokio::test(start_paused = true)]
async fn test_export_rejects_missing_directory() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();

    // The node refuses to export into a directory that does not exist
    let err = mesh
        .export_db_blocking(&dir.path().join("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NodeRejected { .. }));
    assert_eq!(err.node(), Some(&addr(0)));
}

#[tokio::test(start_paused = true)]
async fn test_export_rejects_directory_with_shard_files() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    // Left over from an earlier, larger mesh
    sim::write_shard_file(&dir.path().join("node_7.shard"), &[block(1), block(2)]).unwrap();

    let err = mesh.export_db_blocking(dir.path()).await.unwrap_err();
    match err {
        MeshError::ExportDirNotEmpty { dir: rejected, files } => {
            assert_eq!(rejected, dir.path());
            assert_eq!(files, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Nothing was exported
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manifest::list_shard_files(dir.path()).unwrap().len(), 1);

    // Hidden staging files do not count
    let clean = TempDir::new().unwrap();
    std::fs::write(clean.path().join(".node_0.shard.tmp"), [0u8; 3]).unwrap();
    let report = mesh.export_db_blocking(clean.path()).await.unwrap();
    assert_eq!(report.plan.files.len(), 2);
    assert!(mesh.export_db_blocking(clean.path()).await.is_err());
}

#[tokio::test]
async fn test_install_and_clear_filters_mesh_wide() {
    let nodes = SimMesh::new(HOST, 2);
    nodes.register_filter("BTC_block_to_tx", block_to_tx);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let filter_dir = TempDir::new().unwrap();

    mesh.anchor().add_filter_dir(filter_dir.path()).await.unwrap();
    mesh.anchor().install_filter("BTC_block_to_tx").await.unwrap();
    mesh.anchor().install_filter("BTC_block_to_tx").await.unwrap();
    assert_eq!(mesh.anchor().installed_filters().await.unwrap().len(), 1);
    assert_eq!(mesh.node(addr(1)).installed_filters().await.unwrap().len(), 1);

    mesh.anchor().clear_filters().await.unwrap();
    assert!(mesh.anchor().installed_filters().await.unwrap().is_empty());
    assert!(mesh.node(addr(1)).installed_filters().await.unwrap().is_empty());

    assert_eq!(nodes.filter_dirs(&addr(1)), vec![filter_dir.path().to_path_buf()]);
    mesh.anchor().add_filter_dir(filter_dir.path()).await.unwrap();
    assert_eq!(nodes.filter_dirs(&addr(0)).len(), 1);

    assert!(mesh.anchor().install_filter("no_such_filter").await.is_err());
    assert!(mesh
        .anchor()
        .add_filter_dir(&filter_dir.path().join("missing"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_refused_call_is_not_unreachable() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());

    // The node answers, then refuses a filter it does not know
    assert_eq!(mesh.anchor().db_size().await.unwrap(), 0);
    let err = mesh.anchor().install_filter("no_such_filter").await.unwrap_err();
    assert!(matches!(err, MeshError::NodeRejected { .. }), "{err:?}");
    assert_eq!(err.node(), Some(&addr(0)));
    assert!(err.to_string().contains("no_such_filter"));

    // The same call against a node that cannot be contacted
    nodes.set_unreachable(&addr(0), true);
    let err = mesh.anchor().install_filter("no_such_filter").await.unwrap_err();
    assert!(matches!(err, MeshError::NodeUnreachable { .. }), "{err:?}");

    // A refusal inside a strict fan-out comes back unchanged
    nodes.set_unreachable(&addr(0), false);
    let dir = TempDir::new().unwrap();
    let err = mesh
        .fanout()
        .fanout_map(mesh.anchor(), Targets::Neighbors, |node| {
            let missing = dir.path().join("missing");
            async move { node.add_filter_dir(&missing).await }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NodeRejected { .. }));
}

#[tokio::test]
async fn test_ring_size_counts_members() {
    let nodes = SimMesh::new(HOST, 3);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    assert_eq!(mesh.anchor().ring_size().await.unwrap(), 3 * sim::VAGENTS_PER_NODE);

    nodes.set_view(&addr(0), Some(vec![addr(0)]));
    assert_eq!(mesh.anchor().ring_size().await.unwrap(), sim::VAGENTS_PER_NODE);
}

#[tokio::test]
async fn test_get_entries_returns_local_shard() {
    let nodes = SimMesh::new(HOST, 2);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..6).map(block).collect();
    mesh.anchor()
        .add_db_file(&write_entry_file(dir.path(), "b.txt", &blocks))
        .await
        .unwrap();

    let mut seen = 0;
    for address in nodes.addresses() {
        let node = mesh.node(address);
        let entries = node.get_entries().await.unwrap();
        assert_eq!(entries.len() as u64, node.db_size().await.unwrap());
        for entry in &entries {
            assert_eq!(entry.tags.len(), 2);
            assert!(entry.has_tag("BTC") && entry.has_tag("block"));
            assert!(serde_json::from_str::<serde_json::Value>(&entry.value).is_ok());
        }
        seen += entries.len();
    }
    assert_eq!(seen, 6);
}

#[tokio::test(start_paused = true)]
async fn test_await_mesh() {
    let nodes = SimMesh::new(HOST, 3);
    let config = MeshConfig::default().with_deadline(Some(Duration::from_secs(1)));
    let mesh = mesh_of(&nodes, config);

    let view = mesh.await_mesh(3).await.unwrap();
    assert_eq!(view.len(), 3);

    let err = mesh.await_mesh(4).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::DeadlineExceeded { barrier: "mesh", .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_await_mesh_waits_for_stable_count() {
    let nodes = SimMesh::new(HOST, 3);
    nodes.set_view(&addr(0), Some(vec![addr(0)]));
    let mesh = mesh_of(&nodes, MeshConfig::default());

    // Nodes join at 25ms and 75ms; polls run every 50ms from 0
    let membership = nodes.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        membership.set_view(&addr(0), Some(vec![addr(0), addr(1)]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        membership.set_view(&addr(0), None);
    });

    let started = tokio::time::Instant::now();
    let view = mesh.await_mesh(2).await.unwrap();
    // Polls see 1, 2, 3 and 3 nodes; the count first repeats at 150ms
    assert_eq!(view.len(), 3);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_status_lists_unreachable_nodes() {
    let nodes = SimMesh::new(HOST, 3);
    let mesh = mesh_of(&nodes, MeshConfig::default());
    let dir = TempDir::new().unwrap();
    let blocks: Vec<Entry> = (0..9).map(block).collect();
    mesh.anchor()
        .add_db_file(&write_entry_file(dir.path(), "b.txt", &blocks))
        .await
        .unwrap();
    let expected: u64 = nodes
        .local_sizes()
        .iter()
        .filter(|(a, _)| *a != addr(2))
        .map(|(_, n)| *n as u64)
        .sum();

    nodes.set_unreachable(&addr(2), true);
    let status = mesh.status().await.unwrap();
    assert_eq!(status.anchor, addr(0));
    assert_eq!(status.unreachable, vec![addr(2)]);
    assert_eq!(
        status.nodes.iter().map(|n| n.addr.clone()).collect::<Vec<_>>(),
        vec![addr(0), addr(1)]
    );
    assert_eq!(status.total_size(), expected);
    assert_eq!(status.busy(), 0);
}
