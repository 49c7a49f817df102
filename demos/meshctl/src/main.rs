use anyhow::{bail, Context, Result};
use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use fs_err as fs;
use meshcoord::{
    sim::SimMesh, DbKey, Entry, Mesh, MeshConfig, NodeAddress, NodeProxy, Rejected, Transport,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time::interval;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "meshctl")]
#[command(about = "Drive a mesh of sharded database nodes", long_about = None)]
struct Cli {
    #[command(flatten)]
    conn: ConnArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ConnArgs {
    /// Anchor node (e.g., 127.0.0.1,0)
    #[arg(long, global = true, default_value = "127.0.0.1,0")]
    node: NodeAddress,

    /// Node `host,id` listens on port base_port + id
    #[arg(long, global = true, default_value_t = 7000)]
    base_port: u16,

    /// JSON file with mesh client settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Upper bound on concurrent node calls
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Barrier deadline in seconds; 0 waits forever
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host a simulated mesh, one HTTP listener per node
    Serve {
        /// Host the nodes advertise and bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Number of nodes
        #[arg(long, default_value_t = 3)]
        nodes: u32,
    },
    /// Entry count of the anchor's shard
    DbSize,
    /// Entry count of the whole mesh
    DbSizeTotal,
    /// The anchor's view of the mesh
    Neighbors,
    /// Virtual agents on the anchor's hash ring
    RingSize,
    /// Entries of the anchor's shard carrying every tag
    Query { tags: Vec<String> },
    /// Entries of every node carrying every tag
    QueryAll {
        tags: Vec<String>,

        /// Keep the answers of reachable nodes when some fail
        #[arg(long)]
        partial: bool,
    },
    /// Start a filter round and return
    Process,
    /// Start a filter round and wait for the mesh to go idle
    ProcessBlocking,
    /// Add entries from a file of JSON lines
    AddDbFile { path: PathBuf },
    /// Add one entry
    AddEntry {
        value: String,

        /// Tag to attach; repeatable
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Explicit key as a,b,c
        #[arg(long, value_parser = parse_key)]
        key: Option<DbKey>,
    },
    /// Register a filter search directory on every node
    AddFilterDir { dir: PathBuf },
    /// Install a filter on every node
    InstallFilter { name: String },
    /// Remove every installed filter
    ClearFilters,
    /// Filters installed on the anchor
    InstalledFilters,
    /// Start importing a directory of shard files
    Import { dir: PathBuf },
    /// Import a directory of shard files and wait until the mesh holds them
    ImportBlocking { dir: PathBuf },
    /// Start exporting the mesh into a directory
    Export { dir: PathBuf },
    /// Export the mesh and wait until every shard file is written
    ExportBlocking { dir: PathBuf },
    /// Size, processing flag and filters of every node
    Status {
        /// Print a fresh snapshot every N seconds until interrupted
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Wait until the anchor sees a stable mesh of at least `min_nodes`
    WaitMesh {
        #[arg(default_value_t = 1)]
        min_nodes: usize,
    },
}

fn parse_key(s: &str) -> Result<DbKey> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [a, b, c] = parts.as_slice() else {
        bail!("expected a,b,c");
    };
    Ok(DbKey::new(a.parse()?, b.parse()?, c.parse()?))
}

#[derive(Serialize, Deserialize)]
struct TagsRequest {
    tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PathRequest {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FilterRequest {
    name: String,
}

/// Reaches node `host,id` over HTTP at `http://host:(base_port + id)`.
#[derive(Clone)]
struct HttpTransport {
    client: reqwest::Client,
    base_port: u16,
}

impl HttpTransport {
    fn new(base_port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_port,
        }
    }

    fn url(&self, node: &NodeAddress, route: &str) -> Result<String> {
        let port = u16::try_from(u32::from(self.base_port) + node.id())
            .with_context(|| format!("No port for node {node}"))?;
        Ok(format!("http://{}:{port}{route}", node.host()))
    }

    async fn get<R: DeserializeOwned>(&self, node: &NodeAddress, route: &str) -> Result<R> {
        let url = self.url(node, route)?;
        read_response(self.client.get(&url).send().await, &url).await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        node: &NodeAddress,
        route: &str,
        body: &B,
    ) -> Result<R> {
        let url = self.url(node, route)?;
        read_response(self.client.post(&url).json(body).send().await, &url).await
    }
}

async fn read_response<R: DeserializeOwned>(
    sent: reqwest::Result<reqwest::Response>,
    url: &str,
) -> Result<R> {
    let resp = sent.with_context(|| format!("Failed to send request to {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        // 4xx: the node refused the call; 5xx: it could not serve it.
        if status.is_client_error() {
            bail!(Rejected(format!("{url} answered {status}: {body}")));
        }
        bail!("{url} answered {status}: {body}");
    }
    resp.json::<R>()
        .await
        .with_context(|| format!("Failed to parse response from {url}"))
}

/// Paths travel to the node as given; make them absolute first so a node
/// running elsewhere resolves them the same way.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl Transport for HttpTransport {
    async fn neighbors(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>> {
        self.get(node, "/neighbors").await
    }

    async fn ring_size(&self, node: &NodeAddress) -> Result<u64> {
        self.get(node, "/ring_size").await
    }

    async fn query(&self, node: &NodeAddress, tags: &[String]) -> Result<Vec<Entry>> {
        let body = TagsRequest {
            tags: tags.to_vec(),
        };
        self.post(node, "/query", &body).await
    }

    async fn process(&self, node: &NodeAddress) -> Result<()> {
        self.post(node, "/process", &()).await
    }

    async fn processing(&self, node: &NodeAddress) -> Result<bool> {
        self.get(node, "/processing").await
    }

    async fn db_size(&self, node: &NodeAddress) -> Result<u64> {
        self.get(node, "/db_size").await
    }

    async fn import_db(&self, node: &NodeAddress, dir: &Path) -> Result<()> {
        let body = PathRequest { path: absolute(dir) };
        self.post(node, "/import", &body).await
    }

    async fn export_db(&self, node: &NodeAddress, dir: &Path) -> Result<()> {
        let body = PathRequest { path: absolute(dir) };
        self.post(node, "/export", &body).await
    }

    async fn add_entry(&self, node: &NodeAddress, entry: &Entry) -> Result<()> {
        self.post(node, "/entry", entry).await
    }

    async fn add_db_file(&self, node: &NodeAddress, path: &Path) -> Result<()> {
        let body = PathRequest {
            path: absolute(path),
        };
        self.post(node, "/db_file", &body).await
    }

    async fn add_filter_dir(&self, node: &NodeAddress, dir: &Path) -> Result<()> {
        let body = PathRequest { path: absolute(dir) };
        self.post(node, "/filter_dir", &body).await
    }

    async fn install_filter(&self, node: &NodeAddress, name: &str) -> Result<()> {
        let body = FilterRequest {
            name: name.to_string(),
        };
        self.post(node, "/filters/install", &body).await
    }

    async fn clear_filters(&self, node: &NodeAddress) -> Result<()> {
        self.post(node, "/filters/clear", &()).await
    }

    async fn installed_filters(&self, node: &NodeAddress) -> Result<Vec<String>> {
        self.get(node, "/filters").await
    }

    async fn get_entries(&self, node: &NodeAddress) -> Result<Vec<Entry>> {
        self.get(node, "/entries").await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, nodes } => serve(host, nodes, cli.conn.base_port).await,
        command => run_client(cli.conn, command).await,
    }
}

fn load_config(conn: &ConnArgs) -> Result<MeshConfig> {
    let mut config = match &conn.config {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => MeshConfig::default(),
    };
    if let Some(limit) = conn.max_concurrency {
        config = config.with_max_concurrency(limit);
    }
    if let Some(secs) = conn.deadline_secs {
        let deadline = (secs > 0).then(|| Duration::from_secs(secs));
        config = config.with_deadline(deadline);
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_client(conn: ConnArgs, command: Commands) -> Result<()> {
    let config = load_config(&conn)?;
    let transport = Arc::new(HttpTransport::new(conn.base_port));
    let mesh = Mesh::new(transport, conn.node.clone(), config)?;
    let anchor: &NodeProxy<HttpTransport> = mesh.anchor();

    match command {
        Commands::Serve { .. } => bail!("serve does not talk to an anchor"),
        Commands::DbSize => println!("{}", anchor.db_size().await?),
        Commands::DbSizeTotal => println!("{}", mesh.db_size_total().await?),
        Commands::Neighbors => {
            for addr in anchor.neighbors().await? {
                println!("{addr}");
            }
        }
        Commands::RingSize => println!("{}", anchor.ring_size().await?),
        Commands::Query { tags } => print_json(&anchor.query(&tags).await?)?,
        Commands::QueryAll { tags, partial } => {
            if partial {
                let result = mesh.query_all_partial(&tags).await?;
                if !result.failed.is_empty() {
                    error!(failed = ?result.failed, "Some nodes did not answer");
                }
                print_json(&result)?;
            } else {
                print_json(&mesh.query_all(&tags).await?)?;
            }
        }
        Commands::Process => anchor.process().await?,
        Commands::ProcessBlocking => print_json(&mesh.process_blocking().await?)?,
        Commands::AddDbFile { path } => anchor.add_db_file(&path).await?,
        Commands::AddEntry { value, tags, key } => {
            let entry = Entry::new(key.unwrap_or_default(), value).with_tags(tags);
            anchor.add_entry(&entry).await?;
        }
        Commands::AddFilterDir { dir } => anchor.add_filter_dir(&dir).await?,
        Commands::InstallFilter { name } => anchor.install_filter(&name).await?,
        Commands::ClearFilters => anchor.clear_filters().await?,
        Commands::InstalledFilters => {
            for name in anchor.installed_filters().await? {
                println!("{name}");
            }
        }
        Commands::Import { dir } => anchor.import_db(&dir).await?,
        Commands::ImportBlocking { dir } => print_json(&mesh.import_db_blocking(&dir).await?)?,
        Commands::Export { dir } => anchor.export_db(&dir).await?,
        Commands::ExportBlocking { dir } => print_json(&mesh.export_db_blocking(&dir).await?)?,
        Commands::Status { watch: None } => print_json(&mesh.status().await?)?,
        Commands::Status { watch: Some(secs) } => {
            let mut ticker = interval(Duration::from_secs(secs.max(1)));
            loop {
                ticker.tick().await;
                match mesh.status().await {
                    Ok(status) => println!(
                        "{} nodes, {} entries, {} busy, {} unreachable",
                        status.nodes.len(),
                        status.total_size(),
                        status.busy(),
                        status.unreachable.len()
                    ),
                    Err(e) => error!("Status poll failed: {e:#}"),
                }
            }
        }
        Commands::WaitMesh { min_nodes } => {
            for addr in mesh.await_mesh(min_nodes).await? {
                println!("{addr}");
            }
        }
    }

    Ok(())
}

/// Splits a multi-line value into one entry per line.
fn split_lines(entry: &Entry) -> Vec<Entry> {
    if !entry.value.contains('\n') {
        return vec![];
    }
    entry
        .value
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            Entry::new(DbKey::default(), line)
                .with_tags(entry.tags.iter().cloned())
                .with_tags(["line"])
        })
        .collect()
}

struct NodeState {
    mesh: SimMesh,
    addr: NodeAddress,
}

type SharedState = AxumState<Arc<NodeState>>;

async fn serve(host: String, nodes: u32, base_port: u16) -> Result<()> {
    if nodes == 0 {
        bail!("A mesh needs at least one node");
    }
    let mesh = SimMesh::new(&host, nodes);
    mesh.register_filter("split_lines", split_lines);

    let mut servers = tokio::task::JoinSet::new();
    for addr in mesh.addresses() {
        let port = u16::try_from(u32::from(base_port) + addr.id())
            .with_context(|| format!("No port for node {addr}"))?;
        let socket_addr: SocketAddr = format!("{host}:{port}").parse()?;
        let state = Arc::new(NodeState {
            mesh: mesh.clone(),
            addr: addr.clone(),
        });
        let app = node_router(state);
        let listener = tokio::net::TcpListener::bind(socket_addr).await?;
        info!(%addr, "Node listening on {}", socket_addr);
        servers.spawn(async move { axum::serve(listener, app).await });
    }

    while let Some(joined) = servers.join_next().await {
        joined??;
    }
    Ok(())
}

fn node_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/neighbors", get(handle_neighbors))
        .route("/ring_size", get(handle_ring_size))
        .route("/query", post(handle_query))
        .route("/process", post(handle_process))
        .route("/processing", get(handle_processing))
        .route("/db_size", get(handle_db_size))
        .route("/import", post(handle_import))
        .route("/export", post(handle_export))
        .route("/entry", post(handle_add_entry))
        .route("/db_file", post(handle_add_db_file))
        .route("/filter_dir", post(handle_add_filter_dir))
        .route("/filters", get(handle_installed_filters))
        .route("/filters/install", post(handle_install_filter))
        .route("/filters/clear", post(handle_clear_filters))
        .route("/entries", get(handle_entries))
        .with_state(state)
}

/// A failed node call with the error chain as the body: 422 for a refusal,
/// 500 for anything else.
struct NodeError(anyhow::Error);

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        error!("Request failed: {:#}", self.0);
        let status = if self.0.chain().any(|cause| cause.is::<Rejected>()) {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, format!("{:#}", self.0)).into_response()
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

type NodeResult<T> = std::result::Result<Json<T>, NodeError>;

async fn handle_neighbors(AxumState(state): SharedState) -> NodeResult<Vec<NodeAddress>> {
    Ok(Json(state.mesh.neighbors(&state.addr).await?))
}

async fn handle_ring_size(AxumState(state): SharedState) -> NodeResult<u64> {
    Ok(Json(state.mesh.ring_size(&state.addr).await?))
}

async fn handle_query(
    AxumState(state): SharedState,
    Json(req): Json<TagsRequest>,
) -> NodeResult<Vec<Entry>> {
    Ok(Json(state.mesh.query(&state.addr, &req.tags).await?))
}

async fn handle_process(AxumState(state): SharedState) -> NodeResult<()> {
    Ok(Json(state.mesh.process(&state.addr).await?))
}

async fn handle_processing(AxumState(state): SharedState) -> NodeResult<bool> {
    Ok(Json(state.mesh.processing(&state.addr).await?))
}

async fn handle_db_size(AxumState(state): SharedState) -> NodeResult<u64> {
    Ok(Json(state.mesh.db_size(&state.addr).await?))
}

async fn handle_import(
    AxumState(state): SharedState,
    Json(req): Json<PathRequest>,
) -> NodeResult<()> {
    info!(node = %state.addr, "Import requested from {}", req.path.display());
    Ok(Json(state.mesh.import_db(&state.addr, &req.path).await?))
}

async fn handle_export(
    AxumState(state): SharedState,
    Json(req): Json<PathRequest>,
) -> NodeResult<()> {
    info!(node = %state.addr, "Export requested into {}", req.path.display());
    Ok(Json(state.mesh.export_db(&state.addr, &req.path).await?))
}

async fn handle_add_entry(
    AxumState(state): SharedState,
    Json(entry): Json<Entry>,
) -> NodeResult<()> {
    Ok(Json(state.mesh.add_entry(&state.addr, &entry).await?))
}

async fn handle_add_db_file(
    AxumState(state): SharedState,
    Json(req): Json<PathRequest>,
) -> NodeResult<()> {
    Ok(Json(state.mesh.add_db_file(&state.addr, &req.path).await?))
}

async fn handle_add_filter_dir(
    AxumState(state): SharedState,
    Json(req): Json<PathRequest>,
) -> NodeResult<()> {
    Ok(Json(state.mesh.add_filter_dir(&state.addr, &req.path).await?))
}

async fn handle_installed_filters(AxumState(state): SharedState) -> NodeResult<Vec<String>> {
    Ok(Json(state.mesh.installed_filters(&state.addr).await?))
}

async fn handle_install_filter(
    AxumState(state): SharedState,
    Json(req): Json<FilterRequest>,
) -> NodeResult<()> {
    Ok(Json(state.mesh.install_filter(&state.addr, &req.name).await?))
}

async fn handle_clear_filters(AxumState(state): SharedState) -> NodeResult<()> {
    Ok(Json(state.mesh.clear_filters(&state.addr).await?))
}

async fn handle_entries(AxumState(state): SharedState) -> NodeResult<Vec<Entry>> {
    Ok(Json(state.mesh.get_entries(&state.addr).await?))
}
