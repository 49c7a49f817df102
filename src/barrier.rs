//! Blocking waits for mesh-wide conditions that nodes only expose by polling.
//!
//! No node offers a completion signal for `process`, `import_db` or
//! `export_db`, so each barrier re-reads the relevant state on a fixed
//! interval until it matches the target. Completion is best effort: a
//! processing barrier returning means every node observed in the last
//! round reported idle, not that the mesh reached a global fixpoint.
//!
//! Every barrier honours [`MeshConfig::deadline`]. Without one a barrier
//! whose condition never holds blocks forever.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::aggregate;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::fanout::{FanoutCoordinator, Targets};
use crate::manifest::{self, ImportPlan};
use crate::proxy::{NodeProxy, Transport};
use crate::types::NodeAddress;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub anchor_polls: u32,
    pub mesh_rounds: u32,
    /// Nodes polled in the final, all-idle round.
    pub observed: Vec<NodeAddress>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub plan: ImportPlan,
    pub initial_total: u64,
    pub final_total: u64,
    pub polls: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub dir: PathBuf,
    pub plan: ImportPlan,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Elapsed-time bookkeeping shared by one barrier run.
struct Clock {
    barrier: &'static str,
    started: Instant,
    deadline: Option<Duration>,
}

impl Clock {
    fn start(barrier: &'static str, deadline: Option<Duration>) -> Self {
        Self {
            barrier,
            started: Instant::now(),
            deadline,
        }
    }

    fn exceeded(&self) -> MeshError {
        MeshError::DeadlineExceeded {
            barrier: self.barrier,
            waited: self.started.elapsed(),
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    /// Sleep for `interval`, cut short by the deadline. Fails once the deadline has passed.
    async fn pause(&self, interval: Duration) -> Result<()> {
        match self.remaining() {
            Some(left) if left.is_zero() => Err(self.exceeded()),
            Some(left) => {
                sleep(interval.min(left)).await;
                Ok(())
            }
            None => {
                sleep(interval).await;
                Ok(())
            }
        }
    }

    /// Await a node call, giving up when the deadline passes.
    async fn run<R>(&self, call: impl Future<Output = Result<R>>) -> Result<R> {
        match self.remaining() {
            None => call.await,
            Some(left) => timeout(left, call).await.map_err(|_| self.exceeded())?,
        }
    }
}

pub struct ConsistencyBarrier<T: Transport> {
    fanout: Arc<FanoutCoordinator<T>>,
    config: MeshConfig,
}

impl<T: Transport> ConsistencyBarrier<T> {
    pub fn new(fanout: Arc<FanoutCoordinator<T>>, config: MeshConfig) -> Self {
        Self { fanout, config }
    }

    /// Trigger `process` on the anchor and wait until no neighbor reports processing.
    ///
    /// The anchor finishing is used as a coarse progress estimate before the
    /// rest of the mesh is polled.
    #[tracing::instrument(skip(self, anchor), fields(anchor = %anchor.addr()))]
    pub async fn process_blocking(&self, anchor: &NodeProxy<T>) -> Result<ProcessingReport> {
        let clock = Clock::start("processing", self.config.deadline);

        clock.run(anchor.process()).await?;
        info!("Processing triggered, waiting for the anchor");
        clock.pause(self.config.process_settle_delay).await?;

        let mut anchor_polls = 0;
        loop {
            anchor_polls += 1;
            if !clock.run(anchor.processing()).await? {
                break;
            }
            debug!(anchor_polls, "Anchor still processing");
            clock.pause(self.config.anchor_poll_interval).await?;
        }
        info!(anchor_polls, "Anchor idle, draining the mesh");

        let mut mesh_rounds = 0;
        loop {
            mesh_rounds += 1;
            let flags = clock
                .run(self.fanout.processing_flags(anchor, Targets::Neighbors))
                .await?;
            if !aggregate::any(flags.iter().map(|(_, busy)| *busy)) {
                let report = ProcessingReport {
                    anchor_polls,
                    mesh_rounds,
                    observed: flags.into_iter().map(|(addr, _)| addr).collect(),
                    elapsed: clock.started.elapsed(),
                };
                info!(mesh_rounds, elapsed = ?report.elapsed, "Mesh processing finished");
                return Ok(report);
            }
            let busy = flags.iter().filter(|(_, busy)| *busy).count();
            debug!(mesh_rounds, busy, "Mesh still processing");
            clock.pause(self.config.mesh_poll_interval).await?;
        }
    }

    /// Import `dir` through the anchor and wait until the mesh-wide size
    /// grows by the sum of the shard headers.
    #[tracing::instrument(skip(self, anchor), fields(anchor = %anchor.addr()))]
    pub async fn import_db_blocking(
        &self,
        anchor: &NodeProxy<T>,
        dir: &Path,
    ) -> Result<ImportReport> {
        let clock = Clock::start("import", self.config.deadline);

        let plan = plan_in_background(dir).await?;
        let initial_total = clock.run(self.fanout.db_size_total(anchor)).await?;
        let expected = initial_total
            .checked_add(plan.total)
            .ok_or_else(|| MeshError::MalformedManifest {
                path: dir.to_path_buf(),
                reason: "expected mesh size overflows u64".into(),
            })?;
        info!(
            files = plan.files.len(),
            imported = plan.total,
            initial_total,
            expected,
            "Importing"
        );

        clock.run(anchor.import_db(dir)).await?;
        clock.pause(self.config.import_settle_delay).await?;

        let mut polls = 0;
        loop {
            polls += 1;
            let total = clock.run(self.fanout.db_size_total(anchor)).await?;
            if total == expected {
                info!(polls, total, "Import converged");
                return Ok(ImportReport {
                    plan,
                    initial_total,
                    final_total: total,
                    polls,
                    elapsed: clock.started.elapsed(),
                });
            }
            debug!(polls, total, expected, "Import still converging");
            clock.pause(self.config.import_poll_interval).await?;
        }
    }

    /// Export the mesh into `dir` through the anchor and wait until the shard
    /// headers written there account for every entry.
    ///
    /// `dir` must not hold shard files yet, otherwise their headers would be
    /// counted too; such a directory fails with
    /// [`MeshError::ExportDirNotEmpty`] before anything is exported.
    #[tracing::instrument(skip(self, anchor), fields(anchor = %anchor.addr()))]
    pub async fn export_db_blocking(
        &self,
        anchor: &NodeProxy<T>,
        dir: &Path,
    ) -> Result<ExportReport> {
        let clock = Clock::start("export", self.config.deadline);

        let existing = {
            let dir = dir.to_path_buf();
            tokio::task::spawn_blocking(move || manifest::list_shard_files(&dir)).await?
        };
        match existing {
            Ok(files) if !files.is_empty() => {
                return Err(MeshError::ExportDirNotEmpty {
                    dir: dir.to_path_buf(),
                    files: files.len(),
                })
            }
            Ok(_) => {}
            // The node reports a missing directory itself.
            Err(MeshError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let expected = clock.run(self.fanout.db_size_total(anchor)).await?;
        clock.run(anchor.export_db(dir)).await?;
        info!(expected, "Export triggered");
        clock.pause(self.config.import_settle_delay).await?;

        let mut polls = 0;
        loop {
            polls += 1;
            match plan_in_background(dir).await {
                Ok(plan) if plan.total == expected => {
                    info!(polls, files = plan.files.len(), "Export complete");
                    return Ok(ExportReport {
                        dir: dir.to_path_buf(),
                        plan,
                        polls,
                        elapsed: clock.started.elapsed(),
                    });
                }
                Ok(plan) => debug!(polls, written = plan.total, expected, "Export in progress"),
                // Files still being written, or a directory the node has not created yet.
                Err(MeshError::MalformedManifest { path, .. }) => {
                    debug!(polls, path = %path.display(), "Shard file not complete yet")
                }
                Err(MeshError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(polls, "Export directory not created yet")
                }
                Err(e) => return Err(e),
            }
            clock.pause(self.config.import_poll_interval).await?;
        }
    }

    /// Wait until the anchor reports at least `min_nodes` neighbors and two
    /// consecutive polls agree on the count.
    #[tracing::instrument(skip(self, anchor), fields(anchor = %anchor.addr()))]
    pub async fn await_mesh(
        &self,
        anchor: &NodeProxy<T>,
        min_nodes: usize,
    ) -> Result<Vec<NodeAddress>> {
        let clock = Clock::start("mesh", self.config.deadline);
        let mut previous = None;
        loop {
            let view = clock.run(anchor.neighbors()).await?;
            let count = view.len();
            if count >= min_nodes && previous == Some(count) {
                info!(nodes = count, "Mesh stable");
                return Ok(view);
            }
            debug!(nodes = count, min_nodes, "Mesh not settled yet");
            previous = Some(count);
            clock.pause(self.config.mesh_settle_interval).await?;
        }
    }
}

async fn plan_in_background(dir: &Path) -> Result<ImportPlan> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || manifest::plan_import(&dir)).await?
}
