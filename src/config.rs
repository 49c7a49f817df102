use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Coordinator settings. Passed explicitly to [`crate::Mesh::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Upper bound on node calls in flight, shared by every fan-out.
    pub max_concurrency: usize,
    /// Pause between triggering `process` and the first anchor poll.
    pub process_settle_delay: Duration,
    /// Interval between anchor `processing` polls.
    pub anchor_poll_interval: Duration,
    /// Backoff between mesh-wide `processing` rounds.
    pub mesh_poll_interval: Duration,
    /// Pause between triggering `import_db` / `export_db` and the first poll.
    pub import_settle_delay: Duration,
    /// Interval between mesh-wide size (or export directory) polls.
    pub import_poll_interval: Duration,
    /// Interval between neighbor-count polls while waiting for the mesh.
    pub mesh_settle_interval: Duration,
    /// Longest any barrier may wait. `None` waits forever.
    pub deadline: Option<Duration>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            process_settle_delay: Duration::from_secs(1),
            anchor_poll_interval: Duration::from_secs(5),
            mesh_poll_interval: Duration::from_secs(15),
            import_settle_delay: Duration::from_secs(2),
            import_poll_interval: Duration::from_secs(10),
            mesh_settle_interval: Duration::from_millis(50),
            deadline: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl MeshConfig {
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_process_polling(
        mut self,
        settle: Duration,
        anchor: Duration,
        mesh: Duration,
    ) -> Self {
        self.process_settle_delay = settle;
        self.anchor_poll_interval = anchor;
        self.mesh_poll_interval = mesh;
        self
    }

    pub fn with_import_polling(mut self, settle: Duration, interval: Duration) -> Self {
        self.import_settle_delay = settle;
        self.import_poll_interval = interval;
        self
    }

    pub fn with_mesh_settle_interval(mut self, interval: Duration) -> Self {
        self.mesh_settle_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(MeshError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        let intervals = [
            ("anchor_poll_interval", self.anchor_poll_interval),
            ("mesh_poll_interval", self.mesh_poll_interval),
            ("import_poll_interval", self.import_poll_interval),
            ("mesh_settle_interval", self.mesh_settle_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(MeshError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
