//! repsnap - filesystem-consistent snapshot backups of a MongoDB replica set member
//!
//! A run discovers the replica set from one connection string, picks the
//! secondary that is safest to freeze (a passive, priority 0 member when one
//! exists), fsync-locks it, hands its host:port to an external snapshot tool
//! and unlocks it again whatever the tool did.
pub mod config;
pub mod error;
pub mod coordinator;
pub mod core;
pub mod selection;
pub mod topology;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::coordinator::node::{MongoNodeConnector, NodeConnector};
use crate::coordinator::snapshot::{ExternalSnapshotCommand, SnapshotTool};
use crate::coordinator::SnapshotCoordinator;
use crate::core::{BackupTarget, ConnectionStringSyntax};
use crate::error::BackupResult;
use crate::selection::{PassiveFirst, SelectionPolicy};
use crate::topology::mongodb::MongoClusterConnector;
use crate::topology::{ClusterConnector, ClusterTopology, TopologyDiscoverer};
use crate::utils::RunGuard;

pub use crate::coordinator::BackupReport;
pub use crate::error::BackupError;

/// What a run would do: the discovered topology and the chosen target
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub topology: ClusterTopology,
    pub target: BackupTarget,
}

/// One configured backup pipeline
pub struct RepSnap {
    syntax: ConnectionStringSyntax,
    discoverer: TopologyDiscoverer,
    policy: Box<dyn SelectionPolicy>,
    coordinator: SnapshotCoordinator,
    lock_dir: PathBuf,
}

impl RepSnap {
    /// Pipeline talking to MongoDB through the driver and running the
    /// configured snapshot command
    pub fn new(config: &Config) -> Self {
        Self::with_components(
            config,
            Arc::new(MongoClusterConnector::new(config.discovery.clone())),
            Arc::new(MongoNodeConnector::new(config.discovery.clone())),
            Arc::new(ExternalSnapshotCommand::new(config.snapshot.command.clone())),
        )
    }

    pub fn with_components(
        config: &Config,
        cluster: Arc<dyn ClusterConnector>,
        node: Arc<dyn NodeConnector>,
        tool: Arc<dyn SnapshotTool>,
    ) -> Self {
        Self {
            syntax: ConnectionStringSyntax::default(),
            discoverer: TopologyDiscoverer::new(cluster, config.discovery.clone()),
            policy: Box::new(PassiveFirst::new(config.selection.order)),
            coordinator: SnapshotCoordinator::new(node, tool),
            lock_dir: config.guard.lock_dir(),
        }
    }

    /// Replace the connection string syntax
    pub fn with_syntax(mut self, syntax: ConnectionStringSyntax) -> Self {
        self.syntax = syntax;
        self
    }

    /// Parse, discover and select without touching any lock
    pub async fn plan(&self, connection_string: &str) -> BackupResult<BackupPlan> {
        let descriptor = self.syntax.parse(connection_string)?;
        let topology = self.discoverer.discover(&descriptor).await?;
        let host = self.policy.select(&topology)?;
        let target = BackupTarget::new(&descriptor, &host);
        tracing::info!("Backup target: {}", target.descriptor());
        Ok(BackupPlan { topology, target })
    }

    /// Run a complete backup
    pub async fn run(
        &self,
        connection_string: &str,
        shutdown: watch::Receiver<bool>,
    ) -> BackupResult<BackupReport> {
        if *shutdown.borrow() {
            return Err(BackupError::interrupted("starting discovery"));
        }
        let plan = self.plan(connection_string).await?;
        let _guard = RunGuard::acquire(&self.lock_dir, plan.target.host_port())?;
        self.coordinator.run(&plan.target, shutdown).await
    }
}
