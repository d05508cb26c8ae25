/// Backup target selection policies
use crate::config::SelectionOrder;
use crate::error::{BackupError, BackupResult};
use crate::topology::{ClusterTopology, MemberInfo};
use std::cmp::Ordering;

/// Selection policy trait
pub trait SelectionPolicy: Send + Sync {
    /// Pick the secondary to freeze, returning its host:port
    fn select(&self, topology: &ClusterTopology) -> BackupResult<String>;
}

/// Prefer the first passive (priority 0) secondary, else the first secondary
pub struct PassiveFirst {
    order: SelectionOrder,
}

impl PassiveFirst {
    pub fn new(order: SelectionOrder) -> Self {
        Self { order }
    }

    /// Secondaries in the order the scan should visit them
    fn candidates<'a>(&self, topology: &'a ClusterTopology) -> Vec<(&'a str, &'a MemberInfo)> {
        let mut candidates: Vec<_> = topology.secondaries().collect();
        if self.order == SelectionOrder::Priority {
            // stable: equal keys keep discovery order
            candidates.sort_by(|(host_a, a), (host_b, b)| {
                a.priority
                    .partial_cmp(&b.priority)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| host_a.cmp(host_b))
            });
        }
        candidates
    }
}

impl Default for PassiveFirst {
    fn default() -> Self {
        Self::new(SelectionOrder::Discovery)
    }
}

impl SelectionPolicy for PassiveFirst {
    fn select(&self, topology: &ClusterTopology) -> BackupResult<String> {
        let candidates = self.candidates(topology);

        let (host, info) = candidates
            .iter()
            .find(|(_, info)| info.is_passive())
            .or_else(|| candidates.first())
            .ok_or_else(|| BackupError::availability("no secondary available"))?;

        if info.is_passive() {
            tracing::info!("Selected passive secondary {}", host);
        } else {
            tracing::info!(
                "No passive secondary found, selected {} (priority {})",
                host,
                info.priority
            );
        }
        Ok(host.to_string())
    }
}
