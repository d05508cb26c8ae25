/// Replica set topology discovery
pub mod mongodb;

use crate::config::DiscoveryConfig;
use crate::core::ConnectionDescriptor;
use crate::error::{BackupError, BackupResult};
use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Priority MongoDB assigns to members that do not configure one
pub const DEFAULT_MEMBER_PRIORITY: f64 = 1.0;

/// Role of a reachable replica set member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// Role and configured priority of a discovered member
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub role: Role,
    /// `0` marks a passive/hidden member that can never become primary
    pub priority: f64,
}

impl MemberInfo {
    pub fn is_passive(&self) -> bool {
        self.priority == 0.0
    }
}

/// A member as the live connection currently sees it
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedMember {
    pub host_port: String,
    /// `None` for arbiters, recovering, down or otherwise unusable members
    pub role: Option<Role>,
    pub state: String,
}

/// A member as the replica set configuration declares it
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredMember {
    pub host_port: String,
    pub priority: f64,
}

/// Discovered members keyed by host:port.
///
/// The primary comes first, secondaries follow in discovery order. Exactly one
/// primary is present.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTopology {
    members: Vec<(String, MemberInfo)>,
}

impl ClusterTopology {
    /// Build a topology, rejecting member lists without exactly one primary
    pub fn from_members(members: Vec<(String, MemberInfo)>) -> BackupResult<Self> {
        let primaries = members
            .iter()
            .filter(|(_, info)| info.role == Role::Primary)
            .count();
        match primaries {
            0 => return Err(BackupError::topology("not a replica set: no primary")),
            1 => {}
            n => {
                return Err(BackupError::topology(format!(
                    "{} members claim to be primary",
                    n
                )))
            }
        }

        let (mut primary, secondaries): (Vec<_>, Vec<_>) = members
            .into_iter()
            .partition(|(_, info)| info.role == Role::Primary);
        primary.extend(secondaries);
        Ok(Self { members: primary })
    }

    pub fn primary(&self) -> &str {
        // from_members guarantees the primary sits first
        &self.members[0].0
    }

    /// Secondaries in discovery order
    pub fn secondaries(&self) -> impl Iterator<Item = (&str, &MemberInfo)> {
        self.members
            .iter()
            .filter(|(_, info)| info.role == Role::Secondary)
            .map(|(host, info)| (host.as_str(), info))
    }

    pub fn secondary_count(&self) -> usize {
        self.secondaries().count()
    }

    pub fn member(&self, host_port: &str) -> Option<&MemberInfo> {
        self.members
            .iter()
            .find(|(host, _)| host == host_port)
            .map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Attach a configured priority; returns false when the member is unknown
    fn set_priority(&mut self, host_port: &str, priority: f64) -> bool {
        match self.members.iter_mut().find(|(host, _)| host == host_port) {
            Some((_, info)) => {
                info.priority = priority;
                true
            }
            None => false,
        }
    }
}

/// Opens cluster-wide sessions from a multi-host descriptor
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> BackupResult<Box<dyn ClusterSession>>;
}

/// A live connection to the replica set
#[async_trait]
pub trait ClusterSession: Send + Sync {
    /// Members and their current state, in the order the server reports them
    async fn observed_members(&self) -> BackupResult<Vec<ObservedMember>>;

    /// Members as declared in the replica set configuration
    async fn configured_members(&self) -> BackupResult<Vec<ConfiguredMember>>;

    /// Release the connection
    async fn close(self: Box<Self>);
}

/// Builds a [`ClusterTopology`] from a live connection
pub struct TopologyDiscoverer {
    connector: Arc<dyn ClusterConnector>,
    config: DiscoveryConfig,
}

impl TopologyDiscoverer {
    pub fn new(connector: Arc<dyn ClusterConnector>, config: DiscoveryConfig) -> Self {
        Self { connector, config }
    }

    /// Discover primary, secondaries and priorities.
    ///
    /// The session is closed before returning, whatever the outcome.
    pub async fn discover(&self, descriptor: &ConnectionDescriptor) -> BackupResult<ClusterTopology> {
        tracing::info!("Discovering replica set topology via {}", descriptor);
        let session = self.connector.connect(descriptor).await?;

        let result = self.discover_with(session.as_ref()).await;
        session.close().await;

        if let Ok(topology) = &result {
            tracing::info!(
                "Discovered primary {} and {} secondaries",
                topology.primary(),
                topology.secondary_count()
            );
        }
        result
    }

    async fn discover_with(&self, session: &dyn ClusterSession) -> BackupResult<ClusterTopology> {
        let observed = self.wait_for_primary(session).await?;

        let mut members = Vec::new();
        for member in observed {
            match member.role {
                Some(role) => members.push((
                    member.host_port,
                    MemberInfo {
                        role,
                        priority: DEFAULT_MEMBER_PRIORITY,
                    },
                )),
                None => tracing::debug!(
                    "Skipping member {} in state {}",
                    member.host_port,
                    member.state
                ),
            }
        }

        let mut topology = ClusterTopology::from_members(members)?;
        if topology.secondary_count() == 0 {
            return Err(BackupError::availability("no secondary available"));
        }

        for configured in session.configured_members().await? {
            if !configured.priority.is_finite() || configured.priority < 0.0 {
                tracing::warn!(
                    "Ignoring invalid priority {} for {}",
                    configured.priority,
                    configured.host_port
                );
                continue;
            }
            if !topology.set_priority(&configured.host_port, configured.priority) {
                tracing::debug!(
                    "Configured member {} is not reachable, ignoring",
                    configured.host_port
                );
            }
        }

        Ok(topology)
    }

    /// Probe until the connection knows a primary or the timeout elapses
    async fn wait_for_primary(&self, session: &dyn ClusterSession) -> BackupResult<Vec<ObservedMember>> {
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let mut delay = self.config.poll_interval();

        loop {
            let observed = session.observed_members().await?;
            let primaries = observed
                .iter()
                .filter(|m| m.role == Some(Role::Primary))
                .count();
            if primaries == 1 {
                return Ok(observed);
            }
            if primaries > 1 {
                tracing::debug!("{} members report PRIMARY, waiting for the election to settle", primaries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BackupError::topology(format!(
                    "not a replica set: no primary discovered within {}ms",
                    timeout.as_millis()
                )));
            }

            let pause = (delay + jitter(delay)).min(deadline - now);
            tracing::debug!("No primary known yet, probing again in {:?}", pause);
            tokio::time::sleep(pause).await;
            delay = (delay * 2).min(self.config.max_poll_interval());
        }
    }
}

/// Up to a quarter of `delay`, so parallel runs do not probe in lockstep
fn jitter(delay: Duration) -> Duration {
    let max = delay.as_millis() as u64 / 4;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
