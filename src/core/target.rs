/// Backup target derivation
use super::descriptor::ConnectionDescriptor;

/// Option that asks the driver for replica-set-aware routing
pub const REPLICA_SET_OPTION: &str = "replicaSet";

/// The single node chosen for a backup run, with a descriptor that talks to
/// that node only
#[derive(Debug, Clone, PartialEq)]
pub struct BackupTarget {
    host_port: String,
    descriptor: ConnectionDescriptor,
}

impl BackupTarget {
    /// Retarget `source` at `host_port`.
    ///
    /// Credentials and default database carry over. Every option named
    /// `replicaSet`, or whose value mentions it, is dropped (both compare
    /// case-insensitively, as the driver treats option names); the remaining
    /// options keep their order.
    pub fn new(source: &ConnectionDescriptor, host_port: &str) -> Self {
        let options = source
            .options()
            .iter()
            .filter(|(key, value)| !requests_replica_set(key, value))
            .cloned()
            .collect();

        let descriptor = ConnectionDescriptor::from_parts(
            source.username().to_string(),
            source.password().to_string(),
            vec![host_port.to_string()],
            source.default_database().to_string(),
            options,
        );

        Self {
            host_port: host_port.to_string(),
            descriptor,
        }
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }
}

fn requests_replica_set(key: &str, value: &str) -> bool {
    key.eq_ignore_ascii_case(REPLICA_SET_OPTION)
        || value
            .to_ascii_lowercase()
            .contains(&REPLICA_SET_OPTION.to_ascii_lowercase())
}
