/// MongoDB driver implementation of cluster discovery
///
/// Uses `replSetGetStatus` for the live member view and `replSetGetConfig`
/// for configured priorities.

use super::{ClusterConnector, ClusterSession, ConfiguredMember, ObservedMember, Role, DEFAULT_MEMBER_PRIORITY};
use crate::config::DiscoveryConfig;
use crate::core::ConnectionDescriptor;
use crate::error::{BackupError, BackupResult};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as DriverError, ErrorKind};
use mongodb::options::{ClientOptions, ReadPreference, ReadPreferenceOptions, SelectionCriteria};
use mongodb::Client;

/// Server error codes meaning the node does not run as a replica set member
const NO_REPLICATION_ENABLED: i32 = 76;
const NOT_YET_INITIALIZED: i32 = 94;

/// Member states reported by `replSetGetStatus`
const STATE_PRIMARY: i32 = 1;
const STATE_SECONDARY: i32 = 2;

/// Opens a replica-set-aware driver client from the full host list
pub struct MongoClusterConnector {
    config: DiscoveryConfig,
}

impl MongoClusterConnector {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClusterConnector for MongoClusterConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> BackupResult<Box<dyn ClusterSession>> {
        let mut options = ClientOptions::parse(descriptor.connection_uri()).await?;
        options.app_name = Some(self.config.app_name.clone());
        options.connect_timeout = Some(self.config.connect_timeout());
        options.server_selection_timeout = Some(self.config.timeout());

        let client = Client::with_options(options)?;
        tracing::debug!("Opened cluster client for {} hosts", descriptor.hosts().len());
        Ok(Box::new(MongoClusterSession { client }))
    }
}

/// Cluster session backed by a driver client
pub struct MongoClusterSession {
    client: Client,
}

impl MongoClusterSession {
    async fn admin_command(&self, command: Document) -> BackupResult<Document> {
        // Any reachable member can answer while the primary is still unknown.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: ReadPreferenceOptions::default(),
        });
        self.client
            .database("admin")
            .run_command(command, criteria)
            .await
            .map_err(map_replication_error)
    }
}

#[async_trait]
impl ClusterSession for MongoClusterSession {
    async fn observed_members(&self) -> BackupResult<Vec<ObservedMember>> {
        let reply = self.admin_command(doc! { "replSetGetStatus": 1 }).await?;
        parse_status_members(&reply)
    }

    async fn configured_members(&self) -> BackupResult<Vec<ConfiguredMember>> {
        let reply = self.admin_command(doc! { "replSetGetConfig": 1 }).await?;
        parse_config_members(&reply)
    }

    async fn close(self: Box<Self>) {
        self.client.shutdown().await;
        tracing::debug!("Closed cluster client");
    }
}

fn map_replication_error(err: DriverError) -> BackupError {
    if let ErrorKind::Command(ref command) = *err.kind {
        if let Some(topology_err) = classify(command.code, &command.message) {
            return topology_err;
        }
    }
    BackupError::from(err)
}

/// Topology error for server codes that rule out a replica set
fn classify(code: i32, message: &str) -> Option<BackupError> {
    match code {
        NO_REPLICATION_ENABLED | NOT_YET_INITIALIZED => {
            Some(BackupError::topology(format!("not a replica set: {}", message)))
        }
        _ => None,
    }
}

fn malformed(command: &str, detail: impl std::fmt::Display) -> BackupError {
    BackupError::connection(format!("malformed {} reply: {}", command, detail))
}

/// Members of a `replSetGetStatus` reply, in reply order
pub(crate) fn parse_status_members(reply: &Document) -> BackupResult<Vec<ObservedMember>> {
    let members = reply
        .get_array("members")
        .map_err(|e| malformed("replSetGetStatus", e))?;

    let mut observed = Vec::with_capacity(members.len());
    for member in members {
        let member = member
            .as_document()
            .ok_or_else(|| malformed("replSetGetStatus", "member is not a document"))?;
        let host_port = member
            .get_str("name")
            .map_err(|e| malformed("replSetGetStatus", e))?;
        let state = member.get("state").and_then(as_number).unwrap_or(-1.0) as i32;
        let role = match state {
            STATE_PRIMARY => Some(Role::Primary),
            STATE_SECONDARY => Some(Role::Secondary),
            _ => None,
        };

        observed.push(ObservedMember {
            host_port: host_port.to_string(),
            role,
            state: member.get_str("stateStr").unwrap_or("UNKNOWN").to_string(),
        });
    }
    Ok(observed)
}

/// Members of a `replSetGetConfig` reply
pub(crate) fn parse_config_members(reply: &Document) -> BackupResult<Vec<ConfiguredMember>> {
    let members = reply
        .get_document("config")
        .and_then(|config| config.get_array("members"))
        .map_err(|e| malformed("replSetGetConfig", e))?;

    let mut configured = Vec::with_capacity(members.len());
    for member in members {
        let member = member
            .as_document()
            .ok_or_else(|| malformed("replSetGetConfig", "member is not a document"))?;
        let host_port = member
            .get_str("host")
            .map_err(|e| malformed("replSetGetConfig", e))?;
        let priority = member
            .get("priority")
            .and_then(as_number)
            .unwrap_or(DEFAULT_MEMBER_PRIORITY);

        configured.push(ConfiguredMember {
            host_port: host_port.to_string(),
            priority,
        });
    }
    Ok(configured)
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}
