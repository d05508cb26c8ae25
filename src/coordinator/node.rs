/// Single-node sessions used to fsync-lock and unlock the backup target
use crate::config::DiscoveryConfig;
use crate::core::BackupTarget;
use crate::error::{BackupError, BackupResult};
use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;

/// Opens a session to exactly one node
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, target: &BackupTarget) -> BackupResult<Box<dyn NodeSession>>;
}

/// Administrative commands against the backup target
#[async_trait]
pub trait NodeSession: Send + Sync {
    /// Flush pending writes and block further writes
    async fn fsync_lock(&self) -> BackupResult<()>;

    /// Whether the node currently holds an fsync lock
    async fn is_locked(&self) -> BackupResult<bool>;

    /// Release one fsync lock, returning the remaining lock count
    async fn fsync_unlock(&self) -> BackupResult<i64>;

    /// Release the connection
    async fn close(self: Box<Self>);
}

/// Driver-backed connector forcing a direct connection to the target
pub struct MongoNodeConnector {
    config: DiscoveryConfig,
}

impl MongoNodeConnector {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeConnector for MongoNodeConnector {
    async fn connect(&self, target: &BackupTarget) -> BackupResult<Box<dyn NodeSession>> {
        let mut options = ClientOptions::parse(target.descriptor().connection_uri()).await?;
        options.app_name = Some(self.config.app_name.clone());
        options.connect_timeout = Some(self.config.connect_timeout());
        options.server_selection_timeout = Some(self.config.connect_timeout());
        // a lone seed without this may still be routed to the primary
        options.direct_connection = Some(true);

        let client = Client::with_options(options)?;
        Ok(Box::new(MongoNodeSession {
            client,
            host_port: target.host_port().to_string(),
        }))
    }
}

pub struct MongoNodeSession {
    client: Client,
    host_port: String,
}

impl MongoNodeSession {
    async fn admin_command(&self, command: Document) -> BackupResult<Document> {
        Ok(self
            .client
            .database("admin")
            .run_command(command, None)
            .await?)
    }
}

#[async_trait]
impl NodeSession for MongoNodeSession {
    async fn fsync_lock(&self) -> BackupResult<()> {
        let reply = self
            .admin_command(doc! { "fsync": 1, "lock": true })
            .await
            .map_err(|e| BackupError::lock(self.host_port.as_str(), e.to_string()))?;
        tracing::debug!("fsync lock reply from {}: {}", self.host_port, reply);
        Ok(())
    }

    async fn is_locked(&self) -> BackupResult<bool> {
        let reply = self.admin_command(doc! { "currentOp": 1 }).await?;
        Ok(reply.get_bool("fsyncLock").unwrap_or(false))
    }

    async fn fsync_unlock(&self) -> BackupResult<i64> {
        let reply = self.admin_command(doc! { "fsyncUnlock": 1 }).await?;
        let remaining = reply
            .get_i64("lockCount")
            .or_else(|_| reply.get_i32("lockCount").map(i64::from))
            .unwrap_or(0);
        Ok(remaining)
    }

    async fn close(self: Box<Self>) {
        self.client.shutdown().await;
        tracing::debug!("Closed node client for {}", self.host_port);
    }
}
