/// External snapshot collaborator
use crate::error::BackupResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Result reported by the snapshot collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOutcome {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    /// stdout followed by stderr
    pub output: String,
}

/// Performs the out-of-band snapshot of one host's data directory
#[async_trait]
pub trait SnapshotTool: Send + Sync {
    /// Snapshot `host_port`. Must not unlock the database.
    async fn snapshot(&self, host_port: &str) -> BackupResult<SnapshotOutcome>;
}

/// Runs an executable with the target host:port as its only argument
pub struct ExternalSnapshotCommand {
    program: PathBuf,
}

impl ExternalSnapshotCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl SnapshotTool for ExternalSnapshotCommand {
    async fn snapshot(&self, host_port: &str) -> BackupResult<SnapshotOutcome> {
        tracing::info!("Running {} {}", self.program.display(), host_port);

        let output = Command::new(&self.program)
            .arg(host_port)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(SnapshotOutcome {
            exit_code: output.status.code(),
            success: output.status.success(),
            output: combined,
        })
    }
}
