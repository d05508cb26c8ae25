/// Lock / snapshot / unlock coordination
///
/// A run moves through
/// `Unlocked -> LockRequested -> Locked -> SnapshotRunning -> Unlocking -> Done | Failed`.
/// Once the lock is held, the unlock phase runs on every path out of the
/// snapshot phase: collaborator failure, collaborator panic, I/O fault and
/// shutdown requests included.
pub mod node;
pub mod snapshot;

use crate::core::{BackupTarget, SessionState, SnapshotSession};
use crate::error::{BackupError, BackupResult};
use futures::FutureExt;
use node::{NodeConnector, NodeSession};
use snapshot::{SnapshotOutcome, SnapshotTool};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of a completed lock/snapshot/unlock sequence
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub target: String,
    pub state: SessionState,
    pub snapshot: SnapshotOutcome,
    pub elapsed: Duration,
}

/// Drives one [`SnapshotSession`] to a terminal state
pub struct SnapshotCoordinator {
    connector: Arc<dyn NodeConnector>,
    tool: Arc<dyn SnapshotTool>,
}

impl SnapshotCoordinator {
    pub fn new(connector: Arc<dyn NodeConnector>, tool: Arc<dyn SnapshotTool>) -> Self {
        Self { connector, tool }
    }

    /// Lock `target`, snapshot it and unlock it.
    ///
    /// A shutdown request seen before the lock is taken stops the run with
    /// nothing owed. `shutdown` flipping to `true` while the snapshot runs
    /// abandons the snapshot; the node is still unlocked before this returns.
    pub async fn run(
        &self,
        target: &BackupTarget,
        shutdown: watch::Receiver<bool>,
    ) -> BackupResult<BackupReport> {
        let mut session = SnapshotSession::new(target.clone());
        let host = target.host_port().to_string();

        if *shutdown.borrow() {
            session.fail("Interrupted");
            return Err(BackupError::interrupted("connecting to the target"));
        }

        session.transition(SessionState::LockRequested);
        let node = match self.connector.connect(target).await {
            Ok(node) => node,
            Err(e) => {
                session.fail("ConnectionError");
                return Err(e);
            }
        };

        if *shutdown.borrow() {
            node.close().await;
            session.fail("Interrupted");
            return Err(BackupError::interrupted("waiting to take the fsync lock"));
        }

        if let Err(e) = node.fsync_lock().await {
            tracing::error!("Failed to fsync-lock {}: {}", host, e);
            node.close().await;
            session.fail("LockError");
            return Err(match e {
                lock_err @ BackupError::Lock { .. } => lock_err,
                other => BackupError::lock(host.as_str(), other.to_string()),
            });
        }
        session.transition(SessionState::Locked);
        tracing::info!("{} is fsync-locked", host);

        session.transition(SessionState::SnapshotRunning);
        let snapshot = self.run_snapshot(&host, shutdown).await;

        session.transition(SessionState::Unlocking);
        let unlock = release_lock(node.as_ref(), &host).await;
        node.close().await;

        match (unlock, snapshot) {
            (Err(e), snapshot) => {
                if let Err(snapshot_err) = &snapshot {
                    tracing::error!("Snapshot of {} also failed: {}", host, snapshot_err);
                }
                session.fail("UnlockError");
                Err(e)
            }
            (Ok(()), Err(e)) => {
                session.fail(failure_kind(&e));
                Err(e)
            }
            (Ok(()), Ok(outcome)) if !outcome.success => {
                tracing::error!(
                    "Snapshot of {} failed with exit code {:?}:\n{}",
                    host,
                    outcome.exit_code,
                    outcome.output
                );
                session.fail("SnapshotError");
                Err(BackupError::Snapshot {
                    target: host,
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                })
            }
            (Ok(()), Ok(outcome)) => {
                session.transition(SessionState::Done);
                tracing::info!("Snapshot of {} completed in {:?}", host, session.elapsed());
                Ok(BackupReport {
                    target: host,
                    state: session.state().clone(),
                    snapshot: outcome,
                    elapsed: session.elapsed(),
                })
            }
        }
    }

    /// Run the collaborator to completion, a panic, or a shutdown request
    async fn run_snapshot(
        &self,
        host: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> BackupResult<SnapshotOutcome> {
        if *shutdown.borrow() {
            return Err(BackupError::interrupted("waiting to start the snapshot"));
        }

        let snapshot = AssertUnwindSafe(self.tool.snapshot(host)).catch_unwind();
        tokio::select! {
            result = snapshot => match result {
                Ok(Ok(outcome)) => {
                    tracing::info!("Snapshot tool output for {}:\n{}", host, outcome.output);
                    Ok(outcome)
                }
                Ok(Err(BackupError::Io(e))) => Err(BackupError::Snapshot {
                    target: host.to_string(),
                    exit_code: None,
                    output: format!("failed to run snapshot tool: {}", e),
                }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(BackupError::Snapshot {
                    target: host.to_string(),
                    exit_code: None,
                    output: "snapshot tool panicked".to_string(),
                }),
            },
            _ = wait_for_shutdown(&mut shutdown) => {
                tracing::warn!("Shutdown requested, abandoning snapshot of {}", host);
                Err(BackupError::interrupted("the snapshot was running"))
            }
        }
    }
}

/// Issue one unlock unless the node reports it is no longer locked.
///
/// An unreadable lock status counts as still locked.
async fn release_lock(node: &dyn NodeSession, host: &str) -> BackupResult<()> {
    let locked = match node.is_locked().await {
        Ok(locked) => locked,
        Err(e) => {
            tracing::warn!("Cannot read fsync lock status of {}: {}", host, e);
            true
        }
    };
    if !locked {
        tracing::warn!("{} is no longer fsync-locked, skipping unlock", host);
        return Ok(());
    }

    let remaining = node
        .fsync_unlock()
        .await
        .map_err(|e| BackupError::unlock(host, e.to_string()))?;
    if remaining > 0 {
        tracing::warn!("{} still holds {} fsync lock(s) taken by others", host, remaining);
    } else {
        tracing::info!("{} unlocked", host);
    }
    Ok(())
}

/// Resolves once the flag is set; never resolves if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

fn failure_kind(err: &BackupError) -> &'static str {
    match err {
        BackupError::Snapshot { .. } => "SnapshotError",
        BackupError::Interrupted { .. } => "Interrupted",
        _ => "ConnectionError",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::ConnectionDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every command issued against the mock node
    #[derive(Default)]
    pub(crate) struct MockNode {
        pub fail_connect: bool,
        pub fail_lock: bool,
        pub fail_unlock: bool,
        pub fail_status: bool,
        pub locked: AtomicBool,
        pub log: Mutex<Vec<&'static str>>,
    }

    impl MockNode {
        pub(crate) fn commands(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, command: &str) -> usize {
            self.commands().iter().filter(|c| **c == command).count()
        }

        fn record(&self, command: &'static str) {
            self.log.lock().unwrap().push(command);
        }
    }

    pub(crate) struct MockNodeConnector {
        pub node: Arc<MockNode>,
    }

    struct MockNodeSession {
        node: Arc<MockNode>,
    }

    #[async_trait]
    impl NodeConnector for MockNodeConnector {
        async fn connect(&self, _target: &BackupTarget) -> BackupResult<Box<dyn NodeSession>> {
            if self.node.fail_connect {
                return Err(BackupError::connection("connection refused"));
            }
            self.node.record("connect");
            Ok(Box::new(MockNodeSession {
                node: Arc::clone(&self.node),
            }))
        }
    }

    #[async_trait]
    impl NodeSession for MockNodeSession {
        async fn fsync_lock(&self) -> BackupResult<()> {
            self.node.record("fsync_lock");
            if self.node.fail_lock {
                return Err(BackupError::connection("not authorized on admin"));
            }
            self.node.locked.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_locked(&self) -> BackupResult<bool> {
            self.node.record("is_locked");
            if self.node.fail_status {
                return Err(BackupError::connection("not authorized on admin to execute command currentOp"));
            }
            Ok(self.node.locked.load(Ordering::SeqCst))
        }

        async fn fsync_unlock(&self) -> BackupResult<i64> {
            self.node.record("fsync_unlock");
            if self.node.fail_unlock {
                return Err(BackupError::connection("socket closed"));
            }
            self.node.locked.store(false, Ordering::SeqCst);
            Ok(0)
        }

        async fn close(self: Box<Self>) {
            self.node.record("close");
        }
    }

    pub(crate) enum ToolBehavior {
        Succeed,
        ExitWith(i32),
        Panic,
        Hang,
    }

    pub(crate) struct MockTool {
        pub behavior: ToolBehavior,
        pub calls: AtomicUsize,
        pub node: Arc<MockNode>,
    }

    #[async_trait]
    impl SnapshotTool for MockTool {
        async fn snapshot(&self, host_port: &str) -> BackupResult<SnapshotOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(self.node.locked.load(Ordering::SeqCst), "snapshot of unlocked node");
            match self.behavior {
                ToolBehavior::Succeed => Ok(SnapshotOutcome {
                    exit_code: Some(0),
                    success: true,
                    output: format!("snapshot of {} taken", host_port),
                }),
                ToolBehavior::ExitWith(code) => Ok(SnapshotOutcome {
                    exit_code: Some(code),
                    success: false,
                    output: "volume busy".to_string(),
                }),
                ToolBehavior::Panic => panic!("tool exploded"),
                ToolBehavior::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    pub(crate) fn target() -> BackupTarget {
        let descriptor: ConnectionDescriptor = "mongodb://u:p@h1:27017,h2:27017/db?replicaSet=rs0&x=1"
            .parse()
            .unwrap();
        BackupTarget::new(&descriptor, "h2:27017")
    }

    fn coordinator(node: MockNode, behavior: ToolBehavior) -> (SnapshotCoordinator, Arc<MockNode>, Arc<MockTool>) {
        let node = Arc::new(node);
        let tool = Arc::new(MockTool {
            behavior,
            calls: AtomicUsize::new(0),
            node: Arc::clone(&node),
        });
        let coordinator = SnapshotCoordinator::new(
            Arc::new(MockNodeConnector {
                node: Arc::clone(&node),
            }),
            tool.clone(),
        );
        (coordinator, node, tool)
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // dropping the sender must not read as a shutdown request
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn test_successful_run() {
        let (coordinator, node, tool) = coordinator(MockNode::default(), ToolBehavior::Succeed);

        let report = coordinator.run(&target(), no_shutdown()).await.unwrap();

        assert_eq!(report.state, SessionState::Done);
        assert_eq!(report.target, "h2:27017");
        assert!(report.snapshot.output.contains("h2:27017"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            node.commands(),
            vec!["connect", "fsync_lock", "is_locked", "fsync_unlock", "close"]
        );
        assert!(!node.locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_snapshot_failure_still_unlocks_once() {
        let (coordinator, node, tool) = coordinator(MockNode::default(), ToolBehavior::ExitWith(2));

        let err = coordinator.run(&target(), no_shutdown()).await.unwrap_err();

        match err {
            BackupError::Snapshot { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(output, "volume busy");
            }
            other => panic!("expected snapshot error, got {:?}", other),
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.count("fsync_unlock"), 1);
        assert_eq!(node.count("close"), 1);
        assert!(!node.locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lock_failure_skips_snapshot_and_unlock() {
        let node = MockNode {
            fail_lock: true,
            ..MockNode::default()
        };
        let (coordinator, node, tool) = coordinator(node, ToolBehavior::Succeed);

        let err = coordinator.run(&target(), no_shutdown()).await.unwrap_err();

        assert!(matches!(err, BackupError::Lock { .. }));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(node.count("fsync_unlock"), 0);
        assert_eq!(node.count("is_locked"), 0);
        assert_eq!(node.count("close"), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_issues_nothing() {
        let node = MockNode {
            fail_connect: true,
            ..MockNode::default()
        };
        let (coordinator, node, tool) = coordinator(node, ToolBehavior::Succeed);

        let err = coordinator.run(&target(), no_shutdown()).await.unwrap_err();

        assert!(matches!(err, BackupError::Connection { .. }));
        assert!(node.commands().is_empty());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_tool_still_unlocks() {
        let (coordinator, node, _tool) = coordinator(MockNode::default(), ToolBehavior::Panic);

        let err = coordinator.run(&target(), no_shutdown()).await.unwrap_err();

        assert!(matches!(err, BackupError::Snapshot { exit_code: None, .. }));
        assert_eq!(node.count("fsync_unlock"), 1);
        assert!(!node.locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_during_snapshot_unlocks() {
        let (coordinator, node, tool) = coordinator(MockNode::default(), ToolBehavior::Hang);
        let (tx, rx) = watch::channel(false);

        let target = target();
        let run = coordinator.run(&target, rx);
        let trigger = async {
            while tool.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            tx.send(true).unwrap();
        };
        let (result, _) = tokio::join!(run, trigger);

        assert!(matches!(result, Err(BackupError::Interrupted { .. })));
        assert_eq!(node.count("fsync_unlock"), 1);
        assert!(!node.locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_before_lock_leaves_node_untouched() {
        let (coordinator, node, tool) = coordinator(MockNode::default(), ToolBehavior::Succeed);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = coordinator.run(&target(), rx).await.unwrap_err();

        assert!(matches!(err, BackupError::Interrupted { .. }));
        assert_eq!(node.count("fsync_lock"), 0);
        assert_eq!(node.count("fsync_unlock"), 0);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert!(!node.locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unreadable_lock_status_still_unlocks() {
        let node = MockNode {
            fail_status: true,
            ..MockNode::default()
        };
        let (coordinator, node, tool) = coordinator(node, ToolBehavior::Succeed);

        let report = coordinator.run(&target(), no_shutdown()).await.unwrap();

        assert_eq!(report.state, SessionState::Done);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            node.commands(),
            vec!["connect", "fsync_lock", "is_locked", "fsync_unlock", "close"]
        );
        assert!(!node.locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unlock_failure_is_reported() {
        let node = MockNode {
            fail_unlock: true,
            ..MockNode::default()
        };
        let (coordinator, node, _tool) = coordinator(node, ToolBehavior::ExitWith(1));

        let err = coordinator.run(&target(), no_shutdown()).await.unwrap_err();

        assert!(matches!(err, BackupError::Unlock { .. }));
        assert_eq!(node.count("fsync_unlock"), 1);
        assert_eq!(node.count("close"), 1);
    }

    #[tokio::test]
    async fn test_already_unlocked_node_is_not_unlocked_again() {
        let node = Arc::new(MockNode::default());
        struct UnlockingTool(Arc<MockNode>);

        #[async_trait]
        impl SnapshotTool for UnlockingTool {
            async fn snapshot(&self, _host_port: &str) -> BackupResult<SnapshotOutcome> {
                self.0.locked.store(false, Ordering::SeqCst);
                Ok(SnapshotOutcome {
                    exit_code: Some(0),
                    success: true,
                    output: String::new(),
                })
            }
        }

        let coordinator = SnapshotCoordinator::new(
            Arc::new(MockNodeConnector {
                node: Arc::clone(&node),
            }),
            Arc::new(UnlockingTool(Arc::clone(&node))),
        );

        let report = coordinator.run(&target(), no_shutdown()).await.unwrap();
        assert_eq!(report.state, SessionState::Done);
        assert_eq!(node.count("is_locked"), 1);
        assert_eq!(node.count("fsync_unlock"), 0);
    }
}
