use crate::logs::LogBroadcaster;
use node_core::NodeError;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A supervised child process with its stdio piped into a log broadcaster.
///
/// Grounded in the reference agent's subprocess runner: stdout/stderr are
/// pumped line-by-line into the log bus, and a latch fires exactly once
/// when the process exits — whether that exit was requested (`stop`) or a
/// crash the supervisor needs to notice. The `Child` handle itself is
/// owned by a background task spawned at construction time, so exit
/// detection runs unconditionally rather than depending on some other
/// caller remembering to drive it.
pub struct ChildProcess {
    pid: Option<u32>,
    running: Arc<AtomicBool>,
    stopped: Arc<Notify>,
}

impl ChildProcess {
    /// Spawn `program` with `args`/`envs`, piping stdout and stderr into
    /// `logs`. Returns once the process is running; log pumping and exit
    /// detection continue on background tasks for the lifetime of the
    /// underlying OS process.
    ///
    /// `notify` is supplied by the caller rather than created here so an
    /// adapter can keep a single stable crash signal across restarts —
    /// each respawn gets a fresh `ChildProcess` but notifies the same
    /// `Notify`, which is what the supervisor's crash-watch task awaits.
    ///
    /// `stdin_payload`, when set, is written to the child's stdin and the
    /// pipe is then closed — this is how Xray's `-config stdin:` invocation
    /// receives its rendered configuration. Adapters that pass config via a
    /// file argument instead leave this `None`.
    pub async fn spawn(
        program: &std::path::Path,
        args: &[String],
        envs: &HashMap<String, String>,
        logs: Arc<LogBroadcaster>,
        notify: Arc<Notify>,
        stdin_payload: Option<&[u8]>,
    ) -> Result<Self, NodeError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(envs)
            .stdin(if stdin_payload.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| NodeError::ChildSpawnFailed(e.to_string()))?;

        if let Some(payload) = stdin_payload {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(payload)
                .await
                .map_err(|e| NodeError::ChildSpawnFailed(e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| NodeError::ChildSpawnFailed(e.to_string()))?;
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let pid = child.id();

        let running = Arc::new(AtomicBool::new(true));
        let stopped = notify;

        tokio::spawn(pump_lines(stdout, logs.clone()));
        tokio::spawn(pump_lines(stderr, logs));
        tokio::spawn(watch_exit(child, running.clone(), stopped.clone()));

        Ok(Self { pid, running, stopped })
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The OS process id, for adapters that need to send signals other
    /// than the terminate/kill pair `stop` already handles (sing-box's
    /// `SIGHUP` reload).
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves once the background watch task observes this process exit.
    pub fn stopped(&self) -> Arc<Notify> {
        self.stopped.clone()
    }

    /// Ask the process to exit gracefully (SIGTERM), escalating to SIGKILL
    /// if it hasn't stopped within `timeout`. A no-op if the process has
    /// already exited.
    pub async fn stop(&self, timeout: Duration) -> Result<(), NodeError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if !self.running() {
            return Ok(());
        }

        // Register as a waiter before signaling: `Notify::notify_waiters`
        // doesn't latch a permit for late registrants, so a `watch_exit`
        // that reaps the child between the `kill` call and a `notified()`
        // created afterward would leave this future waiting forever.
        // `enable()` registers the waiter immediately without polling.
        tokio::pin! {
            let notified = self.stopped.notified();
        }
        notified.as_mut().enable();

        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        if tokio::time::timeout(timeout, notified.as_mut()).await.is_err() {
            warn!(pid, "process did not exit within timeout, sending SIGKILL");
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            notified.await;
        }
        Ok(())
    }
}

/// Owns the `Child` handle for the lifetime of the OS process: waits for
/// it to exit, then flips `running` and fires `stopped` exactly once.
/// Spawned unconditionally at construction time so a crash is detected
/// whether or not anyone happens to be waiting on `stopped` yet.
async fn watch_exit(mut child: Child, running: Arc<AtomicBool>, stopped: Arc<Notify>) {
    match child.wait().await {
        Ok(status) => debug!(?status, "child process exited"),
        Err(e) => warn!(error = %e, "failed to wait on child process"),
    }
    running.store(false, Ordering::SeqCst);
    stopped.notify_waiters();
}

async fn pump_lines<R>(reader: R, logs: Arc<LogBroadcaster>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logs.publish(line),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error reading child process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_is_detected_without_the_caller_driving_anything() {
        let logs = Arc::new(LogBroadcaster::new(16));
        let notify = Arc::new(Notify::new());
        let child = ChildProcess::spawn(
            std::path::Path::new("/bin/echo"),
            &["hello".to_string()],
            &HashMap::new(),
            logs,
            notify,
            None,
        )
        .await
        .unwrap();

        child.stopped().notified().await;
        assert!(!child.running());
    }

    #[tokio::test]
    async fn spawn_unknown_binary_fails_with_child_spawn_failed() {
        let logs = Arc::new(LogBroadcaster::new(16));
        let result = ChildProcess::spawn(
            std::path::Path::new("/nonexistent/binary"),
            &[],
            &HashMap::new(),
            logs,
            Arc::new(Notify::new()),
            None,
        )
        .await;
        assert!(matches!(result, Err(NodeError::ChildSpawnFailed(_))));
    }

    #[tokio::test]
    async fn watch_exit_notifies_the_supplied_notify() {
        let logs = Arc::new(LogBroadcaster::new(16));
        let notify = Arc::new(Notify::new());
        let child = ChildProcess::spawn(
            std::path::Path::new("/bin/echo"),
            &["hi".to_string()],
            &HashMap::new(),
            logs,
            notify.clone(),
            None,
        )
        .await
        .unwrap();

        notify.notified().await;
        assert!(!child.running());
    }

    #[tokio::test]
    async fn stop_is_a_no_op_once_the_process_already_exited() {
        let logs = Arc::new(LogBroadcaster::new(16));
        let notify = Arc::new(Notify::new());
        let child = ChildProcess::spawn(
            std::path::Path::new("/bin/echo"),
            &["hi".to_string()],
            &HashMap::new(),
            logs,
            notify,
            None,
        )
        .await
        .unwrap();

        child.stopped().notified().await;
        child.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_process() {
        let logs = Arc::new(LogBroadcaster::new(16));
        let notify = Arc::new(Notify::new());
        let child = ChildProcess::spawn(
            std::path::Path::new("/bin/sleep"),
            &["30".to_string()],
            &HashMap::new(),
            logs,
            notify,
            None,
        )
        .await
        .unwrap();

        assert!(child.running());
        child.stop(Duration::from_secs(3)).await.unwrap();
        assert!(!child.running());
    }

    /// Regression test for a race where `watch_exit` could reap the child
    /// and fire `stopped` between `stop`'s signal and its wait registering,
    /// leaving `stop` hung forever. `/bin/sleep 30` dies on the default
    /// SIGTERM disposition essentially as soon as it's signaled, which
    /// repeatedly exercises that window; bounding the whole call in an
    /// outer timeout turns a hang into a test failure instead of a stall.
    #[tokio::test]
    async fn stop_does_not_hang_when_the_child_exits_immediately_on_signal() {
        for _ in 0..20 {
            let logs = Arc::new(LogBroadcaster::new(16));
            let notify = Arc::new(Notify::new());
            let child = ChildProcess::spawn(
                std::path::Path::new("/bin/sleep"),
                &["30".to_string()],
                &HashMap::new(),
                logs,
                notify,
                None,
            )
            .await
            .unwrap();

            tokio::time::timeout(Duration::from_secs(3), child.stop(Duration::from_secs(1)))
                .await
                .expect("stop() hung")
                .unwrap();
            assert!(!child.running());
        }
    }
}
