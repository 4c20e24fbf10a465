//! Spawning and terminating the content-server child process

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A spawned content server and the task watching it
pub struct ServerProcess {
    pub pid: Option<u32>,
    stop_tx: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

impl ServerProcess {
    /// Spawn `binary --port <port> <paths...>`. `on_exit` runs with the
    /// exit code if the process ends on its own; a stop never calls it.
    pub fn spawn<F>(
        binary: &Path,
        port: u16,
        paths: &[PathBuf],
        stop_timeout: Duration,
        on_exit: F,
    ) -> std::io::Result<Self>
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let mut cmd = Command::new(binary);
        cmd.arg("--port")
            .arg(port.to_string())
            .args(paths)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Never outlive the supervisor
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(child, stop_rx, stop_timeout, on_exit));

        Ok(Self {
            pid,
            stop_tx,
            watcher,
        })
    }

    /// Terminate the process and wait until it is gone
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.watcher.await {
            warn!("Content server watcher ended abnormally: {}", e);
        }
    }
}

async fn watch<F>(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    stop_timeout: Duration,
    on_exit: F,
) where
    F: FnOnce(Option<i32>) + Send + 'static,
{
    tokio::select! {
        status = child.wait() => {
            on_exit(exit_code(status));
        }
        _ = stop_rx => {
            terminate(&mut child, stop_timeout).await;
        }
    }
}

fn exit_code(status: std::io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to wait for content server: {}", e);
            None
        }
    }
}

/// SIGTERM, then SIGKILL once `timeout` passes
async fn terminate(child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                if let Ok(status) = tokio::time::timeout(timeout, child.wait()).await {
                    debug!("Content server stopped: {:?}", status);
                    return;
                }
                warn!("Content server ignored SIGTERM for {:?}; killing", timeout);
            }
        }
    }

    #[cfg(not(unix))]
    let _ = timeout;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill content server: {}", e);
    }
}

async fn forward_output<R>(src: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(src).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!("content server: {}", line),
            Ok(Some(line)) => debug!("content server: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("content server output closed: {}", e);
                break;
            }
        }
    }
}
