//! Supervisor for the external content server.
//!
//! One actor task owns the child process; every start, stop and restart is
//! a message to it, so calls from HTTP handlers, the update flow and the
//! exit watcher are serialized. Unexpected early exits are treated as a
//! crash caused by the most recently added archive, which is quarantined
//! before the server is brought back without it.

mod exit;
mod process;

pub use exit::{classify_exit, CrashThresholds, ExitKind};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ContentServerSettings;
use crate::db::{ActivityAction, ActivityStatus, Archive, Database, NewActivity};
use process::ServerProcess;

/// Supervisor state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Exited,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub port: u16,
    /// Files passed to the running process
    pub archives: Vec<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u64,
    pub crashes: u64,
    pub last_exit_code: Option<i32>,
}

enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Restart,
    Exited { generation: u64, code: Option<i32> },
    ClearRestartFlag { generation: u64 },
    MarkTouched(i64),
}

/// Cloneable handle to the supervisor actor
#[derive(Clone)]
pub struct ContentServer {
    tx: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<SupervisorStatus>>,
}

impl ContentServer {
    /// Spawn the supervisor on the current runtime. The server itself is
    /// not started until [`ContentServer::start`].
    pub fn spawn(db: Database, settings: ContentServerSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(SupervisorStatus {
            state: ServerState::Stopped,
            pid: None,
            port: settings.port,
            archives: Vec::new(),
            started_at: None,
            restarts: 0,
            crashes: 0,
            last_exit_code: None,
        }));

        let supervisor = Supervisor {
            db,
            thresholds: CrashThresholds::from(&settings),
            settings,
            tx: tx.downgrade(),
            status: Arc::clone(&status),
            process: None,
            generation: 0,
            started_at: None,
            intentional_restart: false,
            last_touched: None,
        };
        tokio::spawn(supervisor.run(rx));

        Self { tx, status }
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Content server supervisor is gone; command dropped");
        }
    }

    /// Start serving the active archives; no-op while running
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Stop the server and wait until the process is gone
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Stop(reply_tx));
        let _ = reply_rx.await;
    }

    /// Restart in the background to pick up registry changes
    pub fn restart(&self) {
        self.send(Command::Restart);
    }

    /// Record `archive_id` as the prime crash suspect
    pub fn mark_touched(&self, archive_id: i64) {
        self.send(Command::MarkTouched(archive_id));
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.read().clone()
    }
}

struct Supervisor {
    db: Database,
    settings: ContentServerSettings,
    thresholds: CrashThresholds,
    /// Weak so the actor stops once every handle is dropped
    tx: mpsc::WeakUnboundedSender<Command>,
    status: Arc<RwLock<SupervisorStatus>>,
    process: Option<ServerProcess>,
    /// Bumped on every spawn; exits of older processes are ignored
    generation: u64,
    started_at: Option<Instant>,
    intentional_restart: bool,
    last_touched: Option<i64>,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Start => self.start(),
                Command::Stop(reply) => {
                    self.stop().await;
                    let _ = reply.send(());
                }
                Command::Restart => self.restart().await,
                Command::Exited { generation, code } => self.handle_exit(generation, code),
                Command::ClearRestartFlag { generation } => {
                    if generation == self.generation {
                        self.intentional_restart = false;
                    }
                }
                Command::MarkTouched(id) => self.last_touched = Some(id),
            }
        }

        self.stop().await;
        debug!("Content server supervisor shut down");
    }

    /// Deliver `command` to ourselves after `delay`
    fn schedule(&self, command: Command, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(command);
            }
        });
    }

    fn set_state(&self, state: ServerState) {
        let mut status = self.status.write();
        status.state = state;
        if state != ServerState::Running {
            status.pid = None;
        }
    }

    fn start(&mut self) {
        if self.process.is_some() {
            debug!("Content server already running");
            return;
        }

        let archives = match self.db.active_archives() {
            Ok(archives) => archives,
            Err(e) => {
                error!(error = %e, "Failed to load active archives");
                return;
            }
        };

        let paths: Vec<PathBuf> = archives
            .iter()
            .filter(|archive| {
                let exists = archive.filepath.exists();
                if !exists {
                    warn!("Skipping {}: {:?} is missing", archive.filename, archive.filepath);
                }
                exists
            })
            .map(|archive| archive.filepath.clone())
            .collect();

        if paths.is_empty() {
            info!("No active archives; content server not started");
            self.set_state(ServerState::Stopped);
            self.status.write().archives.clear();
            return;
        }

        self.set_state(ServerState::Starting);
        let generation = self.generation + 1;
        let tx = self.tx.clone();

        let spawned = ServerProcess::spawn(
            &self.settings.binary,
            self.settings.port,
            &paths,
            Duration::from_secs(self.settings.stop_timeout_secs),
            move |code| {
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Command::Exited { generation, code });
                }
            },
        );

        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                error!(error = %e, "Failed to spawn {:?}", self.settings.binary);
                self.set_state(ServerState::Stopped);
                return;
            }
        };

        info!(
            "Content server started on port {} with {} archive(s) (pid {:?})",
            self.settings.port,
            paths.len(),
            process.pid
        );

        self.generation = generation;
        self.started_at = Some(Instant::now());
        {
            let mut status = self.status.write();
            status.state = ServerState::Running;
            status.pid = process.pid;
            status.archives = paths;
            status.started_at = Some(Utc::now());
        }
        self.process = Some(process);

        if self.intentional_restart {
            self.schedule(
                Command::ClearRestartFlag { generation },
                Duration::from_secs(self.settings.restart_flag_clear_secs),
            );
        }
    }

    async fn stop(&mut self) {
        if let Some(process) = self.process.take() {
            info!("Stopping content server");
            process.stop().await;
        }
        self.started_at = None;
        self.set_state(ServerState::Stopped);
    }

    async fn restart(&mut self) {
        info!("Restarting content server");
        self.intentional_restart = true;
        self.stop().await;
        self.status.write().restarts += 1;
        self.schedule(
            Command::Start,
            Duration::from_secs(self.settings.restart_cooldown_secs),
        );
    }

    fn handle_exit(&mut self, generation: u64, code: Option<i32>) {
        if generation != self.generation || self.process.is_none() {
            debug!("Ignoring exit of a superseded content server");
            return;
        }

        self.process = None;
        let uptime = self
            .started_at
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();

        {
            let mut status = self.status.write();
            status.last_exit_code = code;
        }
        self.set_state(ServerState::Exited);

        match classify_exit(code, uptime, self.intentional_restart, &self.thresholds) {
            ExitKind::Normal => {
                info!(
                    "Content server exited with code {:?} after {:.1}s",
                    code,
                    uptime.as_secs_f64()
                );
                self.set_state(ServerState::Stopped);
            }
            ExitKind::Crash => {
                self.status.write().crashes += 1;
                self.handle_crash(code, uptime);
            }
        }
    }

    fn handle_crash(&mut self, code: Option<i32>, uptime: Duration) {
        let exit = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        error!(
            "Content server crashed (exit code {}, uptime {:.1}s)",
            exit,
            uptime.as_secs_f64()
        );

        let Some(suspect) = self.crash_suspect() else {
            warn!(
                "No crash suspect identified; retrying in {}s",
                self.settings.blind_retry_delay_secs
            );
            self.schedule(
                Command::Start,
                Duration::from_secs(self.settings.blind_retry_delay_secs),
            );
            return;
        };

        let message = format!(
            "Content server crashed shortly after loading this archive (exit code {}, uptime {:.1}s)",
            exit,
            uptime.as_secs_f64()
        );

        match self.db.quarantine(suspect.id, &message) {
            Ok(_) => {
                warn!("Quarantined {} (id {})", suspect.filename, suspect.id);
                let activity = NewActivity::new(ActivityAction::Quarantined, ActivityStatus::Failed)
                    .archive(&suspect)
                    .error(message);
                if let Err(e) = self.db.insert_activity(&activity) {
                    warn!(error = %e, "Failed to record quarantine");
                }
            }
            Err(e) => error!(error = %e, "Failed to quarantine {}", suspect.filename),
        }
        self.last_touched = None;

        self.schedule(
            Command::Start,
            Duration::from_secs(self.settings.crash_retry_delay_secs),
        );
    }

    /// The last-touched archive if still active, else the newest active
    /// one the crashed process actually loaded
    fn crash_suspect(&self) -> Option<Archive> {
        let touched = self
            .last_touched
            .and_then(|id| self.db.get_archive(id).ok().flatten())
            .filter(Archive::is_active);

        if touched.is_some() {
            return touched;
        }

        let loaded = self.status.read().archives.clone();
        match self.db.active_archives() {
            // Oldest first, so the newest loaded row is the last match
            Ok(archives) => archives
                .into_iter()
                .rev()
                .find(|archive| loaded.contains(&archive.filepath)),
            Err(e) => {
                error!(error = %e, "Failed to look up crash suspect");
                None
            }
        }
    }
}
