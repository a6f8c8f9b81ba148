//! Supervision of the dedicated server process.
//!
//! [`ProcessSupervisor`] owns the child process and walks it through
//! `offline -> starting -> online -> stopping -> offline`. Output is fed
//! through a [`LogDemultiplexer`]; lifecycle markers drive the transitions
//! and every classified record is rebroadcast to subscribers.
//!
//! Each spawn gets a generation number. Reader tasks and stop timers carry
//! the generation they were created for and go quiet once it is superseded,
//! so a slow reader from a killed process can never disturb its successor.

mod platform;

pub use platform::{LaunchSpec, Platform, SHUTDOWN_COMMAND};

use crate::correlation::CallTransport;
use crate::error::{BridgeError, Result};
use crate::logs::{LogDemultiplexer, LogRecord, Marker, RecordKind};
use crate::protocol::ScriptCommand;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

const RECORD_CHANNEL_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 8192;
/// Grace after SIGINT before the process is killed outright.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Offline,
    Starting,
    Online,
    Stopping,
    /// The last spawn failed. Cleared by the next `start()`.
    Errored,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Offline => "offline",
            Status::Starting => "starting",
            Status::Online => "online",
            Status::Stopping => "stopping",
            Status::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// A player currently connected to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Player {
    pub name: String,
    pub xuid: String,
}

#[derive(Default)]
struct ChildSlot {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

struct Inner {
    spec: LaunchSpec,
    stop_timeout: Duration,
    slot: Mutex<ChildSlot>,
    generation: AtomicU64,
    status: watch::Sender<Status>,
    records: broadcast::Sender<LogRecord>,
    players: DashMap<String, Player>,
}

/// Owns the dedicated server process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(spec: LaunchSpec, stop_timeout: Duration) -> Self {
        let (status, _) = watch::channel(Status::Offline);
        let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                spec,
                stop_timeout,
                slot: Mutex::new(ChildSlot::default()),
                generation: AtomicU64::new(0),
                status,
                records,
                players: DashMap::new(),
            }),
        }
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// Every classified output record, in arrival order.
    pub fn subscribe_records(&self) -> broadcast::Receiver<LogRecord> {
        self.inner.records.subscribe()
    }

    /// Connected players, sorted by name.
    pub fn players(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self
            .inner
            .players
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        players.sort_by(|a, b| a.name.cmp(&b.name));
        players
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.slot.lock().await.child.as_ref().and_then(|child| child.id())
    }

    /// Resolves once the supervisor reaches `target`.
    pub async fn wait_for(&self, target: Status) {
        let mut status = self.subscribe_status();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = status.wait_for(|status| *status == target).await;
    }

    /// Spawns the server. A running server is stopped first and the new one
    /// is only spawned once the old one has settled to `offline`.
    pub async fn start(&self) -> Result<()> {
        match self.status() {
            Status::Starting => {
                warn!("Server is already starting");
                return Ok(());
            }
            Status::Online => {
                self.stop().await;
                self.wait_for(Status::Offline).await;
            }
            Status::Stopping => self.wait_for(Status::Offline).await,
            Status::Offline | Status::Errored => {}
        }

        let mut slot = self.inner.slot.lock().await;
        if slot.child.is_some() {
            debug!("Concurrent start already spawned the server");
            return Ok(());
        }

        self.inner.players.clear();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(Status::Starting);

        let spec = &self.inner.spec;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("❌ Failed to spawn {}: {}", spec.program.display(), e);
                self.set_status(Status::Errored);
                return Err(BridgeError::Spawn(format!("{}: {e}", spec.program.display())));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(self.clone().read_stdout(generation, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stderr(stderr));
        }

        info!(
            "🚀 Started {} (pid {})",
            spec.program.display(),
            child.id().map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
        );
        slot.stdin = child.stdin.take();
        slot.child = Some(child);
        Ok(())
    }

    /// Asks the server to shut down. Returns `false` when there is nothing to stop.
    ///
    /// The shutdown command goes straight to stdin, so this also works while
    /// the server is still starting. If the server has not quit within the
    /// stop timeout it is forced down.
    pub async fn stop(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        match self.status() {
            Status::Offline | Status::Errored => return false,
            Status::Stopping => return true,
            Status::Starting | Status::Online => {}
        }

        let written = match slot.stdin.as_mut() {
            Some(stdin) => write_line(stdin, &self.inner.spec.shutdown_command).await.is_ok(),
            None => false,
        };
        if !written {
            warn!("Could not deliver the shutdown command, forcing stop");
            self.force_stop_locked(&mut slot);
            return true;
        }

        info!("🛑 Stopping server");
        self.set_status(Status::Stopping);

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.inner.stop_timeout).await;
            let mut slot = supervisor.inner.slot.lock().await;
            if supervisor.inner.generation.load(Ordering::SeqCst) == generation
                && supervisor.status() == Status::Stopping
            {
                warn!(
                    "Server did not stop within {:?}, forcing",
                    supervisor.inner.stop_timeout
                );
                supervisor.force_stop_locked(&mut slot);
            }
        });

        true
    }

    /// Interrupts the child, forgets it and settles to `offline`. Safe to
    /// call in any state, any number of times.
    pub async fn force_stop(&self) {
        let mut slot = self.inner.slot.lock().await;
        self.force_stop_locked(&mut slot);
    }

    /// `stop()` followed by `start()` once the stop has settled.
    pub async fn restart(&self) -> Result<()> {
        if self.stop().await {
            self.wait_for(Status::Offline).await;
        }
        self.start().await
    }

    /// Writes a console command. Refused unless the server is online.
    pub async fn run_command(&self, command: &str) -> bool {
        let mut slot = self.inner.slot.lock().await;
        let status = self.status();
        if status != Status::Online {
            debug!("Refusing command while {}: {}", status, command);
            return false;
        }

        let Some(stdin) = slot.stdin.as_mut() else {
            return false;
        };
        match write_line(stdin, command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write to server stdin: {}", e);
                false
            }
        }
    }

    /// Sends a named event to the in-engine script.
    pub async fn run_event(&self, event: &str, payload: Value) -> bool {
        match ScriptCommand::new(event, payload).encode() {
            Ok(line) => self.run_command(&line).await,
            Err(e) => {
                warn!("Failed to encode script event '{}': {}", event, e);
                false
            }
        }
    }

    fn set_status(&self, status: Status) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            debug!("Server status {} -> {}", previous, status);
        }
    }

    fn force_stop_locked(&self, slot: &mut ChildSlot) {
        // Retire the current incarnation before anything else observes it.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        slot.stdin = None;
        if let Some(mut child) = slot.child.take() {
            interrupt(&mut child);
            tokio::spawn(reap(child));
        }
        self.inner.players.clear();

        if self.inner.status.send_replace(Status::Offline) != Status::Offline {
            info!("Server offline");
        }
    }

    async fn read_stdout(self, generation: u64, mut stdout: impl AsyncRead + Unpin) {
        let mut demux = LogDemultiplexer::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to read server output: {}", e);
                    break;
                }
            };
            for record in demux.push(&buf[..n]) {
                self.handle_record(generation, record).await;
            }
        }
        for record in demux.finish() {
            self.handle_record(generation, record).await;
        }

        let mut slot = self.inner.slot.lock().await;
        if self.inner.generation.load(Ordering::SeqCst) == generation && slot.child.is_some() {
            warn!("⚠️ Server output closed without a clean shutdown, treating it as a crash");
            self.force_stop_locked(&mut slot);
        }
    }

    async fn handle_record(&self, generation: u64, record: LogRecord) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        record.echo();

        match &record.kind {
            RecordKind::Lifecycle(Marker::ServerStarted) => {
                let went_online = self.inner.status.send_if_modified(|status| {
                    if *status == Status::Starting {
                        *status = Status::Online;
                        true
                    } else {
                        false
                    }
                });
                if went_online {
                    info!("✅ Server online");
                }
            }
            RecordKind::Lifecycle(Marker::QuitCorrectly) => self.force_stop().await,
            RecordKind::Lifecycle(Marker::PlayerConnected { name, xuid }) => {
                self.inner.players.insert(
                    name.clone(),
                    Player {
                        name: name.clone(),
                        xuid: xuid.clone(),
                    },
                );
            }
            RecordKind::Lifecycle(Marker::PlayerDisconnected { name, .. }) => {
                self.inner.players.remove(name);
            }
            _ => {}
        }

        // No subscribers is fine.
        let _ = self.inner.records.send(record);
    }
}

#[async_trait]
impl CallTransport for ProcessSupervisor {
    async fn send_event(&self, name: &str, payload: Value) -> Result<()> {
        if self.run_event(name, payload).await {
            Ok(())
        } else {
            Err(BridgeError::NotRunning)
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn read_stderr(stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "bds", "{}", line);
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill server process: {}", e);
    }
}

async fn reap(mut child: Child) {
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!("Server process exited: {}", status),
        Ok(Err(e)) => warn!("Failed to wait for server process: {}", e),
        Err(_) => {
            warn!("Server process ignored the interrupt, killing it");
            if let Err(e) = child.kill().await {
                error!("Failed to kill server process: {}", e);
            }
        }
    }
}
