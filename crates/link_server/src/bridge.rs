//! Wiring between the supervised server, the in-engine script and the relay.
//!
//! * script events from the server output are relayed to subscribed peers
//! * `callback` / `callbackReturn` events go to the script [`Correlator`]
//! * supervisor transitions and backups become `Started`, `Stopped`,
//!   `Errored` and `Backup` events
//! * commands from peers are written to the server console

use crate::config::BridgeConfig;
use crate::correlation::Correlator;
use crate::error::Result;
use crate::events::{DomainEvent, EventKind};
use crate::logs::{LogRecord, Marker, RecordKind};
use crate::protocol::{CallbackRequest, CallbackReturn, CALLBACK_EVENT, CALLBACK_RETURN_EVENT};
use crate::relay::SocketRelay;
use crate::supervisor::{LaunchSpec, ProcessSupervisor, Status};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

pub struct Bridge {
    supervisor: ProcessSupervisor,
    relay: Arc<SocketRelay>,
    script: Arc<Correlator<ProcessSupervisor>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let spec = config.platform.launch_spec(&config.server_dir);
        Self::with_launch_spec(config, spec)
    }

    /// Like [`Bridge::new`] but launches `spec` instead of the platform default.
    pub fn with_launch_spec(config: BridgeConfig, spec: LaunchSpec) -> Self {
        let supervisor = ProcessSupervisor::new(spec, config.stop_timeout);
        let script = Arc::new(Correlator::new(supervisor.clone(), config.call_timeout));
        let relay = Arc::new(SocketRelay::new(config.socket));

        Self {
            supervisor,
            relay,
            script,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn relay(&self) -> &Arc<SocketRelay> {
        &self.relay
    }

    /// Asks the in-engine script to handle `event` and waits for its reply.
    pub async fn call(&self, event: &str, message: Value) -> Result<Value> {
        self.script.call(event, message).await
    }

    /// Answers calls the script makes for `event`.
    pub fn on_callback<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.script.on_callback(event, handler);
    }

    /// Runs the relay and routes traffic until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut records = self.supervisor.subscribe_records();
        let mut status = self.supervisor.subscribe_status();
        let mut last_status = *status.borrow_and_update();
        let mut commands = self.relay.take_commands();

        let (relay_shutdown, _) = broadcast::channel(1);
        let relay_task = tokio::spawn(self.relay.clone().run(relay_shutdown.subscribe()));

        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Ok(record) => self.handle_record(record),
                    Err(RecvError::Lagged(skipped)) => warn!("Bridge fell behind, {} log records skipped", skipped),
                    Err(RecvError::Closed) => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *status.borrow_and_update();
                    self.relay_status(last_status, current);
                    last_status = current;
                },
                Some(command) = recv_command(&mut commands) => {
                    if !self.supervisor.run_command(&command).await {
                        warn!("Dropped command while server is {}: {}", self.supervisor.status(), command);
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        let _ = relay_shutdown.send(());
        match relay_task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Relay task failed: {}", e);
                Ok(())
            }
        }
    }

    fn handle_record(&self, record: LogRecord) {
        match record.kind {
            RecordKind::ScriptEvent { name, payload } => self.handle_script_event(name, payload),
            RecordKind::Lifecycle(Marker::DataSaved) => {
                self.relay.broadcast(&DomainEvent::new(EventKind::Backup, Value::Null));
            }
            _ => {}
        }
    }

    fn handle_script_event(&self, name: String, payload: Option<Value>) {
        match name.as_str() {
            CALLBACK_EVENT => {
                let request: CallbackRequest = match decode(&name, payload) {
                    Some(request) => request,
                    None => return,
                };
                // Handlers may take a while; keep reading output meanwhile.
                let script = self.script.clone();
                tokio::spawn(async move {
                    if let Err(e) = script.handle_callback(request).await {
                        warn!("Failed to answer script call: {}", e);
                    }
                });
            }
            CALLBACK_RETURN_EVENT => {
                if let Some(reply) = decode::<CallbackReturn>(&name, payload) {
                    // Unknown ids are logged by the registry.
                    let _ = self.script.handle_return(reply);
                }
            }
            _ => match DomainEvent::from_script(&name, payload) {
                Some(event) => {
                    let delivered = self.relay.broadcast(&event);
                    debug!("Relayed '{}' to {} peer(s)", name, delivered);
                }
                None => debug!("Script event '{}' has no relay mapping", name),
            },
        }
    }

    fn relay_status(&self, previous: Status, current: Status) {
        if previous == current {
            return;
        }
        let kind = match current {
            Status::Online => EventKind::Started,
            Status::Offline => EventKind::Stopped,
            Status::Errored => EventKind::Errored,
            Status::Starting | Status::Stopping => return,
        };
        info!("Server {} -> {}", previous, current);
        self.relay
            .broadcast(&DomainEvent::new(kind, json!({ "status": current })));
    }
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, payload: Option<Value>) -> Option<T> {
    let Some(payload) = payload else {
        warn!("'{}' event without payload", name);
        return None;
    };
    match serde_json::from_value(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Malformed '{}' payload: {}", name, e);
            None
        }
    }
}

/// Pends forever once the command stream is gone so `select!` skips it.
async fn recv_command(
    commands: &mut Option<tokio::sync::mpsc::UnboundedReceiver<String>>,
) -> Option<String> {
    match commands {
        Some(rx) => match rx.recv().await {
            Some(command) => Some(command),
            None => {
                *commands = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{SocketConfig, SocketMode};
    use crate::relay::{Peer, PeerId};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(10);

    /// Replies to `ping` calls, emits a weather event on demand, asks the
    /// bridge for the player list and echoes everything else.
    const FAKE_SERVER: &str = r#"
echo "[2024-11-25 23:28:43:087 INFO] Server started."
while read -r line; do
  case "$line" in
    stop) echo "Quit correctly"; exit 0 ;;
    weather) echo "[2024-11-25 23:29:00:000 INFO] [Scripting] @Weather>{\"new\":2}" ;;
    save) echo "[2024-11-25 23:29:00:000 INFO] Data saved. Files are now ready to be copied." ;;
    ask) echo "[2024-11-25 23:29:00:000 INFO] [Scripting] @callback>{\"cbID\":\"AbC123XyZ0\",\"event\":\"players\"}" ;;
    *'"event":"ping"'*)
      id=$(echo "$line" | sed -n 's/.*"cbID":"\([A-Za-z0-9]*\)".*/\1/p')
      echo "[2024-11-25 23:29:00:000 INFO] [Scripting] @callbackReturn>{\"cbID\":\"$id\",\"message\":\"pong\"}" ;;
    *) echo "[2024-11-25 23:29:00:000 INFO] got: $line" ;;
  esac
done
"#;

    struct Harness {
        bridge: Arc<Bridge>,
        shutdown: broadcast::Sender<()>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_server.sh");
        std::fs::write(&script, FAKE_SERVER).unwrap();

        let config = BridgeConfig {
            socket: SocketConfig {
                mode: SocketMode::Disabled,
                ..SocketConfig::default()
            },
            call_timeout: Duration::from_secs(5),
            ..BridgeConfig::default()
        };
        let spec = LaunchSpec::new("sh").arg(script).current_dir(dir.path());
        let bridge = Arc::new(Bridge::with_launch_spec(config, spec));

        let (shutdown, rx) = broadcast::channel(1);
        let runner = bridge.clone();
        tokio::spawn(async move { runner.run(rx).await });
        // Let the run loop subscribe before anything happens.
        tokio::task::yield_now().await;

        Harness {
            bridge,
            shutdown,
            _dir: dir,
        }
    }

    fn subscribe_peer(bridge: &Bridge, events: &str) -> (PeerId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = bridge.relay();
        let id = relay.peers().next_id();
        relay.peers().insert(Peer::new(id, None, tx));
        relay
            .handle_message(id, &format!(r#"{{"type":2,"body":{events}}}"#))
            .unwrap();
        (id, rx)
    }

    async fn next_event(frames: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let frame = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        value["body"].clone()
    }

    async fn start_online(bridge: &Bridge) {
        bridge.supervisor().start().await.unwrap();
        timeout(WAIT, bridge.supervisor().wait_for(Status::Online))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_is_relayed() {
        let h = harness().await;
        let (_, mut frames) = subscribe_peer(&h.bridge, r#"["Started","Stopped","Backup"]"#);

        start_online(&h.bridge).await;
        let started = next_event(&mut frames).await;
        assert_eq!(started["event"], "Started");
        assert_eq!(started["type"], 15);
        assert_eq!(started["data"]["status"], "online");

        assert!(h.bridge.supervisor().run_command("save").await);
        let backup = next_event(&mut frames).await;
        assert_eq!(backup["type"], 14);

        h.bridge.supervisor().stop().await;
        let stopped = next_event(&mut frames).await;
        assert_eq!(stopped["event"], "Stopped");

        let _ = h.shutdown.send(());
    }

    #[tokio::test]
    async fn test_script_events_reach_subscribers() {
        let h = harness().await;
        let (_, mut frames) = subscribe_peer(&h.bridge, r#"["Weather"]"#);

        start_online(&h.bridge).await;
        assert!(h.bridge.supervisor().run_command("weather").await);

        let weather = next_event(&mut frames).await;
        assert_eq!(weather["event"], "Weather");
        assert_eq!(weather["type"], 6);
        assert_eq!(weather["data"], json!({"new": 2}));

        h.bridge.supervisor().force_stop().await;
        let _ = h.shutdown.send(());
    }

    #[tokio::test]
    async fn test_call_into_script() {
        let h = harness().await;
        start_online(&h.bridge).await;

        let reply = h.bridge.call("ping", Value::Null).await.unwrap();
        assert_eq!(reply, json!("pong"));

        h.bridge.supervisor().force_stop().await;
        let _ = h.shutdown.send(());
    }

    #[tokio::test]
    async fn test_script_calls_are_answered() {
        let h = harness().await;
        h.bridge
            .on_callback("players", |_| async { json!(["Steve"]) });
        let mut records = h.bridge.supervisor().subscribe_records();
        start_online(&h.bridge).await;

        assert!(h.bridge.supervisor().run_command("ask").await);

        let echoed = timeout(WAIT, async {
            loop {
                if let Ok(record) = records.recv().await {
                    if record.raw.contains("got: scriptevent link:callbackReturn") {
                        return record.raw;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(echoed.contains(r#""cbID":"AbC123XyZ0""#));
        assert!(echoed.contains(r#""message":["Steve"]"#));

        h.bridge.supervisor().force_stop().await;
        let _ = h.shutdown.send(());
    }

    #[tokio::test]
    async fn test_peer_commands_reach_the_server() {
        let h = harness().await;
        let mut records = h.bridge.supervisor().subscribe_records();
        start_online(&h.bridge).await;

        h.bridge
            .relay()
            .handle_message(0, r#"{"type":1,"body":"say hello"}"#)
            .unwrap();

        timeout(WAIT, async {
            loop {
                if let Ok(record) = records.recv().await {
                    if record.raw.ends_with("got: say hello") {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        h.bridge.supervisor().force_stop().await;
        let _ = h.shutdown.send(());
    }
}
