//! Operator console on the bridge's own stdin.
//!
//! A handful of words control the supervisor; every other line is typed
//! into the dedicated server's console.

use link_server::ProcessSupervisor;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Restart,
    Status,
    Players,
    /// Written to the server verbatim
    Server(String),
}

impl ConsoleCommand {
    /// `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let command = match line {
            "" => return None,
            "start" => ConsoleCommand::Start,
            "stop" => ConsoleCommand::Stop,
            "restart" => ConsoleCommand::Restart,
            "status" => ConsoleCommand::Status,
            "players" => ConsoleCommand::Players,
            other => ConsoleCommand::Server(other.to_string()),
        };
        Some(command)
    }
}

/// Reads commands until `input` closes.
pub async fn run_console<R>(input: R, supervisor: ProcessSupervisor)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(command) = ConsoleCommand::parse(&line) {
                    execute(&supervisor, command).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Console input error: {}", e);
                break;
            }
        }
    }
}

async fn execute(supervisor: &ProcessSupervisor, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Start => {
            if let Err(e) = supervisor.start().await {
                error!("❌ Failed to start server: {}", e);
            }
        }
        ConsoleCommand::Stop => {
            if !supervisor.stop().await {
                info!("Server is not running");
            }
        }
        ConsoleCommand::Restart => {
            if let Err(e) = supervisor.restart().await {
                error!("❌ Failed to restart server: {}", e);
            }
        }
        ConsoleCommand::Status => {
            info!("📋 Server status: {}", supervisor.status());
        }
        ConsoleCommand::Players => {
            let players = supervisor.players();
            if players.is_empty() {
                info!("👥 No players online");
            } else {
                info!("👥 {} player(s) online", players.len());
                for player in players {
                    info!("  - {} (xuid {})", player.name, player.xuid);
                }
            }
        }
        ConsoleCommand::Server(line) => {
            if !supervisor.run_command(&line).await {
                warn!("Server is not online; dropped command: {}", line);
            }
        }
    }
}
