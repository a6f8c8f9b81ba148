//! Server output demultiplexing.
//!
//! The dedicated server writes two kinds of lines to stdout: records that
//! start with a `[YYYY-MM-DD hh:mm:ss:mmm LEVEL]` stamp, and a few bare lines
//! such as `Quit correctly`. Stdout arrives in chunks that ignore line
//! boundaries, so [`LogDemultiplexer`] buffers raw bytes and only classifies
//! a line once its newline has arrived. Splitting the same stream at
//! different points therefore always yields the same records.
//!
//! Classification of a timestamped record, first match wins:
//!
//! 1. `[Scripting] @name>json` or `[Scripting] @name` - a script event
//! 2. any other `[Scripting] ` text - script output passed through
//! 3. lifecycle phrases (`Server started.`, `Data saved. ...`, player joins
//!    and leaves)
//! 4. anything else - an opaque line
//!
//! Records are line-granular. Continuation lines the server prints after a
//! stamped line, such as the file list that follows `Data saved. ...`, are
//! not folded into that record; each one becomes its own untimestamped
//! [`RecordKind::Plain`] record. Bare lifecycle lines like `Quit correctly`
//! rely on this, since they carry no stamp of their own.
//!
//! A line that grows past [`LogDemultiplexer::MAX_LINE_BYTES`] without a
//! newline is flushed as-is so a misbehaving child cannot grow the buffer
//! without bound.

use crate::protocol::script::parse_event_line;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}:\d{3} (?:INFO|ERROR|WARN|DEBUG|TRACE)\]")
        .expect("timestamp pattern is valid")
});

static PLAYER_CONNECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Player connected: (.+?), xuid: ?(\d*)").expect("player pattern is valid")
});

static PLAYER_DISCONNECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Player disconnected: (.+?), xuid: ?(\d*)").expect("player pattern is valid")
});

const SCRIPTING_PREFIX: &str = "[Scripting] ";
const SERVER_STARTED: &str = "Server started.";
const DATA_SAVED: &str = "Data saved. Files are now ready to be copied.";
const QUIT_CORRECTLY: &str = "Quit correctly";

/// Lifecycle signals recognised in server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    ServerStarted,
    /// A `save hold` snapshot is complete and the world files may be copied.
    DataSaved,
    /// The server finished shutting down.
    QuitCorrectly,
    PlayerConnected { name: String, xuid: String },
    PlayerDisconnected { name: String, xuid: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    ScriptEvent { name: String, payload: Option<Value> },
    ScriptLog(String),
    Lifecycle(Marker),
    Plain { timestamped: bool },
}

/// One classified line of server output.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// The trimmed line as the server wrote it.
    pub raw: String,
    pub kind: RecordKind,
}

impl LogRecord {
    /// Re-emits the line under the `bds` target.
    pub fn echo(&self) {
        match &self.kind {
            RecordKind::ScriptLog(text) => info!(target: "bds", "[Script] {}", text),
            RecordKind::ScriptEvent { .. } => {}
            RecordKind::Lifecycle(_) | RecordKind::Plain { .. } => info!(target: "bds", "{}", self.raw),
        }
    }
}

/// Classifies a single line of server output.
///
/// Returns `None` for blank lines and for script events whose payload is
/// not valid JSON; the latter are reported and dropped.
pub fn classify_line(line: &str) -> Option<LogRecord> {
    let raw = line.trim();
    if raw.is_empty() {
        return None;
    }

    let kind = match TIMESTAMP.find(raw) {
        Some(stamp) => {
            let body = raw[stamp.end()..].trim();
            if body.is_empty() {
                return None;
            }
            classify_body(body)?
        }
        None if raw == QUIT_CORRECTLY => RecordKind::Lifecycle(Marker::QuitCorrectly),
        None => RecordKind::Plain { timestamped: false },
    };

    Some(LogRecord {
        raw: raw.to_string(),
        kind,
    })
}

fn classify_body(body: &str) -> Option<RecordKind> {
    if let Some(script) = body.strip_prefix(SCRIPTING_PREFIX) {
        let script = script.trim();
        return match script.strip_prefix('@') {
            Some(event) => match parse_event_line(event) {
                Ok((name, payload)) => Some(RecordKind::ScriptEvent { name, payload }),
                Err(e) => {
                    warn!("Couldn't parse event data: {}", e);
                    None
                }
            },
            None => Some(RecordKind::ScriptLog(script.to_string())),
        };
    }

    if body.starts_with(SERVER_STARTED) {
        return Some(RecordKind::Lifecycle(Marker::ServerStarted));
    }
    if body.starts_with(DATA_SAVED) {
        return Some(RecordKind::Lifecycle(Marker::DataSaved));
    }
    if let Some(caps) = PLAYER_CONNECTED.captures(body) {
        return Some(RecordKind::Lifecycle(Marker::PlayerConnected {
            name: caps[1].to_string(),
            xuid: caps[2].to_string(),
        }));
    }
    if let Some(caps) = PLAYER_DISCONNECTED.captures(body) {
        return Some(RecordKind::Lifecycle(Marker::PlayerDisconnected {
            name: caps[1].to_string(),
            xuid: caps[2].to_string(),
        }));
    }

    Some(RecordKind::Plain { timestamped: true })
}

/// Turns arbitrary stdout chunks into classified records.
#[derive(Debug, Default)]
pub struct LogDemultiplexer {
    pending: Vec<u8>,
}

impl LogDemultiplexer {
    /// Longest unterminated line kept in the buffer.
    pub const MAX_LINE_BYTES: usize = 256 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the records completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogRecord> {
        self.pending.extend_from_slice(chunk);

        let mut records = Vec::new();
        if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            let tail = self.pending.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.pending, tail);
            records.extend(
                complete
                    .split(|b| *b == b'\n')
                    .filter_map(|line| classify_line(&String::from_utf8_lossy(line))),
            );
        }

        if self.pending.len() > Self::MAX_LINE_BYTES {
            warn!(
                "Server wrote {} bytes without a newline, flushing",
                self.pending.len()
            );
            records.extend(self.finish());
        }

        records
    }

    /// Flushes a trailing line that never got its newline. Call at EOF.
    pub fn finish(&mut self) -> Vec<LogRecord> {
        let rest = std::mem::take(&mut self.pending);
        classify_line(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }

    /// Bytes buffered while waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
