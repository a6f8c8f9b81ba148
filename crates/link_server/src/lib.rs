//! # Link Server - Bedrock Dedicated Server Bridge
//!
//! Runs a Bedrock dedicated server as a child process and connects it to two
//! outside parties: the in-engine script that ships with the world, and any
//! number of websocket peers.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Process Supervisor** ([`supervisor`]) - owns the child process and its
//!   `offline -> starting -> online -> stopping` lifecycle
//! * **Log Demultiplexer** ([`logs`]) - turns raw stdout chunks into
//!   classified records
//! * **Correlation** ([`correlation`]) - request/response with deadlines over
//!   the one-way script channel
//! * **Socket Relay** ([`relay`]) - pub/sub fan-out to websocket peers, as a
//!   listener or a reconnecting client
//! * **Bridge** ([`Bridge`]) - routes traffic between all of the above
//!
//! ### Message Flow
//!
//! 1. The server prints `[Scripting] @Weather>{...}`
//! 2. The supervisor's reader demultiplexes it into a script event record
//! 3. The bridge maps it to [`EventKind::Weather`] and broadcasts it
//! 4. Every peer subscribed to `"Weather"` receives
//!    `{"type":2,"body":{"event":"Weather","type":6,"data":{...}}}`
//!
//! In the other direction, a peer's `{"type":1,"body":"time set day"}` is
//! written to the server console, and [`Bridge::call`] writes a
//! `scriptevent link:callback {...}` and waits for the script's matching
//! `@callbackReturn`.
//!
//! ## Error Handling
//!
//! All fallible operations return [`BridgeError`]. Malformed input from the
//! server or from peers is logged and dropped; only an unsupported platform
//! is treated as fatal.

pub use bridge::Bridge;
pub use config::{AllowList, BridgeConfig, SocketConfig, SocketMode};
pub use error::{BridgeError, Result};
pub use events::{DomainEvent, EventKind};
pub use supervisor::{LaunchSpec, Platform, Player, ProcessSupervisor, Status};

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod logs;
pub mod protocol;
pub mod relay;
pub mod supervisor;
