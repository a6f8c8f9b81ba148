//! Wire formats for both sides of the bridge.
//!
//! * [`socket`] - JSON messages exchanged with websocket peers
//! * [`script`] - text commands written to the server console and the
//!   `@name>payload` lines the in-engine script logs back

pub mod script;
pub mod socket;

pub use script::{CallbackRequest, CallbackReturn, ScriptCommand, CALLBACK_EVENT, CALLBACK_RETURN_EVENT};
pub use socket::{InboundMessage, OutboundMessage};
