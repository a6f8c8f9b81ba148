//! Correlated calls over one-way event channels.
//!
//! Neither the server console nor the script log offers request/response
//! framing. [`CorrelationRegistry`] tracks outstanding calls by id with a
//! deadline, and [`Correlator`] layers the `callback` / `callbackReturn`
//! handshake over any [`CallTransport`].

mod correlator;
mod registry;

pub use correlator::{CallTransport, Correlator};
pub use registry::{CallId, CallOutcome, CallTimeout, CorrelationRegistry};
