//! Relay engine
//!
//! The stateless core of the bridge: take a message delivered on an origin
//! topic, resolve its destination through the routing table, and hand the
//! unmodified payload to the publish dispatcher. Messages without a route
//! are dropped and counted, never treated as errors.

mod dispatcher;
mod engine;


pub use dispatcher::{Dispatch, DispatchError, PublishDispatcher};
pub use engine::{InboundMessage, Outcome, RelayEngine};
