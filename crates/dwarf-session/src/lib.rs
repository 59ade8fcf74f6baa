//! Session lifecycle and message dispatch for the Dwarf control plane.
//!
//! Provides:
//! - `SessionController` - Attach, spawn, script load and teardown
//! - `MessageDispatcher` - Routing of inbound agent messages

pub mod dispatcher;
pub mod manager;
pub mod state;

#[cfg(test)]
mod test_support;

pub use dispatcher::MessageDispatcher;
pub use manager::{METHOD_ENUMERATION_TIMEOUT, SessionController, SessionError};
pub use state::SessionState;
