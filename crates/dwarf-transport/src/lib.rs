//! Device bridge transport.
//!
//! Provides:
//! - Wire protocol (JSON lines + base64)
//! - `BridgePeer` - `Device`, `TargetProcess` and `ScriptChannel` over any
//!   async byte stream

pub mod peer;
pub mod protocol;

pub use peer::{BridgePeer, BridgeProcess, BridgeScript};
pub use protocol::{BridgeEvent, BridgeRequest, BridgeResponse, ProtocolError};
