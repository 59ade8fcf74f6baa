//! Core building blocks of the Dwarf instrumentation control plane.
//!
//! This crate provides:
//! - `HookRegistry` - Installed hooks and their install correlation
//! - `PendingArgsCorrelator` - In-flight install records per hook kind
//! - `EventBus` - Topic-keyed result streams
//! - `ChunkedMemoryReader` - Bounded-size memory reads
//! - `AgentMessage` - Parsed agent messages
//! - `ContextState` and `Prefs`
//! - Agent, device and frontend traits

pub mod bus;
pub mod config;
pub mod context;
pub mod correlation;
pub mod hexdump;
pub mod hooks;
pub mod memory;
pub mod message;
pub mod pending;
pub mod traits;

#[cfg(test)]
mod test_agent;

pub use bus::{BusEvent, EventBus, SubscriptionId, TopicStream, completion_topic};
pub use config::{ConfigError, Prefs};
pub use context::ContextState;
pub use correlation::CorrelationId;
pub use hooks::{Hook, HookError, HookKind, HookRegistry};
pub use memory::{CHUNK_CEILING, ChunkedMemoryReader, MemoryError};
pub use message::{AgentMessage, ContextPayload, MessageError};
pub use pending::{Pending, PendingArgs, PendingArgsCorrelator};
pub use traits::{
    AgentApi, AgentError, AgentReply, ChannelEvent, ChannelEvents, Device, DeviceError,
    DeviceProvider, Frontend, NullFrontend, ScriptChannel, Target, TargetProcess,
};
