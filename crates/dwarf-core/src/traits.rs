//! Collaborator traits: the agent entry point, the device, the attached
//! process with its script channel, and the user-facing frontend.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::Hook;

/// Reply returned by the agent's call entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// Structured reply.
    Json(Value),
    /// Raw bytes (memory reads).
    Binary(Bytes),
    /// The call returned nothing.
    Empty,
}

impl AgentReply {
    /// String value of a JSON reply, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Bytes of a binary reply, if it is one.
    #[must_use]
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Whether the reply carries no result.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty | Self::Json(Value::Null))
    }
}

/// Agent call error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("No script channel loaded")]
    NoChannel,
    #[error("Agent rejected {api}: {message}")]
    Remote { api: String, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unexpected reply to {0}")]
    UnexpectedReply(String),
}

/// Generic request/response entry point into the agent.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Invoke `name` on the agent in the context of `thread_id` and await its reply.
    async fn api(
        &self,
        thread_id: u64,
        name: &str,
        args: Vec<Value>,
    ) -> Result<AgentReply, AgentError>;
}

/// Process selector for attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Numeric process id.
    Pid(u32),
    /// Package or process name.
    Package(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "{pid}"),
            Self::Package(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        s.trim()
            .parse()
            .map_or_else(|_| Self::Package(s.trim().to_string()), Self::Pid)
    }
}

/// Event delivered by a loaded script channel, strictly in order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Inbound message with optional binary payload.
    Message { message: Value, data: Option<Bytes> },
    /// The script was destroyed (unloaded, or the process went away).
    Destroyed,
}

/// Receiving half of a script channel's event stream.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Device-side error.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device unavailable: {0}")]
    Unavailable(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(String),
    #[error("Operation failed: {0}")]
    Failed(String),
}

/// Script loaded into an attached process.
#[async_trait]
pub trait ScriptChannel: Send + Sync {
    /// Load the script. Events produced from this point on are delivered on
    /// the returned receiver.
    async fn load(&self) -> Result<ChannelEvents, DeviceError>;

    /// Call the script's exported API.
    async fn call(
        &self,
        thread_id: u64,
        api: &str,
        args: Vec<Value>,
    ) -> Result<AgentReply, AgentError>;

    /// Unload the script.
    async fn unload(&self) -> Result<(), DeviceError>;
}

/// Attached target process.
#[async_trait]
pub trait TargetProcess: Send + Sync {
    /// Process id as reported by the device.
    fn pid(&self) -> u32;

    /// Create a script from `source` bound to this process.
    async fn create_script(&self, source: &str) -> Result<Arc<dyn ScriptChannel>, DeviceError>;

    /// Detach from the process.
    async fn detach(&self) -> Result<(), DeviceError>;
}

/// Device hosting target processes.
#[async_trait]
pub trait Device: Send + Sync {
    /// Attach to a running process.
    async fn attach(&self, target: &Target) -> Result<Arc<dyn TargetProcess>, DeviceError>;

    /// Spawn `package` suspended and return its pid.
    async fn spawn(&self, package: &str) -> Result<u32, DeviceError>;

    /// Resume a spawned process.
    async fn resume(&self, pid: u32) -> Result<(), DeviceError>;

    /// Kill any running instance of `package`.
    async fn kill_package(&self, package: &str) -> Result<(), DeviceError>;
}

/// Source of device handles.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Obtain the device to operate on.
    async fn device(&self) -> Result<Arc<dyn Device>, DeviceError>;
}

/// User-facing collaborator.
///
/// Every method has a no-op default so frontends only implement what they
/// render. Calls happen on the dispatch task and must not block.
pub trait Frontend: Send + Sync {
    fn log(&self, _text: &str) {}
    fn alert(&self, _title: &str, _detail: &str) {}
    fn on_script_loaded(&self) {}
    fn on_script_destroyed(&self) {}
    fn on_context_info(&self) {}
    fn on_java_classes_enumeration_start(&self) {}
    fn on_java_classes_enumeration_match(&self, _class_name: &str) {}
    fn on_java_classes_enumeration_complete(&self) {}
    fn on_bytes_search_complete(&self) {}
    fn on_hook_installed(&self, _hook: &Hook) {}
    fn on_onload_hit(&self, _module: &str, _base: &str) {}
    fn add_context(&self, _context: &Value, _loading_library: Option<&str>) {}
    /// Whether the registers view already shows a context.
    fn has_register_context(&self) -> bool {
        false
    }
    fn request_focus(&self) {}
    fn append_data(&self, _key: &str, _text: &str) {}
}

/// Frontend that renders nothing.
#[derive(Debug, Default, Clone)]
pub struct NullFrontend;

impl Frontend for NullFrontend {}
