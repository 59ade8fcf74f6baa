//! Target context state announced by the agent.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Pointer size for an architecture tag.
#[must_use]
pub fn pointer_size_for(arch: &str) -> usize {
    if arch == "arm" { 4 } else { 8 }
}

/// Parse a thread id delivered either as a JSON number or a numeric string.
#[must_use]
pub fn thread_id_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            s.strip_prefix("0x")
                .map_or_else(|| s.parse().ok(), |hex| u64::from_str_radix(hex, 16).ok())
        }
        _ => None,
    }
}

/// State merged from `set_context`, `update_modules` and `update_ranges`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextState {
    /// Architecture tag (`"arm"`, `"arm64"`, `"ia32"`, ...).
    pub arch: Option<String>,
    /// Pointer size derived from the architecture, zero until known.
    pub pointer_size: usize,
    /// Process id announced at injection.
    pub pid: u32,
    /// Whether the Java runtime is available in the target.
    pub java_available: bool,
    /// Hook-hit contexts not yet consumed by the frontend.
    pub contexts: Vec<Value>,
    /// Thread id of the current context.
    pub thread_id: u64,
    /// Register snapshot of the most recent hook hit.
    pub registers: Option<Value>,
    /// Module lists keyed by thread id.
    pub modules: HashMap<u64, Value>,
    /// Range lists keyed by thread id.
    pub ranges: HashMap<u64, Value>,
    /// Module currently being loaded, set by an on-load hit.
    pub loading_library: Option<String>,
}

impl ContextState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the injection announcement.
    pub fn set_injection(&mut self, arch: &str, pid: u32, java_available: bool) {
        self.arch = Some(arch.to_string());
        self.pointer_size = pointer_size_for(arch);
        self.pid = pid;
        self.java_available = java_available;
    }

    /// Queue a hook-hit context and return how many are queued.
    pub fn push_context(&mut self, context: Value) -> usize {
        self.contexts.push(context);
        self.contexts.len()
    }

    /// Merge a context-bearing object into the state.
    ///
    /// Recognized keys: `tid`, `modules`, `ranges`, `context`.
    pub fn apply(&mut self, data: &Value) {
        let tid = data.get("tid").and_then(thread_id_of);
        if let Some(tid) = tid {
            self.thread_id = tid;
        }
        let key = tid.unwrap_or(self.thread_id);

        if let Some(modules) = data.get("modules") {
            self.modules.insert(key, modules.clone());
        }
        if let Some(ranges) = data.get("ranges") {
            self.ranges.insert(key, ranges.clone());
        }
        if let Some(context) = data.get("context") {
            self.registers = Some(context.clone());
        }
    }

    /// Thread id to use when a caller passes zero.
    #[must_use]
    pub const fn context_tid(&self) -> u64 {
        self.thread_id
    }

    /// Reset to the empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
