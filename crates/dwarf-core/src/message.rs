//! Tagged-string messages sent by the agent.
//!
//! A payload is a list of fields joined by [`DELIMITER`]; the first field is
//! the tag. Every known tag maps to one [`AgentMessage`] variant and anything
//! else becomes [`AgentMessage::Unrecognized`].

use serde_json::Value;
use thiserror::Error;

use crate::{CorrelationId, hooks::parse_hex_address};

/// Field separator in agent payloads.
pub const DELIMITER: &str = ":::";

/// Message parse error.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed message: {0:?}")]
    Malformed(String),
    #[error("{tag} expects {expected} fields, got {got}")]
    Arity {
        tag: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Invalid JSON in {tag}: {source}")]
    Json {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid address {0:?}")]
    Address(String),
    #[error("Invalid injection announcement: {0}")]
    Injection(String),
}

/// Payload of a `set_context` message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextPayload {
    /// First message after injection.
    Injection { arch: String, pid: u32, java: bool },
    /// A hook was hit; carries registers, thread and symbol data.
    HookHit(Value),
}

/// Parsed agent message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    EnumerateJavaClassesStart,
    EnumerateJavaClassesMatch {
        class_name: String,
    },
    EnumerateJavaClassesComplete,
    EnumerateJavaMethodsComplete {
        topic: String,
        methods: Value,
    },
    Log {
        text: String,
    },
    HookJavaCallback {
        key: String,
        correlation: Option<CorrelationId>,
    },
    HookNativeCallback {
        address: u64,
        correlation: Option<CorrelationId>,
    },
    MemoryScanMatch {
        topic: String,
        address: String,
        metadata: Value,
    },
    MemoryScanComplete {
        topic: String,
    },
    OnloadCallback {
        module: String,
        base: String,
        thread_id: String,
    },
    SetContext {
        payload: ContextPayload,
        raw: Value,
    },
    SetData {
        key: String,
        literal: Option<String>,
    },
    UpdateModules {
        thread_id: String,
        modules: Value,
    },
    UpdateRanges {
        thread_id: String,
        ranges: Value,
    },
    /// Well-formed payload with an unknown tag.
    Unrecognized {
        tag: String,
        raw: String,
    },
}

impl AgentMessage {
    /// Parse a delimiter-separated payload.
    ///
    /// # Errors
    /// Returns error if the payload has fewer than two fields, a known tag
    /// has too few fields, or a field fails to decode.
    pub fn parse(payload: &str) -> Result<Self, MessageError> {
        let parts: Vec<&str> = payload.split(DELIMITER).collect();
        if parts.len() < 2 {
            return Err(MessageError::Malformed(payload.to_string()));
        }
        let fields = Fields { parts: &parts };

        let message = match parts[0] {
            "enumerate_java_classes_start" => Self::EnumerateJavaClassesStart,
            "enumerate_java_classes_match" => Self::EnumerateJavaClassesMatch {
                class_name: fields.get("enumerate_java_classes_match", 1)?.to_string(),
            },
            "enumerate_java_classes_complete" => Self::EnumerateJavaClassesComplete,
            "enumerate_java_methods_complete" => {
                const TAG: &str = "enumerate_java_methods_complete";
                Self::EnumerateJavaMethodsComplete {
                    topic: fields.get(TAG, 1)?.to_string(),
                    methods: fields.json(TAG, 2)?,
                }
            }
            "log" => Self::Log {
                text: fields.get("log", 1)?.to_string(),
            },
            "hook_java_callback" => Self::HookJavaCallback {
                key: fields.get("hook_java_callback", 1)?.to_string(),
                correlation: fields.correlation(2),
            },
            "hook_native_callback" => {
                let raw = fields.get("hook_native_callback", 1)?;
                Self::HookNativeCallback {
                    address: parse_hex_address(raw)
                        .ok_or_else(|| MessageError::Address(raw.to_string()))?,
                    correlation: fields.correlation(2),
                }
            }
            "memory_scan_match" => {
                const TAG: &str = "memory_scan_match";
                Self::MemoryScanMatch {
                    topic: fields.get(TAG, 1)?.to_string(),
                    address: fields.get(TAG, 2)?.to_string(),
                    metadata: fields.json(TAG, 3)?,
                }
            }
            "memory_scan_complete" => Self::MemoryScanComplete {
                topic: fields.get("memory_scan_complete", 1)?.to_string(),
            },
            "onload_callback" => {
                const TAG: &str = "onload_callback";
                Self::OnloadCallback {
                    module: fields.get(TAG, 1)?.to_string(),
                    base: fields.get(TAG, 2)?.to_string(),
                    thread_id: fields.get(TAG, 3)?.to_string(),
                }
            }
            "set_context" => {
                let raw: Value = fields.json("set_context", 1)?;
                Self::SetContext {
                    payload: context_payload(&raw)?,
                    raw,
                }
            }
            "set_data" => Self::SetData {
                key: fields.get("set_data", 1)?.to_string(),
                literal: parts.get(2).map(|s| (*s).to_string()),
            },
            "update_modules" => {
                const TAG: &str = "update_modules";
                Self::UpdateModules {
                    thread_id: fields.get(TAG, 1)?.to_string(),
                    modules: fields.json(TAG, 2)?,
                }
            }
            "update_ranges" => {
                const TAG: &str = "update_ranges";
                Self::UpdateRanges {
                    thread_id: fields.get(TAG, 1)?.to_string(),
                    ranges: fields.json(TAG, 2)?,
                }
            }
            tag => Self::Unrecognized {
                tag: tag.to_string(),
                raw: payload.to_string(),
            },
        };
        Ok(message)
    }
}

struct Fields<'a> {
    parts: &'a [&'a str],
}

impl<'a> Fields<'a> {
    fn get(&self, tag: &'static str, index: usize) -> Result<&'a str, MessageError> {
        self.parts
            .get(index)
            .copied()
            .ok_or(MessageError::Arity {
                tag,
                expected: index + 1,
                got: self.parts.len(),
            })
    }

    fn json(&self, tag: &'static str, index: usize) -> Result<Value, MessageError> {
        serde_json::from_str(self.get(tag, index)?)
            .map_err(|source| MessageError::Json { tag, source })
    }

    fn correlation(&self, index: usize) -> Option<CorrelationId> {
        self.parts.get(index).and_then(|s| s.parse().ok())
    }
}

fn context_payload(raw: &Value) -> Result<ContextPayload, MessageError> {
    if raw.get("context").is_some() {
        return Ok(ContextPayload::HookHit(raw.clone()));
    }

    let arch = raw
        .get("arch")
        .and_then(Value::as_str)
        .ok_or_else(|| MessageError::Injection("missing arch".to_string()))?;
    let pid = raw
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .ok_or_else(|| MessageError::Injection("missing pid".to_string()))?;
    let java = raw.get("java").and_then(Value::as_bool).unwrap_or(false);

    Ok(ContextPayload::Injection {
        arch: arch.to_string(),
        pid,
        java,
    })
}
