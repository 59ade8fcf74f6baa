//! Routing of inbound agent messages.

use std::sync::Arc;

use dwarf_core::{
    AgentMessage, BusEvent, ContextPayload, ContextState, EventBus, Frontend, HookRegistry,
    MessageError, completion_topic, hexdump::hexdump,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Routes each inbound message to the hook registry, the event bus, the
/// context state or the frontend.
///
/// Handlers are synchronous and never call back into the agent: the channel
/// delivers one message at a time and a handler waiting on the channel would
/// stall it.
#[derive(Clone)]
pub struct MessageDispatcher {
    hooks: Arc<HookRegistry>,
    bus: Arc<EventBus>,
    context: Arc<Mutex<ContextState>>,
    frontend: Arc<dyn Frontend>,
}

impl MessageDispatcher {
    /// Create a dispatcher over shared state.
    #[must_use]
    pub fn new(
        hooks: Arc<HookRegistry>,
        bus: Arc<EventBus>,
        context: Arc<Mutex<ContextState>>,
        frontend: Arc<dyn Frontend>,
    ) -> Self {
        Self {
            hooks,
            bus,
            context,
            frontend,
        }
    }

    /// Handle one raw channel message and its optional binary payload.
    ///
    /// Messages without a string payload, malformed payloads and unknown
    /// tags are logged and dropped.
    pub fn dispatch(&self, message: &Value, data: Option<&[u8]>) {
        let Some(payload) = message.get("payload").and_then(Value::as_str) else {
            tracing::info!(%message, "Agent message without payload");
            return;
        };

        match AgentMessage::parse(payload) {
            Ok(parsed) => self.handle(parsed, data),
            Err(MessageError::Malformed(raw)) => tracing::info!(%raw, "Unstructured agent message"),
            Err(e) => tracing::warn!(error = %e, %payload, "Dropping agent message"),
        }
    }

    /// Handle one parsed message.
    pub fn handle(&self, message: AgentMessage, data: Option<&[u8]>) {
        match message {
            AgentMessage::EnumerateJavaClassesStart => {
                self.frontend.on_java_classes_enumeration_start();
            }
            AgentMessage::EnumerateJavaClassesMatch { class_name } => {
                self.frontend.on_java_classes_enumeration_match(&class_name);
            }
            AgentMessage::EnumerateJavaClassesComplete => {
                self.frontend.on_java_classes_enumeration_complete();
            }
            AgentMessage::EnumerateJavaMethodsComplete { topic, methods } => {
                self.bus.emit(&topic, &BusEvent::Enumeration(methods));
            }
            AgentMessage::Log { text } => self.frontend.log(&text),
            AgentMessage::HookJavaCallback { key, correlation } => {
                let hook = self.hooks.on_java_installed(&key, correlation);
                tracing::info!(%key, "Java hook installed");
                self.frontend.on_hook_installed(&hook);
            }
            AgentMessage::HookNativeCallback {
                address,
                correlation,
            } => {
                let hook = self.hooks.on_native_installed(address, correlation);
                tracing::info!(input = %hook.input, address = format_args!("{address:#x}"), "Native hook installed");
                self.frontend.on_hook_installed(&hook);
            }
            AgentMessage::MemoryScanMatch {
                topic,
                address,
                metadata,
            } => {
                self.bus
                    .emit(&topic, &BusEvent::ScanMatch { address, metadata });
            }
            AgentMessage::MemoryScanComplete { topic } => {
                self.frontend.on_bytes_search_complete();
                self.bus.emit(&completion_topic(&topic), &BusEvent::Complete);
            }
            AgentMessage::OnloadCallback {
                module,
                base,
                thread_id,
            } => {
                self.context.lock().loading_library = Some(module.clone());
                self.frontend
                    .log(&format!("hook onload {module} @thread := {thread_id}"));
                self.frontend.on_onload_hit(&module, &base);
            }
            AgentMessage::SetContext { payload, raw } => self.set_context(payload, &raw),
            AgentMessage::SetData { key, literal } => match data {
                Some(bytes) if !bytes.is_empty() => {
                    self.frontend.append_data(&key, &hexdump(bytes));
                }
                _ => self
                    .frontend
                    .append_data(&key, literal.as_deref().unwrap_or_default()),
            },
            AgentMessage::UpdateModules { thread_id, modules } => {
                self.context
                    .lock()
                    .apply(&json!({ "tid": thread_id, "modules": modules }));
            }
            AgentMessage::UpdateRanges { thread_id, ranges } => {
                self.context
                    .lock()
                    .apply(&json!({ "tid": thread_id, "ranges": ranges }));
            }
            AgentMessage::Unrecognized { tag, raw } => {
                tracing::info!(%tag, %raw, "Unrecognized agent message");
            }
        }
    }

    fn set_context(&self, payload: ContextPayload, raw: &Value) {
        match payload {
            ContextPayload::HookHit(data) => {
                let (queued, loading) = {
                    let mut context = self.context.lock();
                    (context.push_context(data), context.loading_library.clone())
                };
                self.frontend.add_context(raw, loading.as_deref());
                if loading.is_none() {
                    self.frontend.log(&hit_line(raw));
                }
                if queued > 1 && self.frontend.has_register_context() {
                    return;
                }
                self.frontend.request_focus();
            }
            ContextPayload::Injection { arch, pid, java } => {
                self.context.lock().set_injection(&arch, pid, java);
                tracing::info!(pid, %arch, java, "Agent injected");
                self.frontend.log(&format!("injected into := {pid}"));
                self.frontend.on_context_info();
            }
        }

        let mut context = self.context.lock();
        context.apply(raw);
        context.loading_library = None;
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn hit_line(data: &Value) -> String {
    let name = text_of(data.get("ptr"));
    let tid = text_of(data.get("tid"));
    let has_pc = data
        .get("context")
        .is_some_and(|context| context.get("pc").is_some());
    let symbol = data.get("symbol").filter(|_| has_pc).and_then(|symbol| {
        let module = symbol.get("moduleName")?;
        Some(format!(
            " ({} - {})",
            text_of(Some(module)),
            text_of(symbol.get("name"))
        ))
    });
    format!("hook {name}{} @thread := {tid}", symbol.unwrap_or_default())
}
