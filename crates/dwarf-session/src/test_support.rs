use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use dwarf_core::{
    AgentError, AgentReply, ChannelEvent, ChannelEvents, Device, DeviceError, DeviceProvider,
    Frontend, Hook, Prefs, ScriptChannel, Target, TargetProcess,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub type Journal = Arc<Mutex<Vec<String>>>;

type Replies = Arc<dyn Fn(&str, &[Value]) -> Result<AgentReply, AgentError> + Send + Sync>;

/// Script double: records calls, answers through a closure and lets tests
/// push inbound messages.
pub struct MockScript {
    journal: Journal,
    replies: Replies,
    tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    pub calls: Mutex<Vec<(u64, String, Vec<Value>)>>,
}

impl MockScript {
    pub fn send_payload(&self, payload: &str) {
        self.send(json!({"type": "send", "payload": payload}), None);
    }

    pub fn send(&self, message: Value, data: Option<Bytes>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(ChannelEvent::Message { message, data });
        }
    }

    pub fn destroy(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(ChannelEvent::Destroyed);
        }
    }

    pub fn count(&self, api: &str) -> usize {
        self.calls.lock().iter().filter(|(_, a, _)| a == api).count()
    }
}

#[async_trait]
impl ScriptChannel for MockScript {
    async fn load(&self) -> Result<ChannelEvents, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        self.journal.lock().push("load".into());
        Ok(rx)
    }

    async fn call(
        &self,
        thread_id: u64,
        api: &str,
        args: Vec<Value>,
    ) -> Result<AgentReply, AgentError> {
        self.journal.lock().push(format!("call:{api}"));
        self.calls
            .lock()
            .push((thread_id, api.to_string(), args.clone()));
        (self.replies)(api, &args)
    }

    async fn unload(&self) -> Result<(), DeviceError> {
        self.journal.lock().push("unload".into());
        self.destroy();
        Ok(())
    }
}

pub struct MockProcess {
    pid: u32,
    journal: Journal,
    replies: Replies,
    pub scripts: Mutex<Vec<Arc<MockScript>>>,
}

impl MockProcess {
    pub fn script(&self) -> Arc<MockScript> {
        Arc::clone(self.scripts.lock().last().expect("no script created"))
    }
}

#[async_trait]
impl TargetProcess for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_script(&self, _source: &str) -> Result<Arc<dyn ScriptChannel>, DeviceError> {
        self.journal.lock().push("create_script".into());
        let script = Arc::new(MockScript {
            journal: Arc::clone(&self.journal),
            replies: Arc::clone(&self.replies),
            tx: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        self.scripts.lock().push(Arc::clone(&script));
        Ok(script)
    }

    async fn detach(&self) -> Result<(), DeviceError> {
        self.journal.lock().push("detach".into());
        Ok(())
    }
}

/// Device double; also acts as its own provider.
pub struct MockDevice {
    pub journal: Journal,
    replies: Replies,
    pub fail_attach: bool,
    pub processes: Mutex<Vec<Arc<MockProcess>>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Self::with_replies(|_, _| Ok(AgentReply::Empty))
    }

    pub fn with_replies(
        replies: impl Fn(&str, &[Value]) -> Result<AgentReply, AgentError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(replies),
            fail_attach: false,
            processes: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(|_, _| Ok(AgentReply::Empty)),
            fail_attach: true,
            processes: Mutex::new(Vec::new()),
        })
    }

    pub fn process(&self) -> Arc<MockProcess> {
        Arc::clone(self.processes.lock().last().expect("no process attached"))
    }

    pub fn script(&self) -> Arc<MockScript> {
        self.process().script()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }
}

#[async_trait]
impl Device for MockDevice {
    async fn attach(&self, target: &Target) -> Result<Arc<dyn TargetProcess>, DeviceError> {
        self.journal.lock().push(format!("attach:{target}"));
        if self.fail_attach {
            return Err(DeviceError::ProcessNotFound(target.to_string()));
        }
        let pid = match target {
            Target::Pid(pid) => *pid,
            Target::Package(_) => 4242,
        };
        let process = Arc::new(MockProcess {
            pid,
            journal: Arc::clone(&self.journal),
            replies: Arc::clone(&self.replies),
            scripts: Mutex::new(Vec::new()),
        });
        self.processes.lock().push(Arc::clone(&process));
        Ok(process)
    }

    async fn spawn(&self, package: &str) -> Result<u32, DeviceError> {
        self.journal.lock().push(format!("spawn:{package}"));
        Ok(31337)
    }

    async fn resume(&self, pid: u32) -> Result<(), DeviceError> {
        self.journal.lock().push(format!("resume:{pid}"));
        Ok(())
    }

    async fn kill_package(&self, package: &str) -> Result<(), DeviceError> {
        self.journal.lock().push(format!("kill:{package}"));
        Ok(())
    }
}

pub struct MockProvider(pub Arc<MockDevice>);

#[async_trait]
impl DeviceProvider for MockProvider {
    async fn device(&self) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::clone(&self.0) as Arc<dyn Device>)
    }
}

/// Frontend double recording every notification as a line.
#[derive(Default)]
pub struct RecordingFrontend {
    pub events: Mutex<Vec<String>>,
    pub hooks: Mutex<Vec<Hook>>,
    pub contexts: Mutex<Vec<(Value, Option<String>)>>,
    pub data: Mutex<Vec<(String, String)>>,
    pub has_registers: bool,
}

impl RecordingFrontend {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("log:").map(str::to_string))
            .collect()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

impl Frontend for RecordingFrontend {
    fn log(&self, text: &str) {
        self.push(format!("log:{text}"));
    }
    fn alert(&self, title: &str, detail: &str) {
        self.push(format!("alert:{title}:{detail}"));
    }
    fn on_script_loaded(&self) {
        self.push("script_loaded");
    }
    fn on_script_destroyed(&self) {
        self.push("script_destroyed");
    }
    fn on_context_info(&self) {
        self.push("context_info");
    }
    fn on_java_classes_enumeration_start(&self) {
        self.push("classes_start");
    }
    fn on_java_classes_enumeration_match(&self, class_name: &str) {
        self.push(format!("class:{class_name}"));
    }
    fn on_java_classes_enumeration_complete(&self) {
        self.push("classes_complete");
    }
    fn on_bytes_search_complete(&self) {
        self.push("search_complete");
    }
    fn on_hook_installed(&self, hook: &Hook) {
        self.hooks.lock().push(hook.clone());
    }
    fn on_onload_hit(&self, module: &str, base: &str) {
        self.push(format!("onload:{module}:{base}"));
    }
    fn add_context(&self, context: &Value, loading_library: Option<&str>) {
        self.contexts
            .lock()
            .push((context.clone(), loading_library.map(str::to_string)));
    }
    fn has_register_context(&self) -> bool {
        self.has_registers
    }
    fn request_focus(&self) {
        self.push("focus");
    }
    fn append_data(&self, key: &str, text: &str) {
        self.data.lock().push((key.to_string(), text.to_string()));
    }
}

/// Preferences pointing at a freshly written agent bundle.
pub fn prefs_with_bundle() -> Prefs {
    let dir: PathBuf = std::env::temp_dir().join(format!("dwarf-session-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let bundle = dir.join("script.js");
    std::fs::write(&bundle, "rpc.exports = {};").unwrap();
    Prefs {
        agent_script: bundle,
        ..Prefs::default()
    }
}

/// Poll `cond` until it holds or a second passes.
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}
