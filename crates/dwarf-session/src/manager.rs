//! Session controller: attach, spawn, script load and teardown.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use dwarf_core::{
    AgentApi, AgentError, AgentReply, BusEvent, ChannelEvent, ChannelEvents, ChunkedMemoryReader,
    ContextState, CorrelationId, DeviceError, DeviceProvider, EventBus, Frontend, Hook, HookError,
    HookRegistry, MemoryError, PendingArgs, Prefs, ScriptChannel, Target, TargetProcess,
    TopicStream,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::{dispatcher::MessageDispatcher, state::SessionState};

/// How long `enumerate_java_methods` waits for the agent's answer.
pub const METHOD_ENUMERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Session controller error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Illegal session transition {from} -> {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("Failed to attach to {target}: {source}")]
    Attach {
        target: String,
        #[source]
        source: DeviceError,
    },
    #[error("Failed to spawn {package}: {source}")]
    Spawn {
        package: String,
        #[source]
        source: DeviceError,
    },
    #[error("Script error: {0}")]
    Script(#[from] DeviceError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Memory read failed: {0}")]
    Dump(#[from] MemoryError),
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Handles of the attached target.
#[derive(Default)]
struct Session {
    state: SessionState,
    pid: u32,
    process: Option<Arc<dyn TargetProcess>>,
    script: Option<Arc<dyn ScriptChannel>>,
    /// Bumped on every teardown so events from an older script are ignored.
    generation: u64,
}

impl Session {
    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition(to) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = %self.state, %to, "Session transition");
        self.state = to;
        Ok(())
    }

    fn teardown(&mut self) -> (Option<Arc<dyn ScriptChannel>>, Option<Arc<dyn TargetProcess>>) {
        let handles = (self.script.take(), self.process.take());
        self.state = SessionState::Empty;
        self.pid = 0;
        self.generation += 1;
        handles
    }
}

struct Inner {
    provider: Arc<dyn DeviceProvider>,
    frontend: Arc<dyn Frontend>,
    prefs: Prefs,
    session: Mutex<Session>,
    hooks: Arc<HookRegistry>,
    bus: Arc<EventBus>,
    context: Arc<Mutex<ContextState>>,
    dispatcher: MessageDispatcher,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.session.lock().generation == generation
    }

    fn reset_shared(&self) {
        self.context.lock().reset();
        self.hooks.pending().clear();
    }

    /// Channel-side teardown. Ignored when a newer session replaced the one
    /// that produced the notification.
    fn on_destroyed(&self, generation: u64) {
        let pid = {
            let mut session = self.session.lock();
            if session.generation != generation {
                tracing::debug!(generation, "Ignoring stale destroyed notification");
                return;
            }
            let pid = session.pid;
            session.teardown();
            pid
        };
        self.reset_shared();

        tracing::info!(pid, "Script destroyed");
        self.frontend
            .log(&format!("detached from {pid}. script destroyed"));
        self.frontend.on_script_destroyed();
    }
}

/// Drain one script's events in order until it is destroyed.
async fn pump_events(weak: Weak<Inner>, generation: u64, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Message { message, data } => {
                if !inner.is_current(generation) {
                    tracing::debug!(generation, "Dropping message from detached script");
                    continue;
                }
                inner.dispatcher.dispatch(&message, data.as_deref());
            }
            ChannelEvent::Destroyed => break,
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.on_destroyed(generation);
    }
}

/// Root of one instrumentation session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create an empty session.
    #[must_use]
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        frontend: Arc<dyn Frontend>,
        prefs: Prefs,
    ) -> Self {
        let hooks = Arc::new(HookRegistry::with_library_suffix(
            prefs.library_suffix.clone(),
        ));
        let bus = Arc::new(EventBus::new());
        let context = Arc::new(Mutex::new(ContextState::new()));
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&hooks),
            Arc::clone(&bus),
            Arc::clone(&context),
            Arc::clone(&frontend),
        );

        Self {
            inner: Arc::new(Inner {
                provider,
                frontend,
                prefs,
                session: Mutex::new(Session::default()),
                hooks,
                bus,
                context,
                dispatcher,
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state
    }

    /// Pid of the attached process, zero when detached.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.session.lock().pid
    }

    /// Snapshot of the target context.
    #[must_use]
    pub fn context(&self) -> ContextState {
        self.inner.context.lock().clone()
    }

    #[must_use]
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    #[must_use]
    pub fn prefs(&self) -> &Prefs {
        &self.inner.prefs
    }

    /// Module whose load is currently being reported, if any.
    #[must_use]
    pub fn loading_library(&self) -> Option<String> {
        self.inner.context.lock().loading_library.clone()
    }

    fn has_session(&self) -> bool {
        self.inner.session.lock().state != SessionState::Empty
    }

    fn transition(&self, to: SessionState) -> Result<(), SessionError> {
        self.inner.session.lock().transition(to)
    }

    fn abandon_attach(&self) {
        self.inner.session.lock().teardown();
    }

    fn set_attached(&self, process: Arc<dyn TargetProcess>) -> Result<(), SessionError> {
        let mut session = self.inner.session.lock();
        session.transition(SessionState::Attached)?;
        session.pid = process.pid();
        session.process = Some(process);
        Ok(())
    }

    /// Attach to a running process and load the agent.
    ///
    /// An active session is detached first. Attach failures are reported to
    /// the frontend and leave the session empty.
    ///
    /// # Errors
    /// Returns error if the device cannot attach or the script fails to load.
    pub async fn attach(&self, target: Target, script: Option<&str>) -> Result<(), SessionError> {
        if self.has_session() {
            self.detach().await;
        }
        self.transition(SessionState::Attaching)?;

        let attached = match self.inner.provider.device().await {
            Ok(device) => device.attach(&target).await,
            Err(e) => Err(e),
        };
        let process = match attached {
            Ok(process) => process,
            Err(source) => {
                self.abandon_attach();
                tracing::warn!(%target, error = %source, "Attach failed");
                self.inner
                    .frontend
                    .alert(&format!("Failed to attach to {target}"), &source.to_string());
                return Err(SessionError::Attach {
                    target: target.to_string(),
                    source,
                });
            }
        };

        tracing::info!(%target, pid = process.pid(), "Attached");
        self.set_attached(process)?;
        self.load_or_detach(script).await
    }

    /// Kill, spawn suspended, attach, load the agent, then resume.
    ///
    /// The process is resumed only after the script has loaded.
    ///
    /// # Errors
    /// Returns error if any device step or the script load fails.
    pub async fn spawn(&self, package: &str, script: Option<&str>) -> Result<(), SessionError> {
        if self.has_session() {
            self.detach().await;
        }
        self.transition(SessionState::Attaching)?;

        let spawned = async {
            let device = self.inner.provider.device().await?;
            if let Err(e) = device.kill_package(package).await {
                tracing::warn!(%package, error = %e, "Failed to kill running instance");
            }
            let pid = device.spawn(package).await?;
            let process = device.attach(&Target::Pid(pid)).await?;
            Ok::<_, DeviceError>((device, pid, process))
        }
        .await;
        let (device, pid, process) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                self.abandon_attach();
                tracing::warn!(%package, error = %source, "Spawn failed");
                self.inner
                    .frontend
                    .alert(&format!("Failed to spawn to {package}"), &source.to_string());
                return Err(SessionError::Spawn {
                    package: package.to_string(),
                    source,
                });
            }
        };

        tracing::info!(%package, pid, "Spawned");
        self.set_attached(process)?;
        self.load_or_detach(script).await?;

        device
            .resume(pid)
            .await
            .map_err(|source| SessionError::Spawn {
                package: package.to_string(),
                source,
            })?;
        tracing::info!(pid, "Resumed");
        Ok(())
    }

    async fn load_or_detach(&self, script: Option<&str>) -> Result<(), SessionError> {
        if let Err(e) = self.load_script(script).await {
            tracing::error!(error = %e, "Script load failed, detaching");
            self.inner.frontend.alert("Failed to load script", &e.to_string());
            self.detach().await;
            return Err(e);
        }
        Ok(())
    }

    /// Load the agent bundle into the attached process.
    ///
    /// `script`, when given, is evaluated by the agent once loaded.
    ///
    /// # Errors
    /// Returns error if no process is attached, the bundle cannot be read or
    /// the channel fails to load.
    pub async fn load_script(&self, script: Option<&str>) -> Result<(), SessionError> {
        let process = {
            let session = self.inner.session.lock();
            match (&session.process, session.state) {
                (Some(process), SessionState::Attached) => Arc::clone(process),
                _ => {
                    return Err(SessionError::IllegalTransition {
                        from: session.state,
                        to: SessionState::ScriptLoaded,
                    });
                }
            }
        };

        let path = &self.inner.prefs.agent_script;
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SessionError::Io {
                path: path.clone(),
                source,
            })?;

        let channel = process.create_script(&source).await?;
        let events = channel.load().await?;

        let generation = {
            let mut session = self.inner.session.lock();
            session.transition(SessionState::ScriptLoaded)?;
            session.script = Some(channel);
            session.generation
        };
        tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            generation,
            events,
        ));
        tracing::info!(path = %path.display(), "Script loaded");

        if let Some(script) = script {
            self.agent_call(0, "evaluateFunction", vec![json!(script)])
                .await;
        }
        self.inner.frontend.on_script_loaded();
        Ok(())
    }

    /// Tear the session down. Safe to call at any time, any number of times.
    pub async fn detach(&self) {
        self.agent_call(0, "_detach", Vec::new()).await;

        let (pid, (script, process)) = {
            let mut session = self.inner.session.lock();
            if session.state == SessionState::Empty {
                return;
            }
            (session.pid, session.teardown())
        };
        self.inner.reset_shared();

        let loaded = script.is_some();
        if let Some(script) = script {
            if let Err(e) = script.unload().await {
                tracing::warn!(error = %e, "Script unload failed");
            }
        }
        if let Some(process) = process {
            if let Err(e) = process.detach().await {
                tracing::warn!(pid, error = %e, "Process detach failed");
            }
        }

        tracing::info!(pid, "Detached");
        if loaded {
            self.inner
                .frontend
                .log(&format!("detached from {pid}. script destroyed"));
            self.inner.frontend.on_script_destroyed();
        }
    }

    /// Call the agent, treating every failure as "no result".
    ///
    /// Remote errors are reported to the frontend log.
    pub async fn agent_call(
        &self,
        thread_id: u64,
        api: &str,
        args: Vec<Value>,
    ) -> Option<AgentReply> {
        match self.api(thread_id, api, args).await {
            Ok(reply) => Some(reply),
            Err(AgentError::NoChannel) => {
                tracing::debug!(%api, "Agent call without a loaded script");
                None
            }
            Err(e) => {
                tracing::warn!(%api, error = %e, "Agent call failed");
                self.inner.frontend.log(&e.to_string());
                None
            }
        }
    }

    /// Hook a native address or a symbol expression.
    ///
    /// # Errors
    /// Returns error if the target does not resolve or the request fails.
    pub async fn hook_native(
        &self,
        input: &str,
        args: Option<PendingArgs>,
    ) -> Result<CorrelationId, SessionError> {
        Ok(self.inner.hooks.install_native(self, input, args).await?)
    }

    /// Hook a Java class or method.
    ///
    /// # Errors
    /// Returns error if the class or method name is empty or the request fails.
    pub async fn hook_java(
        &self,
        class_or_method: &str,
        args: Option<PendingArgs>,
    ) -> Result<CorrelationId, SessionError> {
        Ok(self.inner.hooks.install_java(self, class_or_method, args).await?)
    }

    /// Hook the load of a module. Returns `None` if already hooked.
    ///
    /// # Errors
    /// Returns error if the name is empty or the request fails.
    pub async fn hook_on_load(&self, module: &str) -> Result<Option<Hook>, SessionError> {
        let hook = self.inner.hooks.install_on_load(self, module).await?;
        if let Some(hook) = &hook {
            self.inner.frontend.on_hook_installed(hook);
        }
        Ok(hook)
    }

    /// Read target memory in chunks of the configured size.
    ///
    /// # Errors
    /// Returns error if any sub-read fails.
    pub async fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>, SessionError> {
        let reader =
            ChunkedMemoryReader::new(self).with_chunk_size(self.inner.prefs.effective_chunk_size());
        Ok(reader.read(address, length).await?)
    }

    /// Write `length` bytes at `address` to `path`, raw.
    ///
    /// Nothing is written unless the whole read succeeds.
    ///
    /// # Errors
    /// Returns error on zero address or length, a failed read, or a failed
    /// write.
    pub async fn dump_memory(
        &self,
        path: &Path,
        address: u64,
        length: usize,
    ) -> Result<(), SessionError> {
        if address == 0 || length == 0 {
            return Err(SessionError::InvalidInput(format!(
                "dump of {length} bytes at {address:#x}"
            )));
        }
        let data = self.read_memory(address, length).await?;
        tokio::fs::write(path, &data)
            .await
            .map_err(|source| SessionError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(path = %path.display(), address = format_args!("{address:#x}"), length, "Memory dumped");
        Ok(())
    }

    /// Ask the agent to stream loaded Java classes to the frontend.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn enumerate_java_classes(&self) -> Result<(), SessionError> {
        self.api(0, "enumerateJavaClasses", Vec::new()).await?;
        Ok(())
    }

    /// Methods of a Java class, as delivered by the agent.
    ///
    /// # Errors
    /// Returns error if the request fails or no answer arrives in time.
    pub async fn enumerate_java_methods(&self, class_name: &str) -> Result<Value, SessionError> {
        let topic = CorrelationId::new().to_string();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.inner.bus.subscribe(topic.clone(), move |event| {
            if let BusEvent::Enumeration(methods) = event {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(methods.clone());
                }
            }
        });

        let result = self.await_methods(class_name, &topic, rx).await;
        self.inner.bus.unsubscribe(&topic, subscription);
        result
    }

    async fn await_methods(
        &self,
        class_name: &str,
        topic: &str,
        rx: oneshot::Receiver<Value>,
    ) -> Result<Value, SessionError> {
        self.api(
            0,
            "enumerateJavaMethods",
            vec![json!(class_name), json!(topic)],
        )
        .await?;
        match tokio::time::timeout(METHOD_ENUMERATION_TIMEOUT, rx).await {
            Ok(Ok(methods)) => Ok(methods),
            _ => Err(SessionError::Timeout(format!("methods of {class_name}"))),
        }
    }

    /// Scan `size` bytes at `address` for `pattern`.
    ///
    /// The returned stream yields matches and ends once the agent reports
    /// completion; its topic is the scan's correlation id.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn memory_scan(
        &self,
        address: u64,
        size: usize,
        pattern: &str,
    ) -> Result<TopicStream, SessionError> {
        let topic = CorrelationId::new().to_string();
        let stream = self.inner.bus.stream(&topic);
        self.api(
            0,
            "memoryScan",
            vec![
                json!(format!("{address:#x}")),
                json!(size),
                json!(pattern),
                json!(topic),
            ],
        )
        .await?;
        tracing::debug!(%topic, address = format_args!("{address:#x}"), size, "Memory scan started");
        Ok(stream)
    }
}

#[async_trait]
impl AgentApi for SessionController {
    /// Thread id zero means "the current context's thread".
    async fn api(
        &self,
        thread_id: u64,
        name: &str,
        args: Vec<Value>,
    ) -> Result<AgentReply, AgentError> {
        let script = self
            .inner
            .session
            .lock()
            .script
            .clone()
            .ok_or(AgentError::NoChannel)?;
        let thread_id = if thread_id == 0 {
            self.inner.context.lock().context_tid()
        } else {
            thread_id
        };
        tracing::debug!(thread_id, api = %name, "Agent call");
        script.call(thread_id, name, args).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use dwarf_core::HookKind;
    use futures::StreamExt;
    use tokio_test::assert_err;

    use super::*;
    use crate::test_support::{
        MockDevice, MockProvider, RecordingFrontend, prefs_with_bundle, wait_until,
    };

    fn controller_with(
        device: &Arc<MockDevice>,
        prefs: Prefs,
    ) -> (SessionController, Arc<RecordingFrontend>) {
        let frontend = Arc::new(RecordingFrontend::default());
        let controller = SessionController::new(
            Arc::new(MockProvider(Arc::clone(device))),
            Arc::clone(&frontend) as Arc<dyn Frontend>,
            prefs,
        );
        (controller, frontend)
    }

    fn controller(device: &Arc<MockDevice>) -> (SessionController, Arc<RecordingFrontend>) {
        controller_with(device, prefs_with_bundle())
    }

    #[tokio::test]
    async fn test_detach_without_session_is_noop() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);

        controller.detach().await;
        controller.detach().await;

        assert_eq!(controller.state(), SessionState::Empty);
        assert!(device.journal().is_empty());
        assert!(frontend.events().is_empty());
    }

    #[tokio::test]
    async fn test_attach_then_detach_twice() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);

        controller.attach(Target::Pid(1234), None).await.unwrap();
        assert_eq!(controller.state(), SessionState::ScriptLoaded);
        assert_eq!(controller.pid(), 1234);

        controller.detach().await;
        controller.detach().await;

        assert_eq!(controller.state(), SessionState::Empty);
        assert_eq!(controller.pid(), 0);
        assert_eq!(
            device.journal(),
            vec![
                "attach:1234",
                "create_script",
                "load",
                "call:_detach",
                "unload",
                "detach"
            ]
        );
        let destroyed = frontend
            .events()
            .iter()
            .filter(|e| *e == "script_destroyed")
            .count();
        assert_eq!(destroyed, 1);
    }

    #[tokio::test]
    async fn test_attach_failure_alerts_and_stays_empty() {
        let device = MockDevice::failing();
        let (controller, frontend) = controller(&device);

        let err = controller
            .attach(Target::Package("com.example".into()), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Attach { .. }));
        assert_eq!(controller.state(), SessionState::Empty);
        assert_eq!(
            frontend.events(),
            vec!["alert:Failed to attach to com.example:Process not found: com.example"]
        );
    }

    #[tokio::test]
    async fn test_spawn_resumes_after_load() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);

        controller
            .spawn("com.example", Some("console.log(1)"))
            .await
            .unwrap();

        assert_eq!(
            device.journal(),
            vec![
                "kill:com.example",
                "spawn:com.example",
                "attach:31337",
                "create_script",
                "load",
                "call:evaluateFunction",
                "resume:31337"
            ]
        );
        assert_eq!(controller.pid(), 31337);
        assert!(frontend.events().contains(&"script_loaded".to_string()));
    }

    #[tokio::test]
    async fn test_missing_bundle_detaches_without_resume() {
        let device = MockDevice::new();
        let prefs = Prefs {
            agent_script: PathBuf::from("/nonexistent/dwarf/script.js"),
            ..Prefs::default()
        };
        let (controller, _frontend) = controller_with(&device, prefs);

        let err = controller.spawn("com.example", None).await.unwrap_err();

        assert!(matches!(err, SessionError::Io { .. }));
        assert_eq!(controller.state(), SessionState::Empty);
        let journal = device.journal();
        assert_eq!(journal.last().map(String::as_str), Some("detach"));
        assert!(!journal.iter().any(|e| e.starts_with("resume")));
    }

    #[tokio::test]
    async fn test_load_script_requires_attached_process() {
        let device = MockDevice::new();
        let (controller, _frontend) = controller(&device);

        let err = controller.load_script(None).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::IllegalTransition {
                from: SessionState::Empty,
                to: SessionState::ScriptLoaded
            }
        ));
        assert!(device.journal().is_empty());
    }

    #[tokio::test]
    async fn test_destroyed_notification_clears_session() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        device.script().destroy();
        wait_until(|| controller.state() == SessionState::Empty).await;

        assert_eq!(controller.pid(), 0);
        assert!(
            frontend
                .logs()
                .contains(&"detached from 1234. script destroyed".to_string())
        );
        assert!(controller.agent_call(0, "ping", Vec::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_destroyed_keeps_new_session() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);
        controller.attach(Target::Pid(1), None).await.unwrap();
        controller.attach(Target::Pid(2), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(controller.state(), SessionState::ScriptLoaded);
        assert_eq!(controller.pid(), 2);
        let destroyed = frontend
            .events()
            .iter()
            .filter(|e| *e == "script_destroyed")
            .count();
        assert_eq!(destroyed, 1);
    }

    #[tokio::test]
    async fn test_native_hook_confirmed_through_channel() {
        let device = MockDevice::with_replies(|api, _| match api {
            "evaluatePtr" => Ok(AgentReply::Json(json!("0x7f001000"))),
            _ => Ok(AgentReply::Empty),
        });
        let (controller, frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let id = controller
            .hook_native(
                "Module.findExportByName(null, 'open')",
                Some(PendingArgs::new(Some("x0 == 0".into()), None)),
            )
            .await
            .unwrap();

        let script = device.script();
        let calls = script.calls.lock().clone();
        assert_eq!(calls[1].1, "hookNative");
        assert_eq!(calls[1].2, vec![json!("0x7f001000"), json!(id.to_string())]);

        script.send_payload(&format!("hook_native_callback:::0x7f001000:::{id}"));
        wait_until(|| controller.hooks().count(HookKind::Native) == 1).await;

        let hook = controller.hooks().native(0x7f00_1000).unwrap();
        assert_eq!(hook.input, "Module.findExportByName(null, 'open')");
        assert_eq!(hook.condition.as_deref(), Some("x0 == 0"));
        assert!(!controller.hooks().pending().is_pending(HookKind::Native));
        assert_eq!(frontend.hooks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_without_script_sends_nothing() {
        let device = MockDevice::new();
        let (controller, _frontend) = controller(&device);

        let err = controller.hook_java("com.example.Foo", None).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Hook(HookError::Agent(AgentError::NoChannel))
        ));
        assert!(!controller.hooks().pending().is_pending(HookKind::Java));
    }

    #[tokio::test]
    async fn test_on_load_hook_registered_once() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let first = controller.hook_on_load("libtarget").await.unwrap();
        let second = controller.hook_on_load("libtarget.so").await.unwrap();

        assert_eq!(first.map(|h| h.input), Some("libtarget.so".to_string()));
        assert!(second.is_none());
        assert_eq!(device.script().count("hookOnLoad"), 1);
        assert_eq!(frontend.hooks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_call_defaults_to_context_thread() {
        let device = MockDevice::new();
        let (controller, _frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();
        let script = device.script();

        script.send_payload(r#"set_context:::{"context":{"pc":"0x1"},"ptr":"0x1","tid":77}"#);
        wait_until(|| controller.context().thread_id == 77).await;

        controller.agent_call(0, "ping", Vec::new()).await;
        controller.agent_call(5, "ping", Vec::new()).await;

        let calls = script.calls.lock().clone();
        assert_eq!(calls[0].0, 77);
        assert_eq!(calls[1].0, 5);
    }

    #[tokio::test]
    async fn test_agent_call_remote_error_is_no_result() {
        let device = MockDevice::with_replies(|api, _| {
            Err(AgentError::Remote {
                api: api.to_string(),
                message: "boom".into(),
            })
        });
        let (controller, frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        assert!(controller.agent_call(0, "ping", Vec::new()).await.is_none());
        assert_eq!(frontend.logs(), vec!["Agent rejected ping: boom"]);
    }

    #[tokio::test]
    async fn test_dump_writes_exact_bytes() {
        let device = MockDevice::with_replies(|api, args| match api {
            "readBytes" => {
                let length = usize::try_from(args[1].as_u64().unwrap()).unwrap();
                Ok(AgentReply::Binary(Bytes::from(vec![0xAB; length])))
            }
            _ => Ok(AgentReply::Empty),
        });
        let prefs = Prefs {
            chunk_size: 4,
            ..prefs_with_bundle()
        };
        let (controller, _frontend) = controller_with(&device, prefs);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let path = std::env::temp_dir().join(format!("dwarf-dump-{}.bin", CorrelationId::new()));
        controller.dump_memory(&path, 0x1000, 10).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![0xAB; 10]);
        assert_eq!(device.script().count("readBytes"), 3);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_failed_sub_read_writes_no_file() {
        let reads = AtomicUsize::new(0);
        let device = MockDevice::with_replies(move |api, args| match api {
            "readBytes" if reads.fetch_add(1, Ordering::SeqCst) == 0 => {
                let length = usize::try_from(args[1].as_u64().unwrap()).unwrap();
                Ok(AgentReply::Binary(Bytes::from(vec![0; length])))
            }
            "readBytes" => Err(AgentError::Remote {
                api: api.to_string(),
                message: "access violation".into(),
            }),
            _ => Ok(AgentReply::Empty),
        });
        let prefs = Prefs {
            chunk_size: 4,
            ..prefs_with_bundle()
        };
        let (controller, _frontend) = controller_with(&device, prefs);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let path = std::env::temp_dir().join(format!("dwarf-dump-{}.bin", CorrelationId::new()));
        let err = controller.dump_memory(&path, 0x1000, 10).await.unwrap_err();

        assert!(matches!(err, SessionError::Dump(MemoryError::SubRead { .. })));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_read_of_unmapped_huge_range_fails() {
        let device = MockDevice::with_replies(|api, _| match api {
            "readBytes" => Err(AgentError::Remote {
                api: api.to_string(),
                message: "access violation".into(),
            }),
            _ => Ok(AgentReply::Empty),
        });
        let (controller, _frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let err = assert_err!(controller.read_memory(0x1000, usize::MAX / 2).await);

        assert!(matches!(err, SessionError::Dump(MemoryError::SubRead { .. })));
        assert_eq!(device.script().count("readBytes"), 1);
        assert_eq!(controller.state(), SessionState::ScriptLoaded);
    }

    #[tokio::test]
    async fn test_dump_rejects_zero_input() {
        let device = MockDevice::new();
        let (controller, _frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let path = std::env::temp_dir().join(format!("dwarf-dump-{}.bin", CorrelationId::new()));
        assert!(matches!(
            controller.dump_memory(&path, 0, 16).await,
            Err(SessionError::InvalidInput(_))
        ));
        assert!(matches!(
            controller.dump_memory(&path, 0x1000, 0).await,
            Err(SessionError::InvalidInput(_))
        ));
        assert_eq!(device.script().count("readBytes"), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_memory_scan_streams_until_complete() {
        let device = MockDevice::new();
        let (controller, frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();

        let stream = controller
            .memory_scan(0x1000, 0x100, "de ad be ef")
            .await
            .unwrap();
        let topic = stream.topic().to_string();
        let script = device.script();
        assert_eq!(script.calls.lock()[0].2[3], json!(topic));

        script.send_payload(&format!(r#"memory_scan_match:::{topic}:::0x1010:::{{"size":4}}"#));
        script.send_payload(&format!("memory_scan_complete:::{topic}"));

        let matches: Vec<BusEvent> = stream.collect().await;
        assert_eq!(
            matches,
            vec![BusEvent::ScanMatch {
                address: "0x1010".into(),
                metadata: json!({"size": 4})
            }]
        );
        assert_eq!(controller.bus().subscriber_count(&topic), 0);
        assert!(frontend.events().contains(&"search_complete".to_string()));
    }

    #[tokio::test]
    async fn test_enumerate_java_methods_resolves_on_topic() {
        let device = MockDevice::new();
        let (controller, _frontend) = controller(&device);
        controller.attach(Target::Pid(1234), None).await.unwrap();
        let script = device.script();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.enumerate_java_methods("com.example.Foo").await })
        };
        wait_until(|| script.count("enumerateJavaMethods") == 1).await;
        let args = script.calls.lock()[0].2.clone();
        assert_eq!(args[0], json!("com.example.Foo"));
        let topic = args[1].as_str().unwrap().to_string();

        script.send_payload(&format!(
            r#"enumerate_java_methods_complete:::{topic}:::["bar","baz"]"#
        ));

        let methods = task.await.unwrap().unwrap();
        assert_eq!(methods, json!(["bar", "baz"]));
        assert_eq!(controller.bus().subscriber_count(&topic), 0);
    }
}
