//! Bridge peer: drives the line protocol and exposes it as a device.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dwarf_core::{
    AgentError, AgentReply, ChannelEvent, ChannelEvents, Device, DeviceError, DeviceProvider,
    ScriptChannel, Target, TargetProcess,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, ToSocketAddrs},
    sync::{self, mpsc, oneshot},
};

use crate::protocol::{BridgeEvent, BridgeRequest, BridgeResponse, ProtocolError, decode_data};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = Mutex<HashMap<u64, oneshot::Sender<BridgeResponse>>>;

impl From<ProtocolError> for DeviceError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(_) | ProtocolError::Closed => Self::Unavailable(e.to_string()),
            ProtocolError::Remote(message) => Self::Failed(message),
            other => Self::Failed(other.to_string()),
        }
    }
}

struct PeerInner {
    writer: sync::Mutex<Writer>,
    pending: Pending,
    scripts: Mutex<HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>>,
    next_id: AtomicU64,
    /// Set once the read loop has ended.
    closed: AtomicBool,
}

/// Removes a request's pending entry when its future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Connection to a device bridge.
///
/// Requests are matched to responses by id; script messages are routed to
/// the channel of the script that posted them, in arrival order.
#[derive(Clone)]
pub struct BridgePeer {
    inner: Arc<PeerInner>,
}

impl BridgePeer {
    /// Connect to a bridge over TCP.
    ///
    /// # Errors
    /// Returns error if the connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::spawn(reader, writer))
    }

    /// Run the protocol over an arbitrary byte stream.
    ///
    /// This starts a background task reading events from `reader`.
    #[must_use]
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = Self {
            inner: Arc::new(PeerInner {
                writer: sync::Mutex::new(Box::new(writer)),
                pending: Mutex::new(HashMap::new()),
                scripts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        };

        let reader_peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = reader_peer.read_loop(reader).await {
                tracing::error!("Bridge reader loop error: {e}");
            }
            reader_peer.shutdown();
        });

        peer
    }

    async fn read_loop<R>(&self, reader: R) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buffer = String::new();

        loop {
            buffer.clear();
            if reader.read_line(&mut buffer).await? == 0 {
                tracing::info!("Bridge closed the connection");
                return Ok(());
            }
            let line = buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<BridgeEvent>(line) {
                Ok(event) => self.route(event),
                Err(e) => tracing::warn!(error = %e, %line, "Invalid bridge event"),
            }
        }
    }

    fn route(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Response(response) => {
                let Some(tx) = self.inner.pending.lock().remove(&response.id) else {
                    tracing::warn!(id = response.id, "Response to unknown request");
                    return;
                };
                let _ = tx.send(response);
            }
            BridgeEvent::Message {
                script,
                message,
                data,
            } => {
                let data = match data.as_deref().map(decode_data).transpose() {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(script, error = %e, "Dropping undecodable payload");
                        None
                    }
                };
                let scripts = self.inner.scripts.lock();
                match scripts.get(&script) {
                    Some(tx) => {
                        let _ = tx.send(ChannelEvent::Message { message, data });
                    }
                    None => tracing::debug!(script, "Message for unknown script"),
                }
            }
            BridgeEvent::Destroyed { script } => {
                if let Some(tx) = self.inner.scripts.lock().remove(&script) {
                    let _ = tx.send(ChannelEvent::Destroyed);
                }
            }
        }
    }

    /// Fail every in-flight request and destroy every script.
    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.pending.lock().clear();
        for (_, tx) in self.inner.scripts.lock().drain() {
            let _ = tx.send(ChannelEvent::Destroyed);
        }
    }

    async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(message)?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Whether the bridge connection has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send a request and await its response.
    ///
    /// # Errors
    /// Returns error if the write fails, the connection is or becomes closed,
    /// or the bridge reports a failure.
    pub async fn request(
        &self,
        build: impl FnOnce(u64) -> BridgeRequest,
    ) -> Result<BridgeResponse, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };
        // Shutdown may have drained pending before the insert.
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }

        let request = build(id);
        tracing::debug!(?request, "Bridge request");
        self.send_json(&request).await?;

        let response = rx.await.map_err(|_| ProtocolError::Closed)?;
        match response.error {
            Some(message) => Err(ProtocolError::Remote(message)),
            None => Ok(response),
        }
    }
}

#[async_trait]
impl DeviceProvider for BridgePeer {
    async fn device(&self) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Device for BridgePeer {
    async fn attach(&self, target: &Target) -> Result<Arc<dyn TargetProcess>, DeviceError> {
        let target = target.to_string();
        let response = self
            .request(|id| BridgeRequest::Attach {
                id,
                target: target.clone(),
            })
            .await
            .map_err(|e| match e {
                ProtocolError::Remote(message) => {
                    DeviceError::ProcessNotFound(format!("{target}: {message}"))
                }
                other => other.into(),
            })?;
        let session = response.field_u64("session")?;
        let pid = u32::try_from(response.field_u64("pid")?)
            .map_err(|_| DeviceError::Failed(format!("pid out of range for {target}")))?;

        Ok(Arc::new(BridgeProcess {
            peer: self.clone(),
            session,
            pid,
        }))
    }

    async fn spawn(&self, package: &str) -> Result<u32, DeviceError> {
        let response = self
            .request(|id| BridgeRequest::Spawn {
                id,
                package: package.to_string(),
            })
            .await?;
        u32::try_from(response.field_u64("pid")?)
            .map_err(|_| DeviceError::Failed(format!("pid out of range for {package}")))
    }

    async fn resume(&self, pid: u32) -> Result<(), DeviceError> {
        self.request(|id| BridgeRequest::Resume { id, pid }).await?;
        Ok(())
    }

    async fn kill_package(&self, package: &str) -> Result<(), DeviceError> {
        self.request(|id| BridgeRequest::Kill {
            id,
            package: package.to_string(),
        })
        .await?;
        Ok(())
    }
}

/// Process attached through the bridge.
pub struct BridgeProcess {
    peer: BridgePeer,
    session: u64,
    pid: u32,
}

#[async_trait]
impl TargetProcess for BridgeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_script(&self, source: &str) -> Result<Arc<dyn ScriptChannel>, DeviceError> {
        let response = self
            .peer
            .request(|id| BridgeRequest::CreateScript {
                id,
                session: self.session,
                source: source.to_string(),
            })
            .await?;
        Ok(Arc::new(BridgeScript {
            peer: self.peer.clone(),
            script: response.field_u64("script")?,
        }))
    }

    async fn detach(&self) -> Result<(), DeviceError> {
        self.peer
            .request(|id| BridgeRequest::Detach {
                id,
                session: self.session,
            })
            .await?;
        Ok(())
    }
}

/// Script created through the bridge.
pub struct BridgeScript {
    peer: BridgePeer,
    script: u64,
}

#[async_trait]
impl ScriptChannel for BridgeScript {
    async fn load(&self) -> Result<ChannelEvents, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered first: the agent may post before the load response.
        self.peer.inner.scripts.lock().insert(self.script, tx);

        let loaded = self
            .peer
            .request(|id| BridgeRequest::Load {
                id,
                script: self.script,
            })
            .await;
        if let Err(e) = loaded {
            self.peer.inner.scripts.lock().remove(&self.script);
            return Err(e.into());
        }
        Ok(rx)
    }

    async fn call(
        &self,
        thread_id: u64,
        api: &str,
        args: Vec<Value>,
    ) -> Result<AgentReply, AgentError> {
        let response = self
            .peer
            .request(|id| BridgeRequest::Call {
                id,
                script: self.script,
                tid: thread_id,
                api: api.to_string(),
                args,
            })
            .await
            .map_err(|e| match e {
                ProtocolError::Remote(message) => AgentError::Remote {
                    api: api.to_string(),
                    message,
                },
                other => AgentError::Transport(other.to_string()),
            })?;

        let data = response
            .decode_data()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(match (data, response.result) {
            (Some(bytes), _) => AgentReply::Binary(bytes),
            (None, None | Some(Value::Null)) => AgentReply::Empty,
            (None, Some(value)) => AgentReply::Json(value),
        })
    }

    async fn unload(&self) -> Result<(), DeviceError> {
        self.peer
            .request(|id| BridgeRequest::Unload {
                id,
                script: self.script,
            })
            .await?;
        Ok(())
    }
}
