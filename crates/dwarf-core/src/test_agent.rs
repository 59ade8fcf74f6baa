use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{AgentApi, AgentError, AgentReply};

type Handler = Box<dyn Fn(&str, &[Value]) -> Result<AgentReply, AgentError> + Send + Sync>;

/// Agent double that records every call and answers through a closure.
pub struct RecordingAgent {
    calls: Mutex<Vec<(u64, String, Vec<Value>)>>,
    handler: Handler,
}

impl RecordingAgent {
    pub fn new(
        handler: impl Fn(&str, &[Value]) -> Result<AgentReply, AgentError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls
            .lock()
            .iter()
            .map(|(_, api, args)| (api.clone(), args.clone()))
            .collect()
    }

    pub fn count(&self, api: &str) -> usize {
        self.calls.lock().iter().filter(|(_, a, _)| a == api).count()
    }
}

#[async_trait]
impl AgentApi for RecordingAgent {
    async fn api(
        &self,
        thread_id: u64,
        name: &str,
        args: Vec<Value>,
    ) -> Result<AgentReply, AgentError> {
        self.calls
            .lock()
            .push((thread_id, name.to_string(), args.clone()));
        (self.handler)(name, &args)
    }
}
