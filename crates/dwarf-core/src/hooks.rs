//! Registry of user-installed hooks.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::{AgentApi, AgentError, AgentReply, CorrelationId, PendingArgs, PendingArgsCorrelator};

/// Default shared-library suffix for on-load hooks.
pub const DEFAULT_LIBRARY_SUFFIX: &str = ".so";

/// Kind of instrumentation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Native code address.
    Native,
    /// Java class or method.
    Java,
    /// Module load event.
    OnLoad,
}

/// A user-installed hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Hook kind.
    pub kind: HookKind,
    /// Display key: the user input, the Java class or method, or the module name.
    pub input: String,
    /// Confirmed address. Zero for Java and on-load hooks.
    pub address: u64,
    /// Break condition expression.
    pub condition: Option<String>,
    /// Script body run on hit.
    pub logic: Option<String>,
}

impl Hook {
    /// Native hook at a confirmed address.
    #[must_use]
    pub fn native(input: impl Into<String>, address: u64) -> Self {
        Self::new(HookKind::Native, input.into(), address)
    }

    /// Java hook on a class or method.
    #[must_use]
    pub fn java(key: impl Into<String>) -> Self {
        Self::new(HookKind::Java, key.into(), 0)
    }

    /// On-load placeholder for a module.
    #[must_use]
    pub fn on_load(module: impl Into<String>) -> Self {
        Self::new(HookKind::OnLoad, module.into(), 0)
    }

    fn new(kind: HookKind, input: String, address: u64) -> Self {
        Self {
            kind,
            input,
            address,
            condition: None,
            logic: None,
        }
    }

    /// Attach pending condition and logic.
    #[must_use]
    pub fn with_pending(mut self, args: Option<PendingArgs>) -> Self {
        if let Some(args) = args {
            self.condition = args.condition;
            self.logic = args.logic;
        }
        self
    }
}

/// Hook install error.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Empty hook target")]
    EmptyInput,
    #[error("Could not resolve hook target {0:?}")]
    Unresolved(String),
    #[error("Agent call failed: {0}")]
    Agent(#[from] AgentError),
}

/// Parse a hex address with or without the `0x` prefix.
#[must_use]
pub fn parse_hex_address(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a literal address typed by a user: `0x`-prefixed hex or plain decimal.
///
/// Anything else is a symbolic expression that the agent must resolve.
#[must_use]
pub fn parse_literal_address(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.starts_with("0x") || s.starts_with("0X") {
        parse_hex_address(s)
    } else if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct Tables {
    native: BTreeMap<u64, Hook>,
    java: BTreeMap<String, Hook>,
    on_load: BTreeMap<String, Hook>,
}

/// Installed hooks, one table per kind, with unique keys within each table.
///
/// Native and Java installs are confirmed asynchronously by the agent; the
/// registry keeps the in-flight request in its [`PendingArgsCorrelator`] and
/// builds the [`Hook`] when the confirmation is dispatched.
#[derive(Debug)]
pub struct HookRegistry {
    tables: Mutex<Tables>,
    pending: PendingArgsCorrelator,
    library_suffix: String,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_library_suffix(DEFAULT_LIBRARY_SUFFIX)
    }

    /// Create an empty registry normalizing module names to `suffix`.
    #[must_use]
    pub fn with_library_suffix(suffix: impl Into<String>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            pending: PendingArgsCorrelator::new(),
            library_suffix: suffix.into(),
        }
    }

    /// In-flight install records.
    #[must_use]
    pub const fn pending(&self) -> &PendingArgsCorrelator {
        &self.pending
    }

    /// Request a native hook on a literal address or a symbolic expression.
    ///
    /// Expressions are resolved through `evaluatePtr` first. Nothing is sent
    /// and nothing is stored if the target does not resolve to a non-zero
    /// address.
    ///
    /// # Errors
    /// Returns error if the target is empty or unresolved, or the install
    /// request fails.
    pub async fn install_native<A: AgentApi + ?Sized>(
        &self,
        agent: &A,
        input: &str,
        args: Option<PendingArgs>,
    ) -> Result<CorrelationId, HookError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(HookError::EmptyInput);
        }

        let address = match parse_literal_address(input) {
            Some(address) => address,
            None => resolve_pointer(agent, input).await?,
        };
        if address == 0 {
            return Err(HookError::Unresolved(input.to_string()));
        }

        let id = self
            .pending
            .begin(HookKind::Native, Some(input.to_string()), args);
        let request = vec![json!(format!("{address:#x}")), json!(id.to_string())];
        if let Err(e) = agent.api(0, "hookNative", request).await {
            self.pending.take(HookKind::Native, Some(id));
            return Err(e.into());
        }
        tracing::debug!(%input, address = format_args!("{address:#x}"), %id, "Native hook requested");
        Ok(id)
    }

    /// Request a Java hook on a class or method. Whitespace is stripped.
    ///
    /// # Errors
    /// Returns error if the class or method name is empty or the install request fails.
    pub async fn install_java<A: AgentApi + ?Sized>(
        &self,
        agent: &A,
        class_or_method: &str,
        args: Option<PendingArgs>,
    ) -> Result<CorrelationId, HookError> {
        let key: String = class_or_method.chars().filter(|c| !c.is_whitespace()).collect();
        if key.is_empty() {
            return Err(HookError::EmptyInput);
        }

        let id = self
            .pending
            .begin(HookKind::Java, Some(key.clone()), args);
        if let Err(e) = agent
            .api(0, "hookJava", vec![json!(key), json!(id.to_string())])
            .await
        {
            self.pending.take(HookKind::Java, Some(id));
            return Err(e.into());
        }
        tracing::debug!(%key, %id, "Java hook requested");
        Ok(id)
    }

    /// Request an on-load hook for a module.
    ///
    /// The name is normalized to end with the library suffix. Returns `None`
    /// without contacting the agent if the module is already registered.
    /// Otherwise a zero-address placeholder is stored once the request
    /// succeeds.
    ///
    /// # Errors
    /// Returns error if the name is empty or the install request fails.
    pub async fn install_on_load<A: AgentApi + ?Sized>(
        &self,
        agent: &A,
        module: &str,
    ) -> Result<Option<Hook>, HookError> {
        let module = module.trim();
        if module.is_empty() {
            return Err(HookError::EmptyInput);
        }
        let name = if module.ends_with(&self.library_suffix) {
            module.to_string()
        } else {
            format!("{module}{}", self.library_suffix)
        };

        if self.tables.lock().on_load.contains_key(&name) {
            return Ok(None);
        }

        agent.api(0, "hookOnLoad", vec![json!(name)]).await?;

        let hook = Hook::on_load(name.clone());
        self.tables.lock().on_load.insert(name, hook.clone());
        Ok(Some(hook))
    }

    /// Record the agent's confirmation of a native hook.
    pub fn on_native_installed(&self, address: u64, id: Option<CorrelationId>) -> Hook {
        let pending = self.pending.take(HookKind::Native, id);
        let (input, args) = match pending {
            Some(p) => (p.input, p.args),
            None => (None, None),
        };
        let hook = Hook::native(input.unwrap_or_else(|| format!("{address:#x}")), address)
            .with_pending(args);
        self.tables.lock().native.insert(address, hook.clone());
        hook
    }

    /// Record the agent's confirmation of a Java hook.
    pub fn on_java_installed(&self, key: &str, id: Option<CorrelationId>) -> Hook {
        let args = self.pending.take(HookKind::Java, id).and_then(|p| p.args);
        let hook = Hook::java(key).with_pending(args);
        self.tables.lock().java.insert(key.to_string(), hook.clone());
        hook
    }

    /// Native hook at `address`.
    #[must_use]
    pub fn native(&self, address: u64) -> Option<Hook> {
        self.tables.lock().native.get(&address).cloned()
    }

    /// Java hook for `key`.
    #[must_use]
    pub fn java(&self, key: &str) -> Option<Hook> {
        self.tables.lock().java.get(key).cloned()
    }

    /// On-load hook for `module` (already normalized).
    #[must_use]
    pub fn on_load(&self, module: &str) -> Option<Hook> {
        self.tables.lock().on_load.get(module).cloned()
    }

    /// All hooks of `kind`, ordered by key.
    #[must_use]
    pub fn hooks(&self, kind: HookKind) -> Vec<Hook> {
        let tables = self.tables.lock();
        match kind {
            HookKind::Native => tables.native.values().cloned().collect(),
            HookKind::Java => tables.java.values().cloned().collect(),
            HookKind::OnLoad => tables.on_load.values().cloned().collect(),
        }
    }

    /// Number of hooks of `kind`.
    #[must_use]
    pub fn count(&self, kind: HookKind) -> usize {
        let tables = self.tables.lock();
        match kind {
            HookKind::Native => tables.native.len(),
            HookKind::Java => tables.java.len(),
            HookKind::OnLoad => tables.on_load.len(),
        }
    }
}

async fn resolve_pointer<A: AgentApi + ?Sized>(agent: &A, expression: &str) -> Result<u64, HookError> {
    let reply = agent
        .api(0, "evaluatePtr", vec![json!(expression)])
        .await?;
    let address = match &reply {
        AgentReply::Json(Value::String(s)) => parse_hex_address(s),
        AgentReply::Json(Value::Number(n)) => n.as_u64(),
        _ => None,
    };
    address.ok_or_else(|| HookError::Unresolved(expression.to_string()))
}
