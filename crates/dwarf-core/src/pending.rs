//! Correlation of hook install requests with their asynchronous confirmations.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, HookKind};

/// Condition and logic to attach to a hook once the agent confirms it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingArgs {
    /// Break condition expression.
    #[serde(default)]
    pub condition: Option<String>,
    /// Script body run on hit.
    #[serde(default)]
    pub logic: Option<String>,
}

impl PendingArgs {
    /// Create pending args.
    #[must_use]
    pub fn new(condition: Option<String>, logic: Option<String>) -> Self {
        Self { condition, logic }
    }
}

/// One in-flight install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// Id sent with the install request.
    pub id: CorrelationId,
    /// Input the user typed, kept as the hook's display key.
    pub input: Option<String>,
    /// Args to attach on confirmation.
    pub args: Option<PendingArgs>,
}

/// Holds at most one in-flight install per hook kind.
///
/// Beginning a second install of the same kind evicts the first. A
/// confirmation that echoes a correlation id only consumes the record with
/// that id; one that carries no id consumes whatever is in the slot.
#[derive(Debug, Default)]
pub struct PendingArgsCorrelator {
    slots: Mutex<HashMap<HookKind, Pending>>,
}

impl PendingArgsCorrelator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new in-flight install of `kind` and return its id.
    pub fn begin(
        &self,
        kind: HookKind,
        input: Option<String>,
        args: Option<PendingArgs>,
    ) -> CorrelationId {
        let id = CorrelationId::new();
        let evicted = self
            .slots
            .lock()
            .insert(kind, Pending { id, input, args });
        if let Some(old) = evicted {
            tracing::debug!(?kind, evicted = %old.id, "Pending install replaced before confirmation");
        }
        id
    }

    /// Overwrite the pending args for `kind`.
    pub fn set_pending(&self, kind: HookKind, args: Option<PendingArgs>) -> CorrelationId {
        self.begin(kind, None, args)
    }

    /// Take the pending args for `kind`, clearing the slot.
    pub fn take_pending(&self, kind: HookKind) -> Option<PendingArgs> {
        self.take(kind, None).and_then(|p| p.args)
    }

    /// Take the in-flight record for `kind`.
    ///
    /// With `Some(id)` the slot is only consumed if it holds that id.
    pub fn take(&self, kind: HookKind, id: Option<CorrelationId>) -> Option<Pending> {
        let mut slots = self.slots.lock();
        match id {
            None => slots.remove(&kind),
            Some(id) => match slots.get(&kind) {
                Some(pending) if pending.id == id => slots.remove(&kind),
                Some(pending) => {
                    tracing::warn!(?kind, %id, current = %pending.id, "Confirmation for a superseded install");
                    None
                }
                None => None,
            },
        }
    }

    /// Whether an install of `kind` awaits confirmation.
    #[must_use]
    pub fn is_pending(&self, kind: HookKind) -> bool {
        self.slots.lock().contains_key(&kind)
    }

    /// Drop every in-flight record.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(condition: &str) -> PendingArgs {
        PendingArgs::new(Some(condition.to_string()), None)
    }

    #[test]
    fn test_take_pending_consumes_once() {
        let correlator = PendingArgsCorrelator::new();
        correlator.set_pending(HookKind::Native, Some(args("x0 == 1")));

        assert_eq!(correlator.take_pending(HookKind::Native), Some(args("x0 == 1")));
        assert_eq!(correlator.take_pending(HookKind::Native), None);
    }

    #[test]
    fn test_second_set_overwrites_first() {
        let correlator = PendingArgsCorrelator::new();
        correlator.set_pending(HookKind::Java, Some(args("first")));
        correlator.set_pending(HookKind::Java, Some(args("second")));

        assert_eq!(correlator.take_pending(HookKind::Java), Some(args("second")));
        assert!(!correlator.is_pending(HookKind::Java));
    }

    #[test]
    fn test_kinds_are_independent() {
        let correlator = PendingArgsCorrelator::new();
        correlator.set_pending(HookKind::Native, Some(args("native")));
        correlator.set_pending(HookKind::Java, Some(args("java")));

        assert_eq!(correlator.take_pending(HookKind::Java), Some(args("java")));
        assert!(correlator.is_pending(HookKind::Native));
    }

    #[test]
    fn test_stale_id_does_not_steal_newer_record() {
        let correlator = PendingArgsCorrelator::new();
        let first = correlator.begin(HookKind::Native, Some("open".into()), Some(args("a")));
        let second = correlator.begin(HookKind::Native, Some("read".into()), Some(args("b")));

        assert_eq!(correlator.take(HookKind::Native, Some(first)), None);
        let taken = correlator.take(HookKind::Native, Some(second)).unwrap();
        assert_eq!(taken.input.as_deref(), Some("read"));
        assert_eq!(taken.args, Some(args("b")));
    }

    #[test]
    fn test_clear() {
        let correlator = PendingArgsCorrelator::new();
        correlator.set_pending(HookKind::Native, None);
        correlator.clear();
        assert!(!correlator.is_pending(HookKind::Native));
    }
}
