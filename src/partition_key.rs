//! Partition-key derivation policy.
//!
//! `static` always returns the configured value, carried directly on the
//! enum variant so a static mode with no value is unrepresentable; `fallback`
//! consults a user-supplied hook and falls back to a *named* fallback (not an
//! ad-hoc branch) when the hook has nothing to say. Deliberately structured
//! so a richer fallback (e.g. a primary-key hash) is a new enum variant
//! rather than a behavior change to existing code.

use crate::lsn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKeyMode {
    Static(String),
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKeyFallback {
    Lsn,
}

/// User-supplied extraction of a partition key from a decoded payload. The
/// core treats the payload as opaque bytes; this hook is the only place
/// that may interpret them.
pub trait PartitionKeyHook: Send + Sync {
    fn key_for(&self, payload: &[u8]) -> Option<String>;
}

/// Hook that never finds a key, forcing the configured fallback every time.
/// The default when no richer hook is wired up.
pub struct NoOpHook;

impl PartitionKeyHook for NoOpHook {
    fn key_for(&self, _payload: &[u8]) -> Option<String> {
        None
    }
}

pub struct PartitionKeyPolicy {
    mode: PartitionKeyMode,
    fallback: PartitionKeyFallback,
    hook: Box<dyn PartitionKeyHook>,
}

impl PartitionKeyPolicy {
    pub fn new(mode: PartitionKeyMode, fallback: PartitionKeyFallback, hook: Box<dyn PartitionKeyHook>) -> Self {
        Self { mode, fallback, hook }
    }

    pub fn key_for(&self, payload: &[u8], event_lsn: u64) -> String {
        match &self.mode {
            PartitionKeyMode::Static(value) => value.clone(),
            PartitionKeyMode::Fallback => self
                .hook
                .key_for(payload)
                .unwrap_or_else(|| self.fallback_key(event_lsn)),
        }
    }

    fn fallback_key(&self, event_lsn: u64) -> String {
        match self.fallback {
            PartitionKeyFallback::Lsn => lsn::format(event_lsn),
        }
    }
}
