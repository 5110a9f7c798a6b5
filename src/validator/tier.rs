//! Security tier policy and its runtime-replaceable holder.

use super::classify::StatementKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// The three permission toggles. `read_only` overrides the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecurityTierConfig {
    pub read_only: bool,
    pub allow_destructive: bool,
    pub allow_schema_changes: bool,
}

impl Default for SecurityTierConfig {
    fn default() -> Self {
        Self::read_only()
    }
}

impl SecurityTierConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            allow_destructive: false,
            allow_schema_changes: false,
        }
    }

    /// Read-only off, both allow flags on.
    pub fn unrestricted() -> Self {
        Self {
            read_only: false,
            allow_destructive: true,
            allow_schema_changes: true,
        }
    }

    /// Decide whether a statement of `kind` may run. The error names the
    /// toggle(s) that would permit it.
    pub fn permits(&self, kind: StatementKind, operation: &str) -> Result<(), String> {
        if kind == StatementKind::ReadOnly {
            return Ok(());
        }

        if self.read_only {
            return Err(format!(
                "{} statement ({}) is not permitted in read-only mode. \
                 Set read_only=false (MCP_READ_ONLY=false){} to allow it.",
                kind,
                operation,
                required_toggles(kind)
            ));
        }

        match kind {
            StatementKind::ReadOnly => Ok(()),
            StatementKind::Destructive if !self.allow_destructive => Err(format!(
                "Destructive statement ({}) is not permitted. \
                 Set allow_destructive=true (MCP_ALLOW_DESTRUCTIVE=true) to allow it.",
                operation
            )),
            StatementKind::SchemaChange if !self.allow_schema_changes => Err(format!(
                "Schema-change statement ({}) is not permitted. \
                 Set allow_schema_changes=true (MCP_ALLOW_SCHEMA_CHANGES=true) to allow it.",
                operation
            )),
            StatementKind::Unknown if !(self.allow_destructive && self.allow_schema_changes) => {
                Err(format!(
                    "Unclassified statement ({}) is only permitted when allow_destructive=true \
                     and allow_schema_changes=true (MCP_ALLOW_DESTRUCTIVE, MCP_ALLOW_SCHEMA_CHANGES).",
                    operation
                ))
            }
            _ => Ok(()),
        }
    }
}

fn required_toggles(kind: StatementKind) -> &'static str {
    match kind {
        StatementKind::ReadOnly => "",
        StatementKind::Destructive => " and allow_destructive=true",
        StatementKind::SchemaChange => " and allow_schema_changes=true",
        StatementKind::Unknown => " with allow_destructive=true and allow_schema_changes=true",
    }
}

/// Holder for the active tier config.
///
/// Readers take an `Arc` snapshot once per validation, so a concurrent
/// `replace` never changes the config a running check observes.
#[derive(Debug, Default)]
pub struct TierConfigCell {
    inner: RwLock<Arc<SecurityTierConfig>>,
}

impl TierConfigCell {
    pub fn new(config: SecurityTierConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<SecurityTierConfig> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new config; returns the previous one.
    pub fn replace(&self, config: SecurityTierConfig) -> Arc<SecurityTierConfig> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}
