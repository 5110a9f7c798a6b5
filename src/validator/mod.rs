//! SQL request validation.
//!
//! [`validate`] decides whether a batch of SQL text may run under a given
//! [`SecurityTierConfig`]. Parsing uses [sqlparser](https://docs.rs/sqlparser/)
//! with the dialect of the target backend; when the parser rejects the text
//! a keyword-prefix fallback takes over and the verdict is flagged as
//! reduced-confidence.
//!
//! Each statement is checked in document order:
//!
//! 1. dangerous routine scan (always wins, whatever the tier)
//! 2. stacked statement check (a write after a read in the same batch)
//! 3. tier policy
//! 4. injection patterns in string literals (parsed mode only)
//!
//! The first failing statement stops evaluation.
//!
//! ```
//! use guarded_sql_mcp::validator::{validate, SecurityTierConfig, SqlDialect};
//!
//! let tiers = SecurityTierConfig::read_only();
//! assert!(validate("SELECT * FROM users", &tiers, SqlDialect::PostgreSql).allowed);
//! assert!(!validate("DELETE FROM users", &tiers, SqlDialect::PostgreSql).allowed);
//! ```

pub mod classify;
pub mod fallback;
pub mod scan;
pub mod tier;

pub use classify::{StatementKind, classify_statement};
pub use scan::{DangerousCategory, DangerousHit, InjectionPattern};
pub use tier::{SecurityTierConfig, TierConfigCell};

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;
use tracing::{debug, warn};

/// SQL dialect used to parse incoming text.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[value(name = "postgres")]
    PostgreSql,
    #[value(name = "mysql")]
    MySql,
    #[value(name = "sqlite")]
    Sqlite,
    #[value(name = "mssql")]
    MsSql,
    #[value(name = "generic")]
    Generic,
}

impl SqlDialect {
    pub fn parser(&self) -> Box<dyn Dialect> {
        match self {
            Self::PostgreSql => Box::new(PostgreSqlDialect {}),
            Self::MySql => Box::new(MySqlDialect {}),
            Self::Sqlite => Box::new(SQLiteDialect {}),
            Self::MsSql => Box::new(MsSqlDialect {}),
            Self::Generic => Box::new(GenericDialect {}),
        }
    }
}

impl From<DatabaseType> for SqlDialect {
    fn from(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::PostgreSQL => Self::PostgreSql,
            DatabaseType::MySQL => Self::MySql,
            DatabaseType::SQLite => Self::Sqlite,
        }
    }
}

/// Outcome of validating one batch of SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ValidationVerdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Kind of the rejected statement, or the most privileged kind in an allowed batch
    pub statement_kind: StatementKind,
    /// 1-based position of the rejected statement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_statements: Option<u32>,
    pub security_violation: bool,
    /// The parser rejected the text and keyword heuristics were used instead
    pub used_fallback: bool,
}

impl ValidationVerdict {
    fn allow(kind: StatementKind, total: u32, used_fallback: bool) -> Self {
        Self {
            allowed: true,
            reason: None,
            statement_kind: kind,
            statement_index: None,
            total_statements: Some(total),
            security_violation: false,
            used_fallback,
        }
    }

    fn empty() -> Self {
        Self {
            allowed: false,
            reason: Some("Empty SQL statement".to_string()),
            statement_kind: StatementKind::Unknown,
            statement_index: None,
            total_statements: None,
            security_violation: false,
            used_fallback: false,
        }
    }

    /// Convert a rejection into the error surfaced to callers.
    pub fn into_result(self) -> DbResult<Self> {
        if self.allowed {
            return Ok(self);
        }
        Err(DbError::policy_rejection(
            self.reason.unwrap_or_else(|| "Statement rejected".to_string()),
            self.statement_index,
            self.total_statements,
            self.security_violation,
        ))
    }
}

/// A failed check for a single statement.
struct Rejection {
    reason: String,
    security_violation: bool,
}

impl Rejection {
    fn security(reason: String) -> Self {
        Self {
            reason,
            security_violation: true,
        }
    }

    fn policy(reason: String) -> Self {
        Self {
            reason,
            security_violation: false,
        }
    }
}

fn stacked_reason(kind: StatementKind, operation: &str) -> String {
    format!(
        "{} statement ({}) follows a read-only statement in the same request. \
         Stacked statements are never permitted; submit each statement separately.",
        kind, operation
    )
}

/// Checks shared by parsed and fallback mode, in their fixed order.
fn check_statement(
    kind: StatementKind,
    operation: &str,
    dangerous: Option<DangerousHit>,
    after_read: bool,
    tiers: &SecurityTierConfig,
) -> Result<(), Rejection> {
    if let Some(hit) = dangerous {
        return Err(Rejection::security(hit.reason()));
    }
    if after_read && kind != StatementKind::ReadOnly {
        return Err(Rejection::security(stacked_reason(kind, operation)));
    }
    tiers.permits(kind, operation).map_err(Rejection::policy)
}

/// Validate `sql` against `tiers` using `dialect` for parsing.
///
/// Deterministic and free of I/O: the same inputs always produce the same
/// verdict.
pub fn validate(sql: &str, tiers: &SecurityTierConfig, dialect: SqlDialect) -> ValidationVerdict {
    if sql.trim().is_empty() {
        return ValidationVerdict::empty();
    }

    let parser_dialect = dialect.parser();
    let statements = match Parser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(e) => {
            warn!(
                error = %e,
                dialect = ?dialect,
                "SQL parse failed, using keyword fallback validation"
            );
            return validate_fallback(sql, tiers);
        }
    };

    if statements.is_empty() {
        return ValidationVerdict::empty();
    }

    let total = u32::try_from(statements.len()).unwrap_or(u32::MAX);
    let mut highest = StatementKind::ReadOnly;
    let mut after_read = false;

    for (position, stmt) in statements.iter().enumerate() {
        let index = u32::try_from(position + 1).unwrap_or(u32::MAX);
        let (kind, operation) = classify_statement(stmt);

        let outcome = check_statement(
            kind,
            operation,
            scan::find_dangerous(stmt),
            after_read,
            tiers,
        )
        .and_then(|()| match scan::find_injection(stmt) {
            Some(pattern) => Err(Rejection::security(pattern.reason())),
            None => Ok(()),
        });

        if let Err(rejection) = outcome {
            return reject(kind, index, total, rejection, false);
        }

        debug!(index, kind = %kind, operation, "Statement passed validation");
        after_read |= kind == StatementKind::ReadOnly;
        highest = highest.max(kind);
    }

    ValidationVerdict::allow(highest, total, false)
}

fn validate_fallback(sql: &str, tiers: &SecurityTierConfig) -> ValidationVerdict {
    let segments = fallback::split_statements(sql);
    if segments.is_empty() {
        return ValidationVerdict {
            used_fallback: true,
            ..ValidationVerdict::empty()
        };
    }

    let total = u32::try_from(segments.len()).unwrap_or(u32::MAX);
    let mut highest = StatementKind::ReadOnly;
    let mut after_read = false;

    for (position, segment) in segments.iter().enumerate() {
        let index = u32::try_from(position + 1).unwrap_or(u32::MAX);
        let (kind, operation) = fallback::classify_segment(&segment.masked);

        if let Err(rejection) = check_statement(
            kind,
            &operation,
            fallback::find_dangerous_lexical(&segment.masked),
            after_read,
            tiers,
        ) {
            return reject(kind, index, total, rejection, true);
        }

        after_read |= kind == StatementKind::ReadOnly;
        highest = highest.max(kind);
    }

    ValidationVerdict::allow(highest, total, true)
}

fn reject(
    kind: StatementKind,
    index: u32,
    total: u32,
    rejection: Rejection,
    used_fallback: bool,
) -> ValidationVerdict {
    warn!(
        statement_index = index,
        total_statements = total,
        kind = %kind,
        security_violation = rejection.security_violation,
        used_fallback,
        "SQL rejected by validator"
    );
    ValidationVerdict {
        allowed: false,
        reason: Some(rejection.reason),
        statement_kind: kind,
        statement_index: Some(index),
        total_statements: Some(total),
        security_violation: rejection.security_violation,
        used_fallback,
    }
}
