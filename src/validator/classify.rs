//! Statement classification.
//!
//! Maps each parsed `sqlparser` statement onto one of the four permission
//! categories. Anything not listed explicitly is `Unknown` and therefore
//! needs the most permissive tier to run.

use schemars::JsonSchema;
use serde::Serialize;
use sqlparser::ast::{Query, SetExpr, Statement};

/// Permission category of a single statement, ordered by required privilege.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// SELECT, SHOW, DESCRIBE, EXPLAIN of a read
    ReadOnly,
    /// INSERT, UPDATE, DELETE, MERGE, TRUNCATE, COPY, CALL, EXEC
    Destructive,
    /// CREATE, ALTER, DROP, COMMENT, GRANT, REVOKE, DENY
    SchemaChange,
    /// Transaction control, session and administrative statements
    Unknown,
}

impl StatementKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ReadOnly => "Read-only",
            Self::Destructive => "Destructive",
            Self::SchemaChange => "Schema-change",
            Self::Unknown => "Unclassified",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify a parsed statement, returning its kind and an operation keyword
/// suitable for error text.
pub fn classify_statement(stmt: &Statement) -> (StatementKind, &'static str) {
    use StatementKind::*;

    match stmt {
        Statement::Query(query) => classify_query(query),
        Statement::ShowTables { .. } => (ReadOnly, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (ReadOnly, "SHOW COLUMNS"),
        Statement::ShowDatabases { .. } => (ReadOnly, "SHOW DATABASES"),
        Statement::ShowSchemas { .. } => (ReadOnly, "SHOW SCHEMAS"),
        Statement::ShowCreate { .. } => (ReadOnly, "SHOW CREATE"),
        Statement::ShowFunctions { .. } => (ReadOnly, "SHOW FUNCTIONS"),
        Statement::ShowVariable { .. } => (ReadOnly, "SHOW VARIABLE"),
        Statement::ShowVariables { .. } => (ReadOnly, "SHOW VARIABLES"),
        Statement::ShowStatus { .. } => (ReadOnly, "SHOW STATUS"),
        Statement::ShowCollation { .. } => (ReadOnly, "SHOW COLLATION"),
        Statement::ExplainTable { .. } => (ReadOnly, "DESCRIBE"),

        // EXPLAIN ANALYZE runs its statement, so the inner kind decides
        Statement::Explain { statement, .. } => match classify_statement(statement) {
            (ReadOnly, _) => (ReadOnly, "EXPLAIN"),
            inner => inner,
        },

        Statement::Insert(_) => (Destructive, "INSERT"),
        Statement::Update { .. } => (Destructive, "UPDATE"),
        Statement::Delete(_) => (Destructive, "DELETE"),
        Statement::Merge { .. } => (Destructive, "MERGE"),
        Statement::Truncate { .. } => (Destructive, "TRUNCATE"),
        Statement::Copy { .. } => (Destructive, "COPY"),
        Statement::CopyIntoSnowflake { .. } => (Destructive, "COPY INTO"),
        Statement::Call { .. } => (Destructive, "CALL"),
        Statement::Execute { .. } => (Destructive, "EXEC"),

        Statement::CreateTable { .. } => (SchemaChange, "CREATE TABLE"),
        Statement::CreateView { .. } => (SchemaChange, "CREATE VIEW"),
        Statement::CreateIndex(_) => (SchemaChange, "CREATE INDEX"),
        Statement::CreateSchema { .. } => (SchemaChange, "CREATE SCHEMA"),
        Statement::CreateDatabase { .. } => (SchemaChange, "CREATE DATABASE"),
        Statement::CreateSequence { .. } => (SchemaChange, "CREATE SEQUENCE"),
        Statement::CreateType { .. } => (SchemaChange, "CREATE TYPE"),
        Statement::CreateFunction { .. } => (SchemaChange, "CREATE FUNCTION"),
        Statement::CreateProcedure { .. } => (SchemaChange, "CREATE PROCEDURE"),
        Statement::CreateTrigger { .. } => (SchemaChange, "CREATE TRIGGER"),
        Statement::CreateRole { .. } => (SchemaChange, "CREATE ROLE"),
        Statement::CreateVirtualTable { .. } => (SchemaChange, "CREATE VIRTUAL TABLE"),
        Statement::CreateExtension { .. } => (SchemaChange, "CREATE EXTENSION"),
        Statement::CreatePolicy { .. } => (SchemaChange, "CREATE POLICY"),
        Statement::AlterTable { .. } => (SchemaChange, "ALTER TABLE"),
        Statement::AlterView { .. } => (SchemaChange, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (SchemaChange, "ALTER INDEX"),
        Statement::AlterSchema { .. } => (SchemaChange, "ALTER SCHEMA"),
        Statement::AlterRole { .. } => (SchemaChange, "ALTER ROLE"),
        Statement::AlterPolicy { .. } => (SchemaChange, "ALTER POLICY"),
        Statement::AlterType { .. } => (SchemaChange, "ALTER TYPE"),
        Statement::Drop { .. } => (SchemaChange, "DROP"),
        Statement::DropFunction { .. } => (SchemaChange, "DROP FUNCTION"),
        Statement::DropProcedure { .. } => (SchemaChange, "DROP PROCEDURE"),
        Statement::DropTrigger { .. } => (SchemaChange, "DROP TRIGGER"),
        Statement::DropPolicy { .. } => (SchemaChange, "DROP POLICY"),
        Statement::Comment { .. } => (SchemaChange, "COMMENT"),
        Statement::Grant { .. } => (SchemaChange, "GRANT"),
        Statement::Revoke { .. } => (SchemaChange, "REVOKE"),
        Statement::Deny { .. } => (SchemaChange, "DENY"),

        Statement::StartTransaction { .. } => (Unknown, "BEGIN"),
        Statement::Commit { .. } => (Unknown, "COMMIT"),
        Statement::Rollback { .. } => (Unknown, "ROLLBACK"),
        Statement::Savepoint { .. } => (Unknown, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (Unknown, "RELEASE SAVEPOINT"),
        Statement::Prepare { .. } => (Unknown, "PREPARE"),
        Statement::Deallocate { .. } => (Unknown, "DEALLOCATE"),
        Statement::Set(_) => (Unknown, "SET"),
        Statement::Use(_) => (Unknown, "USE"),
        Statement::Kill { .. } => (Unknown, "KILL"),
        Statement::Vacuum { .. } => (Unknown, "VACUUM"),
        Statement::Analyze { .. } => (Unknown, "ANALYZE"),
        Statement::LockTables { .. } => (Unknown, "LOCK"),
        Statement::UnlockTables => (Unknown, "UNLOCK"),
        Statement::Flush { .. } => (Unknown, "FLUSH"),
        Statement::Pragma { .. } => (Unknown, "PRAGMA"),
        Statement::AttachDatabase { .. } => (Unknown, "ATTACH"),

        _ => (Unknown, "statement"),
    }
}

/// A query is only as read-only as its most privileged part: data-modifying
/// CTEs, `SELECT ... INTO` and row-locking clauses all escalate it.
fn classify_query(query: &Query) -> (StatementKind, &'static str) {
    let mut kind = if query.locks.is_empty() {
        (StatementKind::ReadOnly, "SELECT")
    } else {
        (StatementKind::Destructive, "SELECT FOR UPDATE")
    };
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            kind = escalate(kind, classify_query(&cte.query));
        }
    }
    escalate(kind, classify_set_expr(&query.body))
}

fn classify_set_expr(expr: &SetExpr) -> (StatementKind, &'static str) {
    match expr {
        SetExpr::Select(select) if select.into.is_some() => {
            (StatementKind::SchemaChange, "SELECT INTO")
        }
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => {
            (StatementKind::ReadOnly, "SELECT")
        }
        SetExpr::Query(query) => classify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            escalate(classify_set_expr(left), classify_set_expr(right))
        }
        SetExpr::Insert(stmt)
        | SetExpr::Update(stmt)
        | SetExpr::Delete(stmt)
        | SetExpr::Merge(stmt) => classify_statement(stmt),
    }
}

fn escalate(
    current: (StatementKind, &'static str),
    other: (StatementKind, &'static str),
) -> (StatementKind, &'static str) {
    if other.0 > current.0 { other } else { current }
}
