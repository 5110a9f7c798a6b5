//! AST scans for dangerous routines and injection-shaped string literals.
//!
//! Both scans walk a parsed statement depth-first using the `sqlparser`
//! visitor helpers and stop at the first hit.

use regex::Regex;
use sqlparser::ast::{Expr, ObjectName, Statement, Value, visit_expressions, visit_relations};
use std::ops::ControlFlow;
use std::sync::LazyLock;

/// Family of a deny-listed routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerousCategory {
    ShellExecution,
    ServerConfiguration,
    RemoteQuery,
    OleAutomation,
    BulkLoad,
    FileSystem,
    DynamicSql,
}

impl DangerousCategory {
    pub fn description(&self) -> &'static str {
        match self {
            Self::ShellExecution => "operating-system command execution",
            Self::ServerConfiguration => "dynamic server configuration",
            Self::RemoteQuery => "ad hoc remote query",
            Self::OleAutomation => "OLE automation",
            Self::BulkLoad => "bulk load or export",
            Self::FileSystem => "server file-system access",
            Self::DynamicSql => "dynamic SQL execution",
        }
    }
}

/// A deny-list hit: the routine name as written (lowercased) and its family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DangerousHit {
    pub name: String,
    pub category: DangerousCategory,
}

impl DangerousHit {
    pub fn reason(&self) -> String {
        format!(
            "Call to '{}' ({}) is never permitted, regardless of tier configuration.",
            self.name,
            self.category.description()
        )
    }
}

const DENY_LIST: &[(&str, DangerousCategory)] = &[
    ("xp_cmdshell", DangerousCategory::ShellExecution),
    ("sys_exec", DangerousCategory::ShellExecution),
    ("sys_eval", DangerousCategory::ShellExecution),
    ("sp_configure", DangerousCategory::ServerConfiguration),
    ("sp_addextendedproc", DangerousCategory::ServerConfiguration),
    ("xp_regwrite", DangerousCategory::ServerConfiguration),
    ("xp_regread", DangerousCategory::ServerConfiguration),
    ("load_extension", DangerousCategory::ServerConfiguration),
    ("openrowset", DangerousCategory::RemoteQuery),
    ("opendatasource", DangerousCategory::RemoteQuery),
    ("openquery", DangerousCategory::RemoteQuery),
    ("dblink", DangerousCategory::RemoteQuery),
    ("dblink_exec", DangerousCategory::RemoteQuery),
    ("sp_oacreate", DangerousCategory::OleAutomation),
    ("sp_oamethod", DangerousCategory::OleAutomation),
    ("sp_oagetproperty", DangerousCategory::OleAutomation),
    ("sp_oasetproperty", DangerousCategory::OleAutomation),
    ("sp_oadestroy", DangerousCategory::OleAutomation),
    ("lo_import", DangerousCategory::BulkLoad),
    ("lo_export", DangerousCategory::BulkLoad),
    ("pg_read_file", DangerousCategory::FileSystem),
    ("pg_read_binary_file", DangerousCategory::FileSystem),
    ("pg_ls_dir", DangerousCategory::FileSystem),
    ("load_file", DangerousCategory::FileSystem),
    ("readfile", DangerousCategory::FileSystem),
    ("writefile", DangerousCategory::FileSystem),
    ("xp_dirtree", DangerousCategory::FileSystem),
    ("xp_fileexist", DangerousCategory::FileSystem),
    ("sp_executesql", DangerousCategory::DynamicSql),
];

/// Iterate the deny-listed routine names. Shared with the fallback scanner.
pub(crate) fn deny_list() -> impl Iterator<Item = (&'static str, DangerousCategory)> {
    DENY_LIST.iter().copied()
}

/// Look up a bare routine name (already normalized) in the deny list.
pub(crate) fn lookup(name: &str) -> Option<DangerousHit> {
    DENY_LIST
        .iter()
        .find(|(denied, _)| *denied == name)
        .map(|(denied, category)| DangerousHit {
            name: (*denied).to_string(),
            category: *category,
        })
}

/// Last dotted segment, unquoted and lowercased: `[master].dbo."XP_CmdShell"` -> `xp_cmdshell`.
fn normalize_routine(raw: &str) -> String {
    raw.rsplit('.')
        .next()
        .unwrap_or(raw)
        .trim_matches(|c| matches!(c, '"' | '`' | '[' | ']' | '\''))
        .to_ascii_lowercase()
}

fn check_object_name(name: &ObjectName) -> Option<DangerousHit> {
    lookup(&normalize_routine(&name.to_string()))
}

static PROCEDURE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:CALL|EXEC(?:UTE)?)\s+(?:IMMEDIATE\s+)?([^\s(;,]+)")
        .expect("constant pattern")
});

/// Find the first deny-listed routine referenced anywhere in `stmt`.
pub fn find_dangerous(stmt: &Statement) -> Option<DangerousHit> {
    if matches!(stmt, Statement::Copy { .. } | Statement::CopyIntoSnowflake { .. }) {
        return Some(DangerousHit {
            name: "copy".to_string(),
            category: DangerousCategory::BulkLoad,
        });
    }

    if matches!(stmt, Statement::Call { .. } | Statement::Execute { .. }) {
        let rendered = stmt.to_string();
        if let Some(hit) = PROCEDURE_CALL
            .captures(&rendered)
            .and_then(|caps| caps.get(1))
            .and_then(|m| lookup(&normalize_routine(m.as_str())))
        {
            return Some(hit);
        }
    }

    let functions = visit_expressions(stmt, |expr| match expr {
        Expr::Function(func) => match check_object_name(&func.name) {
            Some(hit) => ControlFlow::Break(hit),
            None => ControlFlow::Continue(()),
        },
        _ => ControlFlow::Continue(()),
    });
    if let ControlFlow::Break(hit) = functions {
        return Some(hit);
    }

    // Table-valued routines (OPENROWSET, dblink) appear as relations
    match visit_relations(stmt, |name| match check_object_name(name) {
        Some(hit) => ControlFlow::Break(hit),
        None => ControlFlow::Continue(()),
    }) {
        ControlFlow::Break(hit) => Some(hit),
        ControlFlow::Continue(()) => None,
    }
}

/// Suspicious shape found inside a string literal. The literal itself is
/// never echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPattern {
    QuoteBreakout,
    UnionSelect,
    CommentMarker,
    SystemCatalog,
}

impl InjectionPattern {
    pub fn label(&self) -> &'static str {
        match self {
            Self::QuoteBreakout => "quote breakout",
            Self::UnionSelect => "UNION SELECT",
            Self::CommentMarker => "comment marker",
            Self::SystemCatalog => "system catalog reference",
        }
    }

    pub fn reason(&self) -> String {
        format!(
            "String literal contains a suspicious {} sequence. \
             Pass data values without embedded SQL.",
            self.label()
        )
    }
}

static INJECTION_PATTERNS: LazyLock<Vec<(Regex, InjectionPattern)>> = LazyLock::new(|| {
    [
        (r"(?i)'\s*(?:or|and)\s+", InjectionPattern::QuoteBreakout),
        (r"'\s*;", InjectionPattern::QuoteBreakout),
        (r"(?i)\bunion\s+(?:all\s+)?select\b", InjectionPattern::UnionSelect),
        (r"--|/\*", InjectionPattern::CommentMarker),
        (
            r"(?i)\b(?:information_schema|sysobjects|syscolumns|pg_catalog|pg_shadow|sqlite_master)\b|\bsys\.|\bmysql\.user\b",
            InjectionPattern::SystemCatalog,
        ),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("constant pattern"), kind))
    .collect()
});

fn literal_text(value: &Value) -> Option<&str> {
    match value {
        Value::SingleQuotedString(s)
        | Value::DoubleQuotedString(s)
        | Value::EscapedStringLiteral(s)
        | Value::NationalStringLiteral(s) => Some(s.as_str()),
        Value::DollarQuotedString(dq) => Some(dq.value.as_str()),
        _ => None,
    }
}

/// Check one literal against the injection patterns.
pub fn scan_literal(text: &str) -> Option<InjectionPattern> {
    INJECTION_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, kind)| *kind)
}

/// Find the first string literal in `stmt` that matches an injection pattern.
pub fn find_injection(stmt: &Statement) -> Option<InjectionPattern> {
    match visit_expressions(stmt, |expr| {
        let hit = match expr {
            Expr::Value(v) => literal_text(&v.value).and_then(scan_literal),
            _ => None,
        };
        match hit {
            Some(hit) => ControlFlow::Break(hit),
            None => ControlFlow::Continue(()),
        }
    }) {
        ControlFlow::Break(hit) => Some(hit),
        ControlFlow::Continue(()) => None,
    }
}
