//! Reduced-confidence validation for text the SQL parser rejects.
//!
//! The input is split on `;` outside quotes and comments, literal contents
//! are masked, and each segment is classified by its leading keyword.

use super::classify::StatementKind;
use super::scan::{self, DangerousCategory, DangerousHit};
use regex::Regex;
use std::sync::LazyLock;

/// One statement-shaped piece of the input with literals blanked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub masked: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LexState {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split `sql` into statements and mask string literals (`'...'` becomes `''`)
/// and comments (replaced by a space). Quoted identifiers keep their text.
pub fn split_statements(sql: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut state = LexState::Code;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            LexState::Code => match c {
                ';' => {
                    push_segment(&mut segments, &mut current);
                }
                '\'' => {
                    current.push('\'');
                    state = LexState::Quoted('\'');
                }
                '"' | '`' => {
                    current.push(c);
                    state = LexState::Quoted(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    current.push(' ');
                    state = LexState::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    current.push(' ');
                    state = LexState::BlockComment;
                }
                _ => current.push(c),
            },
            LexState::Quoted(quote) => {
                if c == quote {
                    // Doubled quote is an escaped quote inside the literal
                    if chars.peek() == Some(&quote) {
                        chars.next();
                        if quote != '\'' {
                            current.push(quote);
                            current.push(quote);
                        }
                    } else {
                        current.push(quote);
                        state = LexState::Code;
                    }
                } else if quote != '\'' {
                    current.push(c);
                }
            }
            LexState::LineComment => {
                if c == '\n' {
                    current.push('\n');
                    state = LexState::Code;
                }
            }
            LexState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = LexState::Code;
                }
            }
        }
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn push_segment(segments: &mut Vec<Segment>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(Segment {
            masked: trimmed.to_string(),
        });
    }
    current.clear();
}

static READ_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s(]*(SELECT|SHOW|DESCRIBE|DESC|EXPLAIN|VALUES)\b")
        .expect("constant pattern")
});

static WITH_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[\s(]*WITH\b").expect("constant pattern"));

static WRITE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE|MERGE)\b").expect("constant pattern")
});

static SELECT_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("constant pattern"));

static DESTRUCTIVE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s(]*(INSERT|UPDATE|DELETE|TRUNCATE|EXECUTE|EXEC|CALL|MERGE|REPLACE|UPSERT)\b")
        .expect("constant pattern")
});

static SCHEMA_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s(]*(CREATE|DROP|ALTER|GRANT|REVOKE|DENY|RENAME|COMMENT)\b")
        .expect("constant pattern")
});

static FIRST_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s(]*([A-Za-z_]+)").expect("constant pattern"));

/// Classify a masked segment by its leading keyword.
///
/// The returned operation is the matched keyword in upper case, or
/// "statement" when nothing recognisable leads the text.
pub fn classify_segment(masked: &str) -> (StatementKind, String) {
    let keyword = |re: &Regex| {
        re.captures(masked)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_ascii_uppercase())
    };

    if WITH_PREFIX.is_match(masked) {
        if let Some(m) = WRITE_KEYWORD.find(masked) {
            return (StatementKind::Destructive, m.as_str().to_ascii_uppercase());
        }
        if SELECT_KEYWORD.is_match(masked) {
            return (StatementKind::ReadOnly, "SELECT".to_string());
        }
        return (StatementKind::Unknown, "WITH".to_string());
    }
    if let Some(op) = keyword(&READ_PREFIX) {
        return (StatementKind::ReadOnly, op);
    }
    if let Some(op) = keyword(&DESTRUCTIVE_PREFIX) {
        return (StatementKind::Destructive, op);
    }
    if let Some(op) = keyword(&SCHEMA_PREFIX) {
        return (StatementKind::SchemaChange, op);
    }
    let op = keyword(&FIRST_WORD).unwrap_or_else(|| "statement".to_string());
    (StatementKind::Unknown, op)
}

static LEXICAL_DENY: LazyLock<Regex> = LazyLock::new(|| {
    let names: Vec<&str> = scan::deny_list().map(|(name, _)| name).collect();
    Regex::new(&format!(r"(?i)\b({})\b", names.join("|"))).expect("constant pattern")
});

static LEXICAL_BULK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbulk\s+insert\b|\bload\s+data\b|\binto\s+(?:out|dump)file\b|^\s*copy\b")
        .expect("constant pattern")
});

/// Deny-list scan over masked text.
pub fn find_dangerous_lexical(masked: &str) -> Option<DangerousHit> {
    if let Some(m) = LEXICAL_DENY.find(masked) {
        return scan::lookup(&m.as_str().to_ascii_lowercase());
    }
    LEXICAL_BULK.find(masked).map(|m| DangerousHit {
        name: m
            .as_str()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase(),
        category: DangerousCategory::BulkLoad,
    })
}
