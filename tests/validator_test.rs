//! Integration tests for SQL request validation.
//!
//! These tests cover tier policy, tier-independent dangerous routine
//! rejection, stacked statements, fail-fast index reporting and the keyword
//! fallback used when the parser rejects the text.

use guarded_sql_mcp::validator::{SecurityTierConfig, SqlDialect, StatementKind, validate};

const ALL_DIALECTS: [SqlDialect; 5] = [
    SqlDialect::PostgreSql,
    SqlDialect::MySql,
    SqlDialect::Sqlite,
    SqlDialect::MsSql,
    SqlDialect::Generic,
];

fn writes_only() -> SecurityTierConfig {
    SecurityTierConfig {
        read_only: false,
        allow_destructive: false,
        allow_schema_changes: false,
    }
}

fn all_configs() -> Vec<SecurityTierConfig> {
    vec![
        SecurityTierConfig::read_only(),
        writes_only(),
        SecurityTierConfig {
            read_only: false,
            allow_destructive: true,
            allow_schema_changes: false,
        },
        SecurityTierConfig {
            read_only: false,
            allow_destructive: false,
            allow_schema_changes: true,
        },
        SecurityTierConfig::unrestricted(),
    ]
}

/// Read-only mode allows a plain SELECT.
#[test]
fn test_read_only_allows_select() {
    let verdict = validate(
        "SELECT * FROM Users",
        &SecurityTierConfig::read_only(),
        SqlDialect::MsSql,
    );
    assert!(verdict.allowed);
    assert_eq!(verdict.statement_kind, StatementKind::ReadOnly);
    assert!(!verdict.security_violation);
    assert!(!verdict.used_fallback);
}

/// Read-only mode rejects DELETE and names the toggle that would allow it.
#[test]
fn test_read_only_rejects_delete_with_toggle_hint() {
    let verdict = validate(
        "DELETE FROM Users",
        &SecurityTierConfig::read_only(),
        SqlDialect::MsSql,
    );
    assert!(!verdict.allowed);
    assert_eq!(verdict.statement_kind, StatementKind::Destructive);
    assert!(!verdict.security_violation);

    let reason = verdict.reason.unwrap();
    assert!(reason.contains("read-only mode"), "reason: {}", reason);
    assert!(reason.contains("read_only=false"), "reason: {}", reason);
}

/// With read-only off, INSERT still needs allow_destructive.
#[test]
fn test_insert_needs_destructive_flag() {
    let verdict = validate("INSERT INTO T VALUES(1)", &writes_only(), SqlDialect::MsSql);
    assert!(!verdict.allowed);
    assert_eq!(verdict.statement_kind, StatementKind::Destructive);
    assert!(verdict.reason.unwrap().contains("allow_destructive"));

    let allowed = validate(
        "INSERT INTO T VALUES(1)",
        &SecurityTierConfig {
            allow_destructive: true,
            ..writes_only()
        },
        SqlDialect::MsSql,
    );
    assert!(allowed.allowed);
}

#[test]
fn test_schema_change_needs_schema_flag() {
    let verdict = validate("CREATE TABLE t (id INT)", &writes_only(), SqlDialect::PostgreSql);
    assert!(!verdict.allowed);
    assert_eq!(verdict.statement_kind, StatementKind::SchemaChange);
    assert!(verdict.reason.unwrap().contains("allow_schema_changes"));
}

/// Queries that write through a CTE or create a table are not reads.
#[test]
fn test_read_only_rejects_writing_queries() {
    let cases = [
        (
            "WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d",
            StatementKind::Destructive,
        ),
        (
            "WITH u AS (UPDATE users SET admin = true RETURNING id) SELECT id FROM u",
            StatementKind::Destructive,
        ),
        (
            "WITH i AS (INSERT INTO audit VALUES (1) RETURNING *) SELECT * FROM i",
            StatementKind::Destructive,
        ),
        ("SELECT * INTO users_copy FROM users", StatementKind::SchemaChange),
        ("SELECT * FROM users WHERE id = 1 FOR UPDATE", StatementKind::Destructive),
    ];
    for (sql, kind) in cases {
        let verdict = validate(sql, &SecurityTierConfig::read_only(), SqlDialect::PostgreSql);
        assert!(!verdict.allowed, "{}", sql);
        assert!(!verdict.used_fallback, "{}", sql);
        assert_eq!(verdict.statement_kind, kind, "{}", sql);
        assert_eq!(verdict.statement_index, Some(1), "{}", sql);
    }

    // The same statements pass once their tier is enabled
    let verdict = validate(
        "WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d",
        &SecurityTierConfig {
            allow_destructive: true,
            ..writes_only()
        },
        SqlDialect::PostgreSql,
    );
    assert!(verdict.allowed);
}

/// A DROP stacked after a SELECT is rejected at position 2 under every config.
#[test]
fn test_stacked_drop_rejected_at_second_statement() {
    for tiers in all_configs() {
        for dialect in ALL_DIALECTS {
            let verdict = validate("SELECT * FROM Users; DROP TABLE Users;", &tiers, dialect);
            assert!(!verdict.allowed, "{:?} {:?}", tiers, dialect);
            assert_eq!(verdict.statement_index, Some(2), "{:?} {:?}", tiers, dialect);
            assert_eq!(verdict.total_statements, Some(2), "{:?} {:?}", tiers, dialect);
            assert_eq!(verdict.statement_kind, StatementKind::SchemaChange);
        }
    }
}

/// Shell execution is a security violation whatever the tiers or dialect.
#[test]
fn test_xp_cmdshell_always_rejected() {
    for tiers in all_configs() {
        for dialect in ALL_DIALECTS {
            let verdict = validate("EXEC xp_cmdshell('dir')", &tiers, dialect);
            assert!(!verdict.allowed, "{:?} {:?}", tiers, dialect);
            assert!(verdict.security_violation, "{:?} {:?}", tiers, dialect);
            assert_eq!(verdict.statement_index, Some(1));
        }
    }
}

#[test]
fn test_dangerous_functions_in_expressions() {
    let cases = [
        ("SELECT pg_read_file('/etc/passwd')", SqlDialect::PostgreSql),
        ("SELECT LOAD_FILE('/etc/passwd')", SqlDialect::MySql),
        ("SELECT * FROM OPENROWSET('SQLNCLI', 'Server=x;', 'SELECT 1')", SqlDialect::MsSql),
        ("SELECT id FROM t WHERE name = (SELECT pg_ls_dir('.'))", SqlDialect::PostgreSql),
    ];
    for (sql, dialect) in cases {
        let verdict = validate(sql, &SecurityTierConfig::unrestricted(), dialect);
        assert!(!verdict.allowed, "{}", sql);
        assert!(verdict.security_violation, "{}", sql);
    }
}

/// The first failing statement is reported; later ones are never evaluated.
#[test]
fn test_fail_fast_reports_first_failure() {
    // Statement 3 would be a security violation if it were reached
    let verdict = validate(
        "SELECT 1; DELETE FROM t; SELECT pg_read_file('x')",
        &SecurityTierConfig::read_only(),
        SqlDialect::PostgreSql,
    );
    assert!(!verdict.allowed);
    assert_eq!(verdict.statement_index, Some(2));
    assert_eq!(verdict.total_statements, Some(3));
    assert!(!verdict.security_violation);
}

#[test]
fn test_injection_patterns_in_literals() {
    let cases = [
        "SELECT * FROM users WHERE name = 'x'' OR ''1''=''1'",
        "SELECT * FROM users WHERE name = 'a UNION SELECT password FROM admins'",
        "SELECT * FROM users WHERE name = 'admin''--'",
        "SELECT * FROM users WHERE note = 'see information_schema.tables'",
    ];
    for sql in cases {
        let verdict = validate(sql, &SecurityTierConfig::read_only(), SqlDialect::PostgreSql);
        assert!(!verdict.allowed, "{}", sql);
        assert!(verdict.security_violation, "{}", sql);
    }

    let clean = validate(
        "SELECT * FROM users WHERE name = 'O''Brien'",
        &SecurityTierConfig::read_only(),
        SqlDialect::PostgreSql,
    );
    assert!(clean.allowed);
}

/// Unparseable text goes through keyword heuristics and is flagged.
#[test]
fn test_fallback_mode() {
    let tiers = SecurityTierConfig::read_only();

    let read = validate("SELECT a FROM t WHERE ((", &tiers, SqlDialect::PostgreSql);
    assert!(read.allowed);
    assert!(read.used_fallback);
    assert_eq!(read.statement_kind, StatementKind::ReadOnly);

    let write = validate("DELETE FROM t WHERE ((", &tiers, SqlDialect::PostgreSql);
    assert!(!write.allowed);
    assert!(write.used_fallback);
    assert_eq!(write.statement_kind, StatementKind::Destructive);
}

/// Statement separators are still honoured in fallback mode.
#[test]
fn test_fallback_catches_smuggled_statement() {
    let verdict = validate(
        "SELECT a FROM t WHERE ((; DROP TABLE t",
        &SecurityTierConfig::unrestricted(),
        SqlDialect::PostgreSql,
    );
    assert!(!verdict.allowed);
    assert!(verdict.used_fallback);
    assert_eq!(verdict.statement_index, Some(2));
    assert_eq!(verdict.total_statements, Some(2));
}

#[test]
fn test_validation_is_deterministic() {
    let inputs = [
        "SELECT * FROM Users",
        "DELETE FROM Users",
        "SELECT * FROM Users; DROP TABLE Users;",
        "EXEC xp_cmdshell('dir')",
        "SELECT a FROM t WHERE ((",
        "",
    ];
    for tiers in all_configs() {
        for sql in inputs {
            let first = validate(sql, &tiers, SqlDialect::MsSql);
            let second = validate(sql, &tiers, SqlDialect::MsSql);
            assert_eq!(first, second, "{}", sql);
        }
    }
}

#[test]
fn test_verdict_serialization() {
    let verdict = validate("DROP TABLE t", &SecurityTierConfig::read_only(), SqlDialect::Sqlite);
    let json = serde_json::to_value(&verdict).unwrap();
    assert_eq!(json["allowed"], false);
    assert_eq!(json["statement_kind"], "schema_change");
    assert_eq!(json["statement_index"], 1);
    assert_eq!(json["security_violation"], false);
}
