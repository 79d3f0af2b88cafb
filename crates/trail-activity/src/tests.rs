//! Unit tests for scope handling, fan-out, record building and the store.

use rusqlite::Connection;
use serde_json::json;

use crate::entity::{dirty_snapshot, full_snapshot, EntityId, EntityRecord};
use crate::error::{BoxError, PersistError};
use crate::fanout::expand;
use crate::identity::{Identity, Repositories};
use crate::record::{Action, Level, LogRecord, MessageBuilder, MessageContext, ScopedLogRecord};
use crate::scope::{Scope, ScopeMember, ScopeRegistry};
use crate::store::{create_log_table, find_logs, save_atomic, ActivityFilter, TableName};

/// Creates an in-memory SQLite database with migrations applied.
fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    trail_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

fn repos() -> Repositories {
    Repositories::new()
        .with("Comments", "id")
        .with("Articles", "id")
        .with("Authors", "id")
        .with("Users", "id")
}

fn comment(id: i64) -> EntityRecord {
    EntityRecord::new("Comments")
        .with("id", id)
        .with("body", "first!")
        .with("spam_score", 0.2)
        .hidden("spam_score")
}

fn record_for(subject: &EntityRecord) -> LogRecord {
    let user = EntityRecord::new("Users").with("id", 9);
    let mut record = LogRecord::build(&repos(), Some(subject), Some(&user));
    record.action = Action::Update;
    record
}

fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .expect("should count rows")
}

// ── Identity resolution ──────────────────────────────────────────────

#[test]
fn resolve_registered_entity() {
    let identity = repos().resolve(Some(&comment(7)));
    assert_eq!(identity, Identity::new("Comments", 7));
}

#[test]
fn resolve_absent_or_unregistered_is_none() {
    let repos = repos();
    assert_eq!(repos.resolve(None), Identity::none());

    let tag = EntityRecord::new("Tags").with("id", 1);
    assert_eq!(repos.resolve(Some(&tag)), Identity::none());
}

#[test]
fn resolve_uses_alias_and_primary_key() {
    let mut repos = Repositories::new();
    repos.register("Blog.Posts", "Posts", "uuid");
    let post = EntityRecord::new("Blog.Posts")
        .with("id", 3)
        .with("uuid", "5f1c");

    let identity = repos.resolve(Some(&post));
    assert_eq!(identity.type_name.as_deref(), Some("Posts"));
    assert_eq!(identity.id, Some(EntityId::from("5f1c")));
}

#[test]
fn entity_id_emptiness() {
    assert!(EntityId::from(0).is_empty());
    assert!(EntityId::from("").is_empty());
    assert!(!EntityId::from(3).is_empty());
    assert!(!EntityId::from("0").is_empty());
    assert_eq!(EntityId::from_value(&json!(null)), None);
    assert_eq!(EntityId::from_value(&json!(1.5)), None);
}

// ── Snapshots ────────────────────────────────────────────────────────

#[test]
fn snapshots_exclude_hidden_fields() {
    let c = comment(1);
    let full = full_snapshot(Some(&c)).expect("snapshot");
    assert_eq!(full.get("body"), Some(&json!("first!")));
    assert!(!full.contains_key("spam_score"));

    let dirty = dirty_snapshot(Some(&c), &["body", "spam_score"]).expect("snapshot");
    assert_eq!(dirty.len(), 1);
    assert!(dirty.contains_key("body"));

    assert!(full_snapshot(None).is_none());
}

// ── Scope registry ───────────────────────────────────────────────────

#[test]
fn empty_declaration_defaults_to_self_type() {
    let registry = ScopeRegistry::initialize(&repos(), "Comments", &[]);
    let expected: Scope = [("Comments", None)].into_iter().collect();
    assert_eq!(registry.get(), &expected);
    assert_eq!(registry.original(), &expected);
}

#[test]
fn normalize_resolves_objects_and_last_wins() {
    let repos = repos();
    let first = EntityRecord::new("Articles").with("id", 1);
    let second = EntityRecord::new("Articles").with("id", 5);
    let members = [
        ScopeMember::from("Comments"),
        ScopeMember::from(&first),
        ScopeMember::from("Authors"),
        ScopeMember::from(&second),
    ];

    let scope = ScopeRegistry::normalize(&repos, &members);
    let entries: Vec<_> = scope.iter().collect();
    assert_eq!(
        entries,
        [
            ("Comments", None),
            ("Articles", Some(&EntityId::Int(5))),
            ("Authors", None),
        ]
    );
}

#[test]
fn normalize_ignores_unresolvable_objects() {
    let stranger = EntityRecord::new("Tags").with("id", 4);
    let scope = ScopeRegistry::normalize(&repos(), &[ScopeMember::from(&stranger)]);
    assert!(scope.is_empty());
}

#[test]
fn normalize_is_idempotent() {
    let repos = repos();
    let article = EntityRecord::new("Articles").with("id", 5);
    let author = EntityRecord::new("Authors").with("id", 3);
    let inputs: Vec<Vec<ScopeMember<'_>>> = vec![
        vec![],
        vec!["Comments".into()],
        vec!["Comments".into(), (&article).into(), (&author).into()],
        vec![(&article).into(), "Articles".into()],
    ];

    for members in inputs {
        let once = ScopeRegistry::normalize(&repos, &members);
        let twice = ScopeRegistry::normalize(&repos, &once.members());
        assert_eq!(once, twice, "normalisation should be idempotent for {members:?}");
    }
}

#[test]
fn reset_restores_initial_scope() {
    let repos = repos();
    let article = EntityRecord::new("Articles").with("id", 5);
    let mut registry =
        ScopeRegistry::initialize(&repos, "Comments", &["Comments".into(), "Authors".into()]);
    let initial = registry.get().clone();

    registry.set(&repos, &[ScopeMember::from(&article)]);
    registry.set(&repos, &["Users".into()]);
    registry.bind_issuer(&Identity::new("Users", 9));
    assert_ne!(registry.get(), &initial);

    registry.reset();
    assert_eq!(registry.get(), &initial);
}

#[test]
fn bind_issuer_only_touches_existing_keys() {
    let repos = repos();
    let mut registry =
        ScopeRegistry::initialize(&repos, "Comments", &["Comments".into(), "Users".into()]);

    assert!(registry.bind_issuer(&Identity::new("Users", 9)));
    assert_eq!(registry.get().id_of("Users"), Some(&EntityId::Int(9)));

    assert!(!registry.bind_issuer(&Identity::new("Authors", 3)));
    assert!(!registry.get().contains("Authors"));
    assert!(!registry.bind_issuer(&Identity::none()));
}

// ── Fan-out ──────────────────────────────────────────────────────────

#[test]
fn expand_substitutes_subject_id_for_self_scope() {
    let c = comment(7);
    let record = record_for(&c);
    let scope: Scope = [("Comments", Some(EntityId::Int(99)))].into_iter().collect();

    let rows = expand(&scope, &record, "Comments", Some(&record.subject()));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].scope_type, "Comments");
    assert_eq!(rows[0].scope_id, EntityId::Int(7));
}

#[test]
fn expand_keeps_order_and_shares_record() {
    let c = comment(1);
    let record = record_for(&c);
    let scope: Scope = [
        ("Comments", None),
        ("Articles", Some(EntityId::Int(5))),
        ("Authors", Some(EntityId::Int(3))),
    ]
    .into_iter()
    .collect();

    let rows = expand(&scope, &record, "Comments", Some(&record.subject()));
    let targets: Vec<_> = rows
        .iter()
        .map(|r| (r.scope_type.as_str(), r.scope_id.clone()))
        .collect();
    assert_eq!(
        targets,
        [
            ("Comments", EntityId::Int(1)),
            ("Articles", EntityId::Int(5)),
            ("Authors", EntityId::Int(3)),
        ]
    );
    assert!(rows.iter().all(|r| r.record == record));
}

#[test]
fn expand_skips_empty_and_unbound_ids() {
    let record = LogRecord::build(&repos(), None, None);
    let scope: Scope = [
        ("Comments", None),
        ("Articles", Some(EntityId::Int(0))),
        ("Authors", Some(EntityId::from(""))),
        ("Users", Some(EntityId::Int(9))),
    ]
    .into_iter()
    .collect();

    let rows = expand(&scope, &record, "Comments", None);
    assert!(rows.len() <= scope.len());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].scope_type, "Users");
}

#[test]
fn expand_without_resolvable_entries_is_empty() {
    let record = LogRecord::build(&repos(), None, None);
    assert!(expand(&Scope::new(), &record, "Comments", None).is_empty());

    let unbound: Scope = [("Comments", None)].into_iter().collect();
    assert!(expand(&unbound, &record, "Comments", None).is_empty());
}

#[test]
fn expand_does_not_substitute_foreign_subject() {
    let article = EntityRecord::new("Articles").with("id", 5);
    let record = LogRecord::build(&repos(), Some(&article), None);
    let scope: Scope = [("Comments", None), ("Articles", None)].into_iter().collect();

    let rows = expand(&scope, &record, "Comments", Some(&record.subject()));
    assert!(rows.is_empty(), "only the logger's own type is substituted");
}

// ── Record builder ───────────────────────────────────────────────────

#[test]
fn build_sets_defaults_and_identities() {
    let c = comment(1);
    let user = EntityRecord::new("Users").with("id", 9);
    let record = LogRecord::build(&repos(), Some(&c), Some(&user));

    assert_eq!(record.issuer(), Identity::new("Users", 9));
    assert_eq!(record.subject(), Identity::new("Comments", 1));
    assert_eq!(record.level, Level::Info);
    assert_eq!(record.action, Action::Custom);
    assert!(record.message.is_empty());
    assert!(record.data.is_none());
}

fn describe(record: &LogRecord, ctx: &MessageContext<'_>) -> Result<String, BoxError> {
    let subject = ctx.subject.map(|s| s.source().to_string()).unwrap_or_default();
    Ok(format!("{} {subject} ({})", record.action, record.message))
}

#[test]
fn finalize_message_uses_builder_output() {
    let c = comment(1);
    let mut record = record_for(&c);
    record.message = "literal".to_string();
    let builder: MessageBuilder = std::sync::Arc::new(describe);

    record
        .finalize_message(
            Some(&builder),
            &MessageContext {
                subject: Some(&c),
                issuer: None,
            },
        )
        .expect("builder should succeed");
    assert_eq!(record.message, "update Comments (literal)");

    record
        .finalize_message(None, &MessageContext::default())
        .expect("no builder is a no-op");
    assert_eq!(record.message, "update Comments (literal)");
}

#[test]
fn action_and_level_round_trip_as_strings() {
    for action in [Action::Create, Action::Update, Action::Delete, Action::Custom] {
        assert_eq!(action.as_str().parse::<Action>(), Ok(action));
    }
    assert_eq!(Level::from("warning"), Level::Warning);
    assert_eq!(Level::default().to_string(), "info");
    assert_eq!(Level::from("audit"), Level::Other("audit".to_string()));
    assert_eq!(String::from(Level::Other("audit".to_string())), "audit");
    assert!("".parse::<Action>().is_err());
}

// ── Store ────────────────────────────────────────────────────────────

fn three_rows() -> Vec<ScopedLogRecord> {
    let c = comment(1);
    let mut record = record_for(&c);
    record.data = full_snapshot(Some(&c));
    let scope: Scope = [
        ("Comments", None),
        ("Articles", Some(EntityId::Int(5))),
        ("Authors", Some(EntityId::Int(3))),
    ]
    .into_iter()
    .collect();
    expand(&scope, &record, "Comments", Some(&record.subject()))
}

const REJECT_AUTHORS: &str = "CREATE TRIGGER reject_authors BEFORE INSERT ON activity_logs
    WHEN NEW.scope_type = 'Authors'
    BEGIN SELECT RAISE(ABORT, 'authors rejected'); END;";

#[test]
fn save_atomic_returns_persisted_rows() {
    let conn = test_db();
    let rows = three_rows();

    let saved = save_atomic(&conn, &TableName::default(), &rows).expect("save should succeed");
    assert_eq!(saved.len(), 3);
    assert!(saved.windows(2).all(|w| w[0].id < w[1].id));
    assert!(saved.iter().all(|r| !r.created_at.is_empty()));
    assert_eq!(saved[1].scope_type, "Articles");
    assert_eq!(saved[1].issuer_id, Some(EntityId::Int(9)));
    assert_eq!(count_rows(&conn, "activity_logs"), 3);
}

#[test]
fn save_atomic_with_no_rows_writes_nothing() {
    let conn = test_db();
    let saved = save_atomic(&conn, &TableName::default(), &[]).expect("empty batch");
    assert!(saved.is_empty());
    assert_eq!(count_rows(&conn, "activity_logs"), 0);
}

#[test]
fn failed_row_rolls_back_whole_batch() {
    let conn = test_db();
    conn.execute_batch(REJECT_AUTHORS).expect("should create trigger");

    let result = save_atomic(&conn, &TableName::default(), &three_rows());
    assert!(matches!(result, Err(PersistError::Database(_))));
    assert_eq!(count_rows(&conn, "activity_logs"), 0, "no partial batch");
    assert!(conn.is_autocommit(), "savepoint should be released");
}

#[test]
fn failed_commit_rolls_back_whole_batch() {
    let conn = test_db();
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE articles (id INTEGER PRIMARY KEY);
         CREATE TABLE checked_logs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             issuer_type TEXT,
             issuer_id,
             subject_type TEXT,
             subject_id,
             scope_type TEXT NOT NULL,
             scope_id NOT NULL
                 REFERENCES articles (id) DEFERRABLE INITIALLY DEFERRED,
             action TEXT NOT NULL,
             level TEXT NOT NULL DEFAULT 'info',
             message TEXT NOT NULL DEFAULT '',
             data TEXT,
             created_at TEXT NOT NULL DEFAULT (datetime('now'))
         );",
    )
    .expect("should create checked table");
    let table = TableName::new("checked_logs").expect("valid name");

    // Inserts succeed; the deferred check fails when the savepoint commits.
    let result = save_atomic(&conn, &table, &three_rows());
    assert!(matches!(result, Err(PersistError::Database(_))));
    assert!(conn.is_autocommit(), "no transaction should be left open");
    assert_eq!(count_rows(&conn, "checked_logs"), 0, "no partial batch");

    conn.execute_batch("INSERT INTO articles (id) VALUES (1), (3), (5)")
        .expect("should insert articles");
    let saved = save_atomic(&conn, &table, &three_rows()).expect("save should succeed");
    assert_eq!(saved.len(), 3);
    assert_eq!(count_rows(&conn, "checked_logs"), 3);
}

#[test]
fn failed_batch_leaves_outer_transaction_usable() {
    let mut conn = test_db();
    conn.execute_batch(&format!(
        "CREATE TABLE comments (id INTEGER PRIMARY KEY, body TEXT NOT NULL); {REJECT_AUTHORS}"
    ))
    .expect("should create schema");

    let tx = conn.transaction().expect("should open transaction");
    tx.execute("INSERT INTO comments (id, body) VALUES (1, 'first!')", [])
        .expect("should insert comment");
    let result = save_atomic(&tx, &TableName::default(), &three_rows());
    assert!(result.is_err());
    tx.commit().expect("outer transaction should still commit");

    assert_eq!(count_rows(&conn, "comments"), 1);
    assert_eq!(count_rows(&conn, "activity_logs"), 0);
}

#[test]
fn batch_rolls_back_with_outer_transaction() {
    let mut conn = test_db();
    let tx = conn.transaction().expect("should open transaction");
    save_atomic(&tx, &TableName::default(), &three_rows()).expect("save should succeed");
    assert_eq!(count_rows(&tx, "activity_logs"), 3);
    tx.rollback().expect("rollback");

    assert_eq!(count_rows(&conn, "activity_logs"), 0);
}

#[test]
fn save_to_missing_table_returns_database_error() {
    let conn = Connection::open_in_memory().expect("open db");
    let result = save_atomic(&conn, &TableName::default(), &three_rows());
    assert!(matches!(result, Err(PersistError::Database(_))));
}

#[test]
fn find_logs_filters_and_orders_newest_first() {
    let conn = test_db();
    let table = TableName::default();
    save_atomic(&conn, &table, &three_rows()).expect("first batch");
    save_atomic(&conn, &table, &three_rows()).expect("second batch");

    let all = find_logs(&conn, &table, &ActivityFilter::default()).expect("query");
    assert_eq!(all.len(), 6);
    assert!(all.windows(2).all(|w| w[0].id > w[1].id));

    let filter = ActivityFilter {
        scope_type: Some("Articles".to_string()),
        scope_id: Some(EntityId::Int(5)),
        ..Default::default()
    };
    let articles = find_logs(&conn, &table, &filter).expect("query");
    assert_eq!(articles.len(), 2);
    assert!(articles.iter().all(|r| r.scope_type == "Articles"));

    let limited = ActivityFilter {
        action: Some(Action::Update),
        level: Some(Level::Info),
        limit: Some(1),
        ..Default::default()
    };
    let latest = find_logs(&conn, &table, &limited).expect("query");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, all[0].id);

    let none = ActivityFilter {
        scope_id: Some(EntityId::from("5")),
        ..Default::default()
    };
    assert!(find_logs(&conn, &table, &none).expect("query").is_empty());
}

#[test]
fn find_logs_keeps_unknown_levels() {
    let conn = test_db();
    conn.execute(
        "INSERT INTO activity_logs (scope_type, scope_id, action, level)
         VALUES ('Articles', 5, 'custom', 'audit')",
        [],
    )
    .expect("should insert foreign row");

    let filter = ActivityFilter {
        level: Some(Level::Other("audit".to_string())),
        ..Default::default()
    };
    let rows = find_logs(&conn, &TableName::default(), &filter).expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].level.as_str(), "audit");
}

#[test]
fn find_logs_decodes_payload() {
    let conn = test_db();
    let table = TableName::default();
    save_atomic(&conn, &table, &three_rows()).expect("save");

    let rows = find_logs(&conn, &table, &ActivityFilter::default()).expect("query");
    let data = rows[0].data.as_ref().expect("payload should be stored");
    assert_eq!(data.get("body"), Some(&json!("first!")));
    assert!(!data.contains_key("spam_score"));
}

#[test]
fn custom_table_target() {
    let conn = Connection::open_in_memory().expect("open db");
    let table = TableName::new("audit_trail").expect("valid name");
    create_log_table(&conn, &table).expect("should create table");

    save_atomic(&conn, &table, &three_rows()).expect("save");
    assert_eq!(count_rows(&conn, "audit_trail"), 3);
}

#[test]
fn table_name_validation() {
    assert!(TableName::new("activity_logs").is_ok());
    assert!(TableName::new("_logs2").is_ok());
    assert!(TableName::new("").is_err());
    assert!(TableName::new("2logs").is_err());
    assert!(TableName::new("logs; DROP TABLE users").is_err());
    assert_eq!(TableName::default().as_str(), "activity_logs");
}

// ── Configuration ────────────────────────────────────────────────────

#[test]
fn default_config_uses_default_table_and_self_scope() {
    let config = crate::config::Config::default();
    assert_eq!(config.logging.level, "info");
    assert!(!config.logging.json);

    let settings = config.logger_settings("Comments").expect("settings");
    assert_eq!(settings.log_table, TableName::default());
    assert!(settings.scope.is_empty());
}

#[test]
fn per_logger_entries_override_shared_defaults() {
    let config: crate::config::Config = toml::from_str(
        r#"
        [database]
        path = "/var/lib/trail/trail.db"
        busy_timeout_ms = 250

        [logger]
        log_table = "activity_logs"

        [loggers.Comments]
        scope = ["Comments", "Articles", "Authors"]

        [loggers.Payments]
        log_table = "payment_audit"
        "#,
    )
    .expect("config should parse");

    assert_eq!(config.database.runtime_settings().busy_timeout_ms, 250);
    assert_eq!(config.database.pool_max_size, 8);

    let comments = config.logger_settings("Comments").expect("settings");
    assert_eq!(comments.scope, ["Comments", "Articles", "Authors"]);
    assert_eq!(comments.log_table.as_str(), "activity_logs");

    let payments = config.logger_settings("Payments").expect("settings");
    assert_eq!(payments.log_table.as_str(), "payment_audit");
    assert!(payments.scope.is_empty());
}

#[test]
fn invalid_configured_table_is_rejected() {
    let config: crate::config::Config = toml::from_str(
        r#"
        [loggers.Comments]
        log_table = "logs-2024"
        "#,
    )
    .expect("config should parse");

    assert!(matches!(
        config.logger_settings("Comments"),
        Err(crate::config::ConfigError::TableName(_))
    ));
}

#[test]
fn load_config_reads_file_and_tolerates_missing_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("trail.toml");
    std::fs::write(&path, "[loggers.Articles]\nscope = [\"Articles\"]\n").expect("write config");

    let config = crate::config::load_config(path.to_str()).expect("config should load");
    assert!(config.loggers.contains_key("Articles"));

    let missing = dir.path().join("absent.toml");
    let config = crate::config::load_config(missing.to_str()).expect("defaults");
    assert!(config.loggers.is_empty());
}
