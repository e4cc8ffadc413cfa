use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ledger<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ledger"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ledger binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ledger(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ledger command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn run_failure<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ledger(args);
    assert_eq!(
        output.status.code(),
        Some(2),
        "expected reconciliation failure exit code, stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    parse_stdout(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_source(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write source {}: {err}", path.display()));
    path
}

fn sequences(value: &Value, key: &str) -> Vec<i64> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
        .iter()
        .map(|item| item.as_i64().unwrap_or_else(|| panic!("non-integer sequence in {value}")))
        .collect()
}

// Test IDs: TCLI-001
#[test]
fn apply_then_reapply_is_idempotent() {
    let sandbox = unique_temp_dir("schemaledger-cli-apply");
    let db = sandbox.join("ledger.sqlite3");
    let source = write_source(
        &sandbox,
        "schema.sql",
        &["CREATE TABLE t(id INT)", "", "INSERT INTO t VALUES (1)"],
    );

    let first = run_json(["--db", path_str(&db), "apply", "--source", path_str(&source)]);
    validate_schema("apply_result.schema.json", &first);
    assert_eq!(as_str(&first, "status"), "applied");
    assert_eq!(as_i64(&first, "statements_seen"), 2);
    assert_eq!(sequences(&first, "applied"), vec![1, 2]);

    let second = run_json(["--db", path_str(&db), "apply", "--source", path_str(&source)]);
    validate_schema("apply_result.schema.json", &second);
    assert_eq!(as_i64(&second, "skipped"), 2);
    assert!(sequences(&second, "applied").is_empty());
    assert_ne!(as_str(&first, "run_id"), as_str(&second, "run_id"));

    let log = run_json(["--db", path_str(&db), "log"]);
    validate_schema("log_result.schema.json", &log);
    assert_eq!(as_i64(&log, "count"), 2);
    assert!(as_bool(&log, "contiguous"));
}

// Test IDs: TCLI-002
#[test]
fn status_and_dry_run_list_pending_statements_without_applying() {
    let sandbox = unique_temp_dir("schemaledger-cli-status");
    let db = sandbox.join("ledger.sqlite3");
    let initial = write_source(&sandbox, "v1.sql", &["CREATE TABLE a (id INT)"]);
    let extended =
        write_source(&sandbox, "v2.sql", &["CREATE TABLE a (id INT)", "CREATE TABLE b (id INT)"]);
    run_json(["--db", path_str(&db), "apply", "--source", path_str(&initial)]);

    let status = run_json(["--db", path_str(&db), "status", "--source", path_str(&extended)]);
    validate_schema("plan_result.schema.json", &status);
    assert_eq!(as_str(&status, "status"), "planned");
    assert_eq!(as_i64(&status, "already_applied"), 1);
    assert!(!as_bool(&status, "up_to_date"));
    let pending = status
        .get("pending")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing pending list: {status}"));
    assert_eq!(pending.len(), 1);
    assert_eq!(as_i64(&pending[0], "sequence"), 2);
    assert_eq!(as_str(&pending[0], "text"), "CREATE TABLE b (id INT)");

    let dry_run =
        run_json(["--db", path_str(&db), "apply", "--dry-run", "--source", path_str(&extended)]);
    validate_schema("plan_result.schema.json", &dry_run);
    assert_eq!(dry_run.get("pending"), status.get("pending"));

    let log = run_json(["--db", path_str(&db), "log"]);
    assert_eq!(as_i64(&log, "count"), 1);
}

// Test IDs: TCLI-003
#[test]
fn divergence_exits_with_code_two_and_names_both_texts() {
    let sandbox = unique_temp_dir("schemaledger-cli-divergence");
    let db = sandbox.join("ledger.sqlite3");
    let original = write_source(&sandbox, "a.sql", &["CREATE TABLE a (id INT)"]);
    let edited = write_source(&sandbox, "b.sql", &["CREATE TABLE b (id INT)"]);
    run_json(["--db", path_str(&db), "apply", "--source", path_str(&original)]);
    let log_before = run_json(["--db", path_str(&db), "log"]);

    let failure = run_failure(["--db", path_str(&db), "apply", "--source", path_str(&edited)]);
    validate_schema("failure.schema.json", &failure);
    let error = failure.get("error").unwrap_or_else(|| panic!("missing error: {failure}"));
    assert_eq!(as_str(error, "kind"), "divergence");
    assert_eq!(as_i64(error, "sequence"), 1);
    assert_eq!(as_str(error, "stored"), "CREATE TABLE a (id INT)");
    assert_eq!(as_str(error, "incoming"), "CREATE TABLE b (id INT)");
    assert!(as_bool(error, "manual_intervention"));
    assert!(!as_bool(error, "retryable"));

    let log_after = run_json(["--db", path_str(&db), "log"]);
    assert_eq!(as_str(&log_before, "fingerprint"), as_str(&log_after, "fingerprint"));
}

// Test IDs: TCLI-004
#[test]
fn failing_statement_is_reported_as_retryable_and_left_out_of_the_log() {
    let sandbox = unique_temp_dir("schemaledger-cli-apply-error");
    let db = sandbox.join("ledger.sqlite3");
    let source = write_source(
        &sandbox,
        "schema.sql",
        &["CREATE TABLE a (id INT)", "CREATE TABLE broken (", "CREATE TABLE c (id INT)"],
    );

    let failure = run_failure(["--db", path_str(&db), "apply", "--source", path_str(&source)]);
    validate_schema("failure.schema.json", &failure);
    let error = failure.get("error").unwrap_or_else(|| panic!("missing error: {failure}"));
    assert_eq!(as_str(error, "kind"), "apply");
    assert_eq!(as_i64(error, "sequence"), 2);
    assert_eq!(as_str(error, "incoming"), "CREATE TABLE broken (");
    assert!(as_bool(error, "retryable"));

    let log = run_json(["--db", path_str(&db), "log"]);
    assert_eq!(as_i64(&log, "count"), 1);

    let fixed = write_source(
        &sandbox,
        "schema.sql",
        &["CREATE TABLE a (id INT)", "CREATE TABLE broken (id INT)", "CREATE TABLE c (id INT)"],
    );
    let retried = run_json(["--db", path_str(&db), "apply", "--source", path_str(&fixed)]);
    assert_eq!(sequences(&retried, "applied"), vec![2, 3]);
}

// Test IDs: TCLI-005
#[test]
fn config_file_supplies_defaults_and_flags_override_it() {
    let sandbox = unique_temp_dir("schemaledger-cli-config");
    let db = sandbox.join("from-config.sqlite3");
    let config = sandbox.join("ledger.yaml");
    fs::write(&config, format!("db: {}\ntable: config_log\nlog_level: warn\n", path_str(&db)))
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let source = write_source(&sandbox, "schema.sql", &["CREATE TABLE a (id INT)"]);

    run_json(["--config", path_str(&config), "apply", "--source", path_str(&source)]);
    let from_config = run_json(["--config", path_str(&config), "log"]);
    assert_eq!(as_str(&from_config, "table"), "config_log");
    assert_eq!(as_i64(&from_config, "count"), 1);

    let overridden = run_json(["--config", path_str(&config), "--table", "other_log", "log"]);
    assert_eq!(as_str(&overridden, "table"), "other_log");
    assert_eq!(as_i64(&overridden, "count"), 0);
}

// Test IDs: TCLI-006
#[test]
fn source_can_be_read_from_stdin() {
    let sandbox = unique_temp_dir("schemaledger-cli-stdin");
    let db = sandbox.join("ledger.sqlite3");

    let mut child = Command::new(env!("CARGO_BIN_EXE_ledger"))
        .args(["--db", path_str(&db), "apply", "--source", "-"])
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to spawn ledger binary: {err}"));
    {
        let Some(stdin) = child.stdin.as_mut() else {
            panic!("child stdin should be piped");
        };
        stdin
            .write_all(b"CREATE TABLE a (id INT)\r\nCREATE TABLE b (id INT)\r\n")
            .unwrap_or_else(|err| panic!("failed to write stdin: {err}"));
    }
    drop(child.stdin.take());
    let output =
        child.wait_with_output().unwrap_or_else(|err| panic!("failed to wait for ledger: {err}"));

    assert!(output.status.success(), "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    let report = parse_stdout(&output);
    assert_eq!(sequences(&report, "applied"), vec![1, 2]);

    let log = run_json(["--db", path_str(&db), "log"]);
    let texts = log
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing entries: {log}"))
        .iter()
        .map(|entry| as_str(entry, "text").to_string())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["CREATE TABLE a (id INT)", "CREATE TABLE b (id INT)"]);
}

// Test IDs: TCLI-007
#[test]
fn operational_errors_exit_with_code_one() {
    let sandbox = unique_temp_dir("schemaledger-cli-operational");
    let db = sandbox.join("ledger.sqlite3");

    let missing_source = run_ledger([
        "--db",
        path_str(&db),
        "apply",
        "--source",
        path_str(&sandbox.join("missing.sql")),
    ]);
    assert_eq!(missing_source.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&missing_source.stderr).contains("missing.sql"));

    let bad_table = run_ledger(["--db", path_str(&db), "--table", "log; DROP TABLE x", "log"]);
    assert_eq!(bad_table.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&bad_table.stderr).contains("invalid log table name"));
    assert!(!db.exists());
}

// Test IDs: TCLI-008
#[test]
fn log_of_missing_database_is_empty_and_creates_nothing() {
    let sandbox = unique_temp_dir("schemaledger-cli-log-missing");
    let db = sandbox.join("never-created.sqlite3");

    let log = run_json(["--db", path_str(&db), "log"]);
    validate_schema("log_result.schema.json", &log);
    assert_eq!(as_i64(&log, "count"), 0);
    assert!(as_bool(&log, "contiguous"));
    assert!(!db.exists());

    run_json([
        "--db",
        path_str(&db),
        "apply",
        "--source",
        path_str(&write_source(&sandbox, "schema.sql", &["CREATE TABLE a (id INT)"])),
    ]);
    let log = run_json(["--db", path_str(&db), "log"]);
    assert_eq!(as_i64(&log, "count"), 1);
}
