use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

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

fn run_regsync<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_regsync"))
        .args(args)
        .env_remove("REGSYNC_QUEUE")
        .env_remove("REGSYNC_NATIONALITY")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute regsync binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_regsync(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "regsync command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
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

fn as_array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_records(path: &Path, records: &[Value]) {
    let body = records.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write records {}: {err}", path.display()));
}

fn first_cycle_records() -> Vec<Value> {
    vec![
        serde_json::json!({
            "entity_id": "2023/1",
            "name": "ADAMS",
            "date_of_birth": "1990/01/01",
            "nationalities": [{ "nationality": "FR" }]
        }),
        serde_json::json!({
            "entity_id": "2023/2",
            "name": "BAKER",
            "nationalities": [{ "nationality": "US" }]
        }),
    ]
}

fn second_cycle_records() -> Vec<Value> {
    vec![serde_json::json!({
        "entity_id": "2023/1",
        "name": "ADAMS",
        "date_of_birth": "1990/01/02",
        "nationalities": [{ "nationality": "FR" }, { "nationality": "BE" }]
    })]
}

// Test IDs: TCLI-001
#[test]
fn db_admin_commands_report_schema_and_integrity() {
    let dir = unique_temp_dir("regsync-cli-db");
    let db = dir.join("registry.sqlite3");
    let db_str = path_str(&db);

    let status = run_json(["--db", db_str, "db", "schema-version"]);
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(as_i64(&status, "target_version"), 2);

    let plan = run_json(["--db", db_str, "db", "migrate", "--dry-run"]);
    assert_eq!(as_array(&plan, "would_apply_versions").len(), 2);

    let applied = run_json(["--db", db_str, "db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 2);
    assert_eq!(applied.get("up_to_date").and_then(Value::as_bool), Some(true));

    let report = run_json(["--db", db_str, "db", "integrity-check"]);
    assert_eq!(report.get("quick_check_ok").and_then(Value::as_bool), Some(true));
    assert!(as_array(&report, "foreign_key_violations").is_empty());

    let backup = dir.join("backup.sqlite3");
    let backed_up = run_json(["--db", db_str, "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(as_str(&backed_up, "status"), "ok");
    assert!(backup.exists());

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn produce_consume_cycle_syncs_changes_and_vanished_entities() {
    let dir = unique_temp_dir("regsync-cli-sync");
    let db = dir.join("registry.sqlite3");
    let db_str = path_str(&db);
    let records = dir.join("records.ndjson");
    let records_str = path_str(&records);

    write_records(&records, &first_cycle_records());
    let first = run_json(["--db", db_str, "produce", "--once", "--source-file", records_str]);
    assert_eq!(as_i64(&first, "unseen"), 2);
    assert_eq!(as_i64(&first, "published"), 2);
    assert_eq!(as_i64(&first, "vanished"), 0);

    let queued = run_json(["--db", db_str, "queue", "status"]);
    let depth = queued.get("depth").unwrap_or_else(|| panic!("missing depth: {queued}"));
    assert_eq!(as_i64(depth, "new"), 2);
    assert_eq!(as_i64(depth, "changed"), 0);

    let drained = run_json(["--db", db_str, "consume", "--once", "--idle-timeout-ms", "200"]);
    assert_eq!(as_i64(&drained, "received"), 2);
    assert_eq!(as_i64(&drained, "inserted"), 2);

    let listing = run_json(["--db", db_str, "entity", "list"]);
    assert_eq!(as_i64(&listing, "total"), 2);
    let names: Vec<&str> =
        as_array(&listing, "entities").iter().map(|entity| as_str(entity, "name")).collect();
    assert_eq!(names, vec!["ADAMS", "BAKER"]);

    let adams = run_json(["--db", db_str, "entity", "show", "2023/1"]);
    assert_eq!(as_array(&adams, "nationalities").len(), 1);
    assert_eq!(as_array(&adams, "log").len(), 2);
    assert!(as_array(&adams, "change_log").is_empty());

    write_records(&records, &second_cycle_records());
    let second = run_json(["--db", db_str, "produce", "--once", "--source-file", records_str]);
    assert_eq!(as_i64(&second, "changed"), 1);
    assert_eq!(as_i64(&second, "vanished"), 1);

    let drained = run_json(["--db", db_str, "consume", "--once", "--idle-timeout-ms", "200"]);
    assert_eq!(as_i64(&drained, "updated"), 1);

    let adams = run_json(["--db", db_str, "entity", "show", "2023/1"]);
    assert_eq!(as_array(&adams, "nationalities").len(), 2);
    let change_log = as_array(&adams, "change_log");
    assert_eq!(change_log.len(), 1);
    assert_eq!(as_str(&change_log[0], "field_name"), "date_of_birth");
    assert_eq!(as_str(&change_log[0], "new_value"), "1990-01-02");
    assert_eq!(as_array(&adams, "log").len(), 3);

    let baker = run_json(["--db", db_str, "entity", "show", "2023/2"]);
    let fields = baker.get("fields").unwrap_or_else(|| panic!("missing fields: {baker}"));
    assert_eq!(fields.get("is_active").and_then(Value::as_bool), Some(false));
    assert_eq!(as_array(&baker, "change_log").len(), 1);
    assert_eq!(as_array(&baker, "log").len(), 2);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn classify_prints_deltas_without_publishing() {
    let dir = unique_temp_dir("regsync-cli-classify");
    let db = dir.join("registry.sqlite3");
    let db_str = path_str(&db);
    let records = dir.join("records.ndjson");
    let records_str = path_str(&records);

    write_records(&records, &first_cycle_records());
    run_json(["--db", db_str, "produce", "--once", "--source-file", records_str]);
    run_json(["--db", db_str, "consume", "--once", "--idle-timeout-ms", "200"]);

    let mut next = second_cycle_records();
    next.push(serde_json::json!({ "entity_id": "2023/3", "date_of_birth": "last tuesday" }));
    write_records(&records, &next);

    let classified = run_json(["--db", db_str, "classify", "--file", records_str]);
    let deltas = as_array(&classified, "deltas");
    assert_eq!(deltas.len(), 2);
    let first = deltas[0].get("delta").unwrap_or_else(|| panic!("missing delta: {classified}"));
    assert_eq!(as_str(first, "kind"), "changed");
    assert!(deltas[1].get("error").is_some());

    let queued = run_json(["--db", db_str, "queue", "status"]);
    let depth = queued.get("depth").unwrap_or_else(|| panic!("missing depth: {queued}"));
    assert_eq!(as_i64(depth, "new") + as_i64(depth, "changed"), 0);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn unknown_entity_is_reported_as_an_error() {
    let dir = unique_temp_dir("regsync-cli-missing");
    let db = dir.join("registry.sqlite3");

    let output = run_regsync(["--db", path_str(&db), "entity", "show", "2023/404"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}
