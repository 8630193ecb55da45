use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use impact_tracker_core::{Principal, PrincipalId, Role};
use impact_tracker_store_sqlite::TrackerStore;
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

fn unique_temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("impact-tracker-cli-{}.sqlite3", Ulid::new()))
}

fn run_impact<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_impact"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute impact binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_impact(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "impact command failed (status={}):\nstdout:\n{stdout}\nstderr:\n{stderr}",
            output.status
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn data(value: &Value) -> &Value {
    value.get("data").unwrap_or_else(|| panic!("missing data field in payload: {value}"))
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn seed_admin(db_path: &Path) -> PrincipalId {
    let mut store = match TrackerStore::open(db_path) {
        Ok(store) => store,
        Err(err) => panic!("failed to open store: {err:?}"),
    };
    if let Err(err) = store.migrate() {
        panic!("failed to migrate store: {err:?}");
    }
    let now = OffsetDateTime::now_utc();
    let principal = Principal {
        id: PrincipalId::new(),
        email: format!("admin-{}@example.org", Ulid::new()),
        name: "Admin".to_string(),
        role: Role::Admin,
        created_at: now,
        updated_at: now,
        relationship_updated_at: None,
        relationship_updated_by_id: None,
        archived_at: None,
    };
    if let Err(err) = store.insert_principal(&principal) {
        panic!("failed to seed admin: {err:?}");
    }
    principal.id
}

#[test]
fn db_commands_report_and_apply_migrations() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();

    let status = run_json(["--db", db_arg.as_str(), "db", "schema-version"]);
    assert_eq!(data(&status).get("current_version").and_then(Value::as_i64), Some(0));

    let migrated = run_json(["--db", db_arg.as_str(), "db", "migrate"]);
    assert_eq!(data(&migrated).get("after_version").and_then(Value::as_i64), Some(1));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn self_signup_lands_as_guest_and_admin_grants_roles() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();
    let admin_id = seed_admin(&db).to_string();

    let walk_in = run_json([
        "--db",
        db_arg.as_str(),
        "principal",
        "add",
        "--email",
        "walkin@example.org",
        "--name",
        "Walk-in",
        "--role",
        "admin",
    ]);
    assert_eq!(field(data(&walk_in), "role"), "guest");

    let manager = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        admin_id.as_str(),
        "principal",
        "add",
        "--email",
        "manager@example.org",
        "--name",
        "Manager",
        "--role",
        "manager",
    ]);
    assert_eq!(field(data(&manager), "role"), "manager");

    let _ = std::fs::remove_file(&db);
}

#[test]
fn entity_and_join_flow_round_trips_with_audit_trail() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();
    let admin_id = seed_admin(&db).to_string();

    let manager = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        admin_id.as_str(),
        "principal",
        "add",
        "--email",
        "manager@example.org",
        "--name",
        "Manager",
        "--role",
        "manager",
    ]);
    let manager_id = field(data(&manager), "id").to_string();

    let measure = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        manager_id.as_str(),
        "entity",
        "add",
        "measure",
        "--title",
        "Improve reporting",
    ]);
    let measure_id = field(data(&measure), "id").to_string();

    let indicator = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        manager_id.as_str(),
        "entity",
        "add",
        "indicator",
        "--title",
        "Reports submitted",
    ]);
    let indicator_id = field(data(&indicator), "id").to_string();

    let join = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        manager_id.as_str(),
        "join",
        "add",
        "measure_indicator",
        "--left",
        measure_id.as_str(),
        "--right",
        indicator_id.as_str(),
    ]);
    let join_id = field(data(&join), "id").to_string();

    let reloaded = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        manager_id.as_str(),
        "entity",
        "show",
        "measure",
        measure_id.as_str(),
    ]);
    assert_eq!(field(data(&reloaded), "relationship_updated_by_id"), manager_id);

    let deleted = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        manager_id.as_str(),
        "join",
        "delete",
        "measure_indicator",
        join_id.as_str(),
    ]);
    assert_eq!(field(data(&deleted), "deleted"), join_id);

    let versions = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        admin_id.as_str(),
        "versions",
        "measure_indicator",
        join_id.as_str(),
    ]);
    let items = data(&versions)
        .as_array()
        .unwrap_or_else(|| panic!("expected array payload: {versions}"));
    assert_eq!(items.len(), 2);
    assert_eq!(field(&items[0], "event"), "create");
    assert_eq!(field(&items[1], "event"), "destroy");
    assert_eq!(field(&items[1], "whodunnit"), manager_id);

    let _ = std::fs::remove_file(&db);
}

#[test]
fn policy_denials_surface_as_command_failures() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();
    let admin_id = seed_admin(&db).to_string();

    // Anonymous mutation.
    let denied = run_impact(["--db", db_arg.as_str(), "entity", "add", "category", "--title", "Nope"]);
    assert!(!denied.status.success());
    let stderr = String::from_utf8_lossy(&denied.stderr);
    assert!(stderr.contains("authentication required"), "stderr was: {stderr}");

    // Self-referential membership.
    let actor = run_json([
        "--db",
        db_arg.as_str(),
        "--as",
        admin_id.as_str(),
        "entity",
        "add",
        "actor",
        "--title",
        "Network",
    ]);
    let actor_id = field(data(&actor), "id").to_string();

    let self_edge = run_impact([
        "--db",
        db_arg.as_str(),
        "--as",
        admin_id.as_str(),
        "join",
        "add",
        "membership",
        "--left",
        actor_id.as_str(),
        "--right",
        actor_id.as_str(),
    ]);
    assert!(!self_edge.status.success());
    let stderr = String::from_utf8_lossy(&self_edge.stderr);
    assert!(stderr.contains("can't be the same as member_id"), "stderr was: {stderr}");

    let _ = std::fs::remove_file(&db);
}
