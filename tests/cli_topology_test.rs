//! Integration tests for topology editing via CLI.
//!
//! These tests verify that editing commands work through the binary:
//! - `fedtree node add/update/remove/show/list` and `fedtree edge ...`
//! - JSON and human-readable output formats
//! - Tier rules, shape checks, export/import, configuration sources

mod common;

use common::TestEnv;
use predicates::prelude::*;
use serde_json::Value;

// === Node Tests ===

#[test]
fn test_node_add_json() {
    let env = TestEnv::new();

    env.fedtree()
        .args(["node", "add", "root", "--label", "Cloud A", "--address", "10.0.0.1:9000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"local_id\":\"nd-1\""))
        .stdout(predicate::str::contains("\"label\":\"Cloud A\""));

    let data = env.node_data("nd-1");
    assert_eq!(data["ip_address"], "10.0.0.1");
    assert_eq!(data["port"], 9000);
    assert_eq!(data["node_type"], 1);
}

#[test]
fn test_node_add_human() {
    let env = TestEnv::new();

    env.fedtree()
        .args(["node", "add", "fog", "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added nd-1 [mid] \"Fog Node\""))
        .stdout(predicate::str::contains("(no address)"));
}

#[test]
fn test_node_add_rejects_unknown_tier() {
    let env = TestEnv::new();

    env.fedtree()
        .args(["node", "add", "branch"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown tier"));
}

#[test]
fn test_node_add_rejects_bad_address() {
    let env = TestEnv::new();

    env.fedtree()
        .args(["node", "add", "leaf", "--address", "10.0.0.9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("\"error\""))
        .stderr(predicate::str::contains("host:port"));
    assert!(!env.topology_path().exists());
}

#[test]
fn test_node_update_and_show() {
    let env = TestEnv::new();
    let id = env.add_node("mid", "Fog", None);

    env.fedtree()
        .args(["node", "update", &id, "--address", "10.0.0.2:9001", "--agent-id", "12"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"changed\":true"));

    env.fedtree()
        .args(["node", "show", &id, "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("10.0.0.2:9001 agent 12"));

    env.fedtree()
        .args(["node", "update", &id, "--clear-agent-id"])
        .assert()
        .success();
    assert!(env.node_data(&id).get("backed_id").is_none());
}

#[test]
fn test_node_update_unknown_node() {
    let env = TestEnv::new();

    env.fedtree()
        .args(["node", "update", "nd-9", "--label", "x", "-H"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error: Not found: node nd-9"));
}

#[test]
fn test_node_list_filter() {
    let env = TestEnv::new();
    env.add_node("root", "R", None);
    env.add_node("leaf", "L1", None);
    env.add_node("leaf", "L2", None);

    let output = env
        .fedtree()
        .args(["node", "list", "--tier", "leaf"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["count"], 2);
    assert_eq!(value["nodes"][0]["label"], "L1");
}

#[test]
fn test_node_remove_drops_edges() {
    let env = TestEnv::new();
    let root = env.add_node("root", "R", None);
    let mid = env.add_node("mid", "M", None);
    env.link(&root, &mid);

    env.fedtree()
        .args(["node", "remove", &root])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"edges_removed\":1"));

    env.fedtree()
        .args(["edge", "list", "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No edges."));
}

// === Edge Tests ===

#[test]
fn test_edge_add_enforces_tiers() {
    let env = TestEnv::new();
    let root = env.add_node("root", "R", None);
    let leaf = env.add_node("leaf", "L", None);

    env.fedtree()
        .args(["edge", "add", &root, &leaf])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be the parent"));
}

#[test]
fn test_edge_add_single_parent() {
    let env = TestEnv::new();
    let m1 = env.add_node("mid", "M1", None);
    let m2 = env.add_node("mid", "M2", None);
    let leaf = env.add_node("leaf", "L", None);
    env.link(&m1, &leaf);

    env.fedtree()
        .args(["edge", "add", &m2, &leaf])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already has parent"));
}

#[test]
fn test_edge_add_and_remove() {
    let env = TestEnv::new();
    let root = env.add_node("root", "R", None);
    let mid = env.add_node("mid", "M", None);

    env.fedtree()
        .args(["edge", "add", &root, &mid, "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Linked nd-1 -> nd-2"));

    let topology = env.topology_json();
    assert_eq!(topology["edges"][0]["id"], "edge-nd-1-nd-2");

    env.fedtree()
        .args(["edge", "remove", &root, &mid])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"action\":\"removed\""));

    env.fedtree()
        .args(["edge", "remove", &root, &mid])
        .assert()
        .failure();
}

// === Topology Tests ===

#[test]
fn test_clear_keeps_local_ids_retired() {
    let env = TestEnv::new();
    env.add_node("root", "R", None);
    env.add_node("mid", "M", None);

    env.fedtree()
        .args(["clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"nodes_removed\":2"));

    let id = env.add_node("root", "R2", None);
    assert_eq!(id, "nd-3");
}

#[test]
fn test_check_valid_tree() {
    let env = TestEnv::new();
    let root = env.add_node("root", "R", None);
    let mid = env.add_node("mid", "M", None);
    let leaf = env.add_node("leaf", "L", None);
    env.link(&root, &mid);
    env.link(&mid, &leaf);

    env.fedtree()
        .args(["check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\":true"))
        .stdout(predicate::str::contains("\"component_count\":1"));
}

#[test]
fn test_check_reports_detached_nodes() {
    let env = TestEnv::new();
    env.add_node("root", "R", None);
    env.add_node("mid", "M", None);

    env.fedtree()
        .args(["check", "-H"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("not attached to the root: nd-2"))
        .stderr(predicate::str::contains("shape violation"));
}

#[test]
fn test_export_and_import() {
    let env = TestEnv::new();
    let root = env.add_node("root", "R", Some("10.0.0.1:9000"));
    let mid = env.add_node("mid", "M", Some("10.0.0.2:9001"));
    env.link(&root, &mid);
    env.fedtree()
        .args(["node", "update", &mid, "--agent-id", "2"])
        .assert()
        .success();

    env.fedtree()
        .args(["export", "snapshot.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"nodes\":2"));

    env.fedtree().args(["clear"]).assert().success();

    env.fedtree()
        .args(["import", "snapshot.json", "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 2 node(s) and 1 edge(s)"));

    assert_eq!(env.node_data(&mid)["backed_id"], "2");
    assert_eq!(env.topology_json()["edges"][0]["source"], root.as_str());
}

#[test]
fn test_export_default_name() {
    let env = TestEnv::new();
    env.add_node("root", "R", None);

    let output = env.fedtree().args(["export"]).output().unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    let path = value["path"].as_str().unwrap();
    assert!(path.starts_with("federated_topology_"));
    assert!(path.ends_with(".json"));
    assert!(env.path().join(path).exists());
}

#[test]
fn test_import_invalid_file() {
    let env = TestEnv::new();
    std::fs::write(env.path().join("broken.json"), "{oops").unwrap();

    env.fedtree()
        .args(["import", "broken.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a valid topology file"));
}

#[test]
fn test_import_tolerates_numeric_ids() {
    let env = TestEnv::new();
    std::fs::write(
        env.path().join("legacy.json"),
        r#"{"nodes": [{"id": "nd-4", "data": {"label": "old", "ip_address": "10.0.0.5", "port": 9100, "node_type": 1, "backed_id": 8}}], "edges": []}"#,
    )
    .unwrap();

    env.fedtree().args(["import", "legacy.json"]).assert().success();
    assert_eq!(env.node_data("nd-4")["backed_id"], "8");
    assert_eq!(env.add_node("mid", "new", None), "nd-5");
}

// === Topology File Selection ===

#[test]
fn test_topology_flag_and_env() {
    let env = TestEnv::new();

    env.fedtree()
        .args(["node", "add", "root", "--topology", "alt.json"])
        .assert()
        .success();
    assert!(env.path().join("alt.json").exists());
    assert!(!env.topology_path().exists());

    env.fedtree()
        .env("FEDTREE_TOPOLOGY", "from-env.json")
        .args(["node", "add", "root"])
        .assert()
        .success();
    assert!(env.path().join("from-env.json").exists());
}

#[test]
fn test_config_file_sets_topology() {
    let env = TestEnv::new();
    env.write_config("topology \"configured.json\"\n");

    env.fedtree().args(["node", "add", "root"]).assert().success();
    assert!(env.path().join("configured.json").exists());
}

// === Config Tests ===

#[test]
fn test_config_show_sources() {
    let env = TestEnv::new();
    env.write_config("retry-delay-ms 500\nrole-path mid=\"fog\"\n");

    let output = env
        .fedtree()
        .env("FEDTREE_CALL_TIMEOUT_SECS", "7")
        .args(["config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    let settings = &value["settings"];

    assert_eq!(settings["retry_delay_ms"]["value"], 500);
    assert!(
        settings["retry_delay_ms"]["source"]
            .as_str()
            .unwrap()
            .contains("config.kdl")
    );
    assert_eq!(settings["call_timeout_secs"]["value"], 7);
    assert_eq!(
        settings["call_timeout_secs"]["source"],
        "env:FEDTREE_CALL_TIMEOUT_SECS"
    );
    assert_eq!(settings["role_paths"]["value"]["mid"], "fog");
    assert_eq!(settings["scheme"]["source"], "default");
}

#[test]
fn test_config_show_cli_flag_wins() {
    let env = TestEnv::new();
    env.write_config("call-timeout-secs 10\n");

    env.fedtree()
        .env("FEDTREE_CALL_TIMEOUT_SECS", "7")
        .args(["config", "show", "--call-timeout", "3", "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("call-timeout-secs: 3 (cli)"));
}

#[test]
fn test_invalid_config_is_reported() {
    let env = TestEnv::new();
    env.write_config("scheme \"http\"\n");

    env.fedtree()
        .args(["node", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("scheme must be ws or wss"));
}
