mod common;

use scriptcov::cli;
use scriptcov::session::SessionConfig;

#[test]
fn analyze_prints_coverage_map() {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("pick.json");
    std::fs::write(&tree, include_str!("fixtures/if_else.json")).unwrap();

    let out = cli::cmd_analyze(&tree).unwrap();
    let value: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(value["executable_lines"], serde_json::json!([2, 3, 5, 8]));
    assert_eq!(value["branches"][0]["exit_lines"], serde_json::json!([3]));
    assert_eq!(value["branches"][1]["exit_lines"], serde_json::json!([5]));
    assert_eq!(value["functions"][0]["key"], "pick:1:0");
}

#[test]
fn analyze_rejects_non_program() {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("bad.json");
    std::fs::write(&tree, r#"{"type": "ExpressionStatement"}"#).unwrap();
    assert!(cli::cmd_analyze(&tree).is_err());
}

#[test]
fn export_then_import_into_another_cache() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(dir.path(), "fns.js", "functions", 1_600_000_000);
    let (store, _cache_dir, _) = common::setup_cache();
    let mut session = common::session_with(
        SessionConfig::new(),
        scriptcov::fingerprint::MemoryArchive::new(),
        store,
    );
    session.register(&script).unwrap();
    let store = session.finish().unwrap();

    let blob_path = dir.path().join("cache.json");
    let out = cli::cmd_cache_export(&store, Some(&blob_path)).unwrap();
    assert_eq!(out, format!("Exported 1 entries to {}\n", blob_path.display()));

    let (mut other, _other_dir, _) = common::setup_cache();
    let out = cli::cmd_cache_import(&mut other, &blob_path).unwrap();
    assert_eq!(out, format!("Imported 1 entries from {}\n", blob_path.display()));
    assert!(cli::cmd_cache_list(&other).unwrap().contains("fns.js"));
    assert_eq!(other.export().unwrap(), std::fs::read(&blob_path).unwrap());
}

#[test]
fn summary_of_written_report() {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("out");
    let script = common::write_script(dir.path(), "pick.js", "if_else", 1_600_000_000);
    let mut session = common::session(SessionConfig::new());
    common::call(&mut session, &script, 8, Some("pick"), 2, &[2, 5]);
    let trace = session.write_report(&out_dir).unwrap();

    let out = cli::cmd_summary(&trace).unwrap();
    assert_eq!(
        out,
        "Files:      1\n\
         Lines:      3/4 (75.0%)\n\
         Branches:   1/2 (50.0%)\n\
         Functions:  1/1 (100.0%)\n"
    );
}
