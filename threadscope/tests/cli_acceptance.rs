use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    root: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let root = base.join("logs");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        for dir in [&home, &root, &xdg_data, &xdg_config, &xdg_state] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        seed_conversation(&root);

        Self {
            _temp_dir: temp_dir,
            home,
            root,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }
}

fn seed_conversation(root: &Path) {
    let project = root.join("webapp");
    fs::create_dir_all(&project).expect("failed to create project dir");
    let lines = [
        r#"{"type":"user","timestamp":"2025-03-01T09:00:00Z","message":{"role":"user","content":"Add a login form"}}"#,
        r#"{"type":"assistant","timestamp":"2025-03-01T09:00:20Z","message":{"role":"assistant","content":[{"type":"text","text":"Reading the page"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"index.html"}}]}}"#,
        r#"{"type":"user","timestamp":"2025-03-01T09:00:22Z","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"<html>"}]}}"#,
        "this line is not json",
        r#"{"type":"assistant","timestamp":"2025-03-01T09:01:00Z","message":{"role":"assistant","content":"Form added"}}"#,
    ];
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(project.join("session-1.jsonl"), body).expect("failed to write conversation");
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("threadscope"));
    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute threadscope: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    panic!(
        "threadscope {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn scan_reports_messages_threads_and_parse_errors() {
    let env = CliTestEnv::new();
    let root = env.root.to_string_lossy().into_owned();
    let args = ["scan", root.as_str()];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("webapp/session-1: 3 messages, 1 tool calls (0 pending), 1 threads, 1 errors"),
        "unexpected summary:\n{stdout}"
    );
    assert!(stdout.contains("Scanned 1 file(s)"));
}

#[test]
fn scan_json_output_is_machine_readable() {
    let env = CliTestEnv::new();
    let file = env.root.join("webapp/session-1.jsonl");
    let file = file.to_string_lossy().into_owned();
    let args = ["scan", file.as_str(), "--json"];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let reports: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("scan --json should print JSON");
    let report = &reports[0];
    assert_eq!(report["projectId"], "webapp");
    assert_eq!(report["conversationId"], "session-1");
    assert_eq!(report["messages"], 3);
    assert_eq!(report["parseErrors"][0]["lineNumber"], 4);
    assert_eq!(report["threads"][0]["closed"], true);
}

#[test]
fn watch_refuses_to_start_without_root() {
    let env = CliTestEnv::new();
    let missing = env.root.join("does-not-exist");
    let missing = missing.to_string_lossy().into_owned();
    let db = env.xdg_data.join("test.db");
    let db = db.to_string_lossy().into_owned();
    let args = [
        "watch",
        "--root",
        missing.as_str(),
        "--bind",
        "127.0.0.1:0",
        "--database",
        db.as_str(),
    ];

    let output = run_bin(&env, &args);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to watch root"),
        "unexpected stderr:\n{stderr}"
    );
}

#[test]
fn invalid_config_is_rejected() {
    let env = CliTestEnv::new();
    let config_dir = env.xdg_config.join("threadscope");
    fs::create_dir_all(&config_dir).expect("failed to create config dir");
    fs::write(
        config_dir.join("config.toml"),
        "[pipeline]\nworker_pool_size = 0\n",
    )
    .expect("failed to write config");

    let root = env.root.to_string_lossy().into_owned();
    let output = run_bin(&env, &["scan", root.as_str()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration"), "unexpected stderr:\n{stderr}");
}
