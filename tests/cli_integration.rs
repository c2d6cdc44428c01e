//! Integration tests for the stackguard binary.
//!
//! These tests run the real binary against the local backend and a fake
//! provisioning tool (a shell script that logs its arguments), so they
//! cover the full flow: resolve -> bootstrap -> lock -> run -> release.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Fixtures
// =============================================================================

const ROOT_CONFIG: &str = r#"
[lock]
backend = "local"
table_name = "locks"
max_lock_retries = 1
lock_retry_interval_secs = 0

[remote_state]
backend = "local"

[remote_state.config]
bucket = "qa-state"
key = "${path_relative_to_include()}/terraform.tfstate"
"#;

/// A live tree with a shared root config and two modules:
/// `mgmt` and `qa/my-app` (depends on mgmt).
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let ws = Self { dir };

        fs::create_dir_all(ws.live()).unwrap();
        fs::write(ws.live().join("stackguard.toml"), ROOT_CONFIG).unwrap();
        ws.module(
            "mgmt",
            r#"
[include]
path = "${find_in_parent_folders()}"

[lock]
state_file_id = "mgmt"
"#,
        );
        ws.module(
            "qa/my-app",
            r#"
[include]
path = "${find_in_parent_folders()}"

[lock]
state_file_id = "qa/my-app"

[dependencies]
paths = ["../../mgmt"]

[terraform]
vars = { env = "qa" }
"#,
        );

        fs::write(ws.settings(), "").unwrap();
        ws.write_tool();
        ws
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn live(&self) -> PathBuf {
        self.path().join("live")
    }

    fn settings(&self) -> PathBuf {
        self.path().join("settings.toml")
    }

    fn tool(&self) -> PathBuf {
        self.path().join("fake-terraform")
    }

    fn tool_log(&self) -> PathBuf {
        self.path().join("tool.log")
    }

    fn module(&self, rel: &str, contents: &str) {
        let dir = self.live().join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stackguard.toml"), contents).unwrap();
    }

    /// Install a tool that logs `<dir> <args>` and fails when the module
    /// directory contains a file named `fail`.
    fn write_tool(&self) {
        let script = format!(
            "#!/bin/sh\necho \"$(pwd) $*\" >> '{}'\nif [ -e fail ]; then echo boom >&2; exit 3; fi\n",
            self.tool_log().display()
        );
        fs::write(self.tool(), script).unwrap();
        let mut perms = fs::metadata(self.tool()).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(self.tool(), perms).unwrap();
    }

    /// Run stackguard as `holder` in `rel` under the live tree.
    fn cmd(&self, holder: &str, rel: &str) -> Command {
        self.cmd_in(holder, &self.live().join(rel))
    }

    /// Run stackguard as `holder` in `dir`.
    fn cmd_in(&self, holder: &str, dir: &Path) -> Command {
        let mut cmd = Command::cargo_bin("stackguard").unwrap();
        cmd.env_remove("RUST_LOG")
            .arg("--config")
            .arg(self.settings())
            .arg("--local-root")
            .arg(self.path().join("backend"))
            .arg("--tool")
            .arg(self.tool())
            .arg("--holder")
            .arg(holder)
            .arg("--working-dir")
            .arg(dir)
            .arg("--non-interactive");
        cmd
    }

    fn tool_calls(&self) -> Vec<String> {
        fs::read_to_string(self.tool_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

// =============================================================================
// Single module
// =============================================================================

#[test]
fn apply_runs_init_then_apply() {
    let ws = Workspace::new();

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("apply")
        .assert()
        .success()
        .stdout(predicate::str::contains("apply complete"));

    let calls = ws.tool_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains(" init -input=false -backend-config=path="));
    assert!(calls[1].contains(" apply -input=false -auto-approve -var env=qa"));

    // Bucket bootstrapped, lock released.
    assert!(ws.path().join("backend/buckets/qa-state").exists());
    ws.cmd("alice@laptop", "qa/my-app")
        .arg("lock-status")
        .assert()
        .success()
        .stdout(predicate::str::contains("state qa/my-app is not locked"));
}

#[test]
fn cli_var_overrides_config_var() {
    let ws = Workspace::new();

    ws.cmd("alice@laptop", "qa/my-app")
        .args(["--var", "env=prod", "plan"])
        .assert()
        .success();

    let calls = ws.tool_calls();
    assert!(calls[1].contains(" plan -input=false -var env=prod"));
}

#[test]
fn held_lock_blocks_apply_until_released() {
    let ws = Workspace::new();

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("acquire-lock")
        .assert()
        .success()
        .stdout(predicate::str::contains("acquired lock for state qa/my-app"));

    ws.cmd("bob@desk", "qa/my-app")
        .arg("apply")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unable to acquire lock"))
        .stderr(predicate::str::contains("alice@laptop"));
    assert!(ws.tool_calls().iter().all(|c| !c.contains(" apply ")));

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("lock-status")
        .assert()
        .success()
        .stdout(predicate::str::contains("locked by alice@laptop"));

    // Another holder cannot release it.
    ws.cmd("bob@desk", "qa/my-app")
        .arg("release-lock")
        .assert()
        .success();
    ws.cmd("bob@desk", "qa/my-app").arg("apply").assert().failure();

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("release-lock")
        .assert()
        .success()
        .stdout(predicate::str::contains("released lock for state qa/my-app"));

    ws.cmd("bob@desk", "qa/my-app").arg("apply").assert().success();
}

#[test]
fn plan_ignores_held_lock() {
    let ws = Workspace::new();

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("acquire-lock")
        .assert()
        .success();
    ws.cmd("bob@desk", "qa/my-app").arg("plan").assert().success();
}

#[test]
fn tool_failure_exits_non_zero_and_releases() {
    let ws = Workspace::new();
    fs::write(ws.live().join("qa/my-app/fail"), "").unwrap();

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("apply")
        .assert()
        .failure()
        .stderr(predicate::str::contains("exited with status 3"))
        .stderr(predicate::str::contains("boom"));

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("lock-status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not locked"));
}

#[test]
fn missing_config_fails() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.live().join("empty")).unwrap();

    ws.cmd("alice@laptop", "empty")
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to resolve module"));
}

#[test]
fn module_config_override_runs_tool_in_working_dir() {
    let ws = Workspace::new();
    let module_dir = ws.path().join("standalone");
    fs::create_dir_all(&module_dir).unwrap();
    let config = ws.path().join("override.toml");
    fs::write(
        &config,
        r#"
[lock]
backend = "local"
state_file_id = "standalone"
table_name = "locks"
max_lock_retries = 0

[terraform]
vars = { env = "override" }
"#,
    )
    .unwrap();

    let run = |holder: &str, command: &str| {
        let mut cmd = ws.cmd_in(holder, &module_dir);
        cmd.arg("--module-config")
            .arg(&config)
            .arg(command);
        cmd
    };

    run("alice@laptop", "acquire-lock")
        .assert()
        .success()
        .stdout(predicate::str::contains("acquired lock for state standalone"));
    run("bob@desk", "apply").assert().failure();
    run("alice@laptop", "release-lock").assert().success();
    run("alice@laptop", "apply").assert().success();

    let calls = ws.tool_calls();
    assert_eq!(calls.len(), 2);
    let dir = module_dir.canonicalize().unwrap();
    for call in &calls {
        assert!(
            call.starts_with(&format!("{} ", dir.display())),
            "tool ran outside the working dir: {}",
            call
        );
    }
    assert!(calls[1].contains(" apply -input=false -auto-approve -var env=override"));
}

// =============================================================================
// Stacks
// =============================================================================

#[test]
fn spin_up_applies_dependencies_first() {
    let ws = Workspace::new();

    ws.cmd("alice@laptop", "")
        .arg("spin-up")
        .assert()
        .success()
        .stdout(predicate::str::contains("apply summary:"));

    let applies: Vec<String> = ws
        .tool_calls()
        .into_iter()
        .filter(|c| c.contains(" apply "))
        .collect();
    assert_eq!(applies.len(), 2);
    assert!(applies[0].contains("/live/mgmt "));
    assert!(applies[1].contains("/live/qa/my-app "));
}

#[test]
fn tear_down_destroys_dependents_first() {
    let ws = Workspace::new();

    ws.cmd("alice@laptop", "")
        .arg("stack-destroy")
        .assert()
        .success();

    let destroys: Vec<String> = ws
        .tool_calls()
        .into_iter()
        .filter(|c| c.contains(" destroy "))
        .collect();
    assert_eq!(destroys.len(), 2);
    assert!(destroys[0].contains("/live/qa/my-app "));
    assert!(destroys[1].contains("/live/mgmt "));
}

#[test]
fn stack_stops_at_first_failure() {
    let ws = Workspace::new();
    fs::write(ws.live().join("mgmt/fail"), "").unwrap();

    ws.cmd("alice@laptop", "")
        .arg("spin-up")
        .assert()
        .failure()
        .stdout(predicate::str::contains("failed   mgmt"))
        .stdout(predicate::str::contains("skipped  qa/my-app"));

    assert!(ws
        .tool_calls()
        .iter()
        .all(|c| !c.contains("/live/qa/my-app ")));
}

#[test]
fn dependency_cycle_is_reported() {
    let ws = Workspace::new();
    ws.module(
        "mgmt",
        r#"
[include]
path = "${find_in_parent_folders()}"

[lock]
state_file_id = "mgmt"

[dependencies]
paths = ["../qa/my-app"]
"#,
    );

    ws.cmd("alice@laptop", "")
        .arg("spin-up")
        .assert()
        .failure()
        .stderr(predicate::str::contains("dependency cycle"));
    assert!(ws.tool_calls().is_empty());
}

// =============================================================================
// Cleanup and completion
// =============================================================================

#[test]
fn cleanup_requires_yes_when_not_interactive() {
    let ws = Workspace::new();
    ws.cmd("alice@laptop", "qa/my-app").arg("apply").assert().success();

    ws.cmd("alice@laptop", "qa/my-app")
        .arg("cleanup")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
    assert!(ws.path().join("backend/buckets/qa-state").exists());

    ws.cmd("alice@laptop", "qa/my-app")
        .args(["cleanup", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted bucket qa-state"))
        .stdout(predicate::str::contains("deleted lock table locks"));
    assert!(!ws.path().join("backend/buckets/qa-state").exists());
}

#[test]
fn completion_generates_script() {
    Command::cargo_bin("stackguard")
        .unwrap()
        .args(["completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stackguard"));
}
