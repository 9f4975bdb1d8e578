//! End-to-end tests of the `verdict` binary against shell-script "frameworks".

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Writes `verdict.toml` and the scripts it points at into a fresh directory.
fn project(settings: &str, run_script: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("list.sh"),
        "printf 'math::adds\\nmath::divides\\n'\n",
    )
    .unwrap();
    fs::write(dir.path().join("run.sh"), run_script).unwrap();
    fs::write(
        dir.path().join("verdict.toml"),
        format!(
            r#"
[verdict]
{settings}

[launcher]
working_dir = "{dir}"

[groups.unit.framework]
type = "generic"
discover_command = "sh list.sh"
run_command = "sh run.sh {{tests}}"

[report]
output_dir = "{dir}/out"
json = true
"#,
            settings = settings,
            dir = dir.path().display()
        ),
    )
    .unwrap();
    dir
}

fn verdict(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("verdict").unwrap();
    cmd.current_dir(dir);
    cmd
}

#[test]
fn test_passing_run_exits_zero() {
    let dir = project("", "exit 0\n");

    verdict(dir.path())
        .arg("run")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("All tests passed!"));

    let junit = fs::read_to_string(dir.path().join("out/junit.xml")).unwrap();
    assert!(junit.contains(r#"<testsuite name="unit" tests="2" failures="0""#));
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("out/verdict.json")).unwrap())
            .unwrap();
    assert_eq!(json["passed"], 2);
}

#[test]
fn test_failing_run_exits_one() {
    let dir = project("", "echo boom >&2\nexit 3\n");

    verdict(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Failed tests:"))
        .stdout(predicate::str::contains("math::divides"));
}

#[test]
fn test_flaky_run_exits_two() {
    let dir = project(
        "max_attempts_per_test = 2",
        "if [ -f ran-once ]; then exit 0; fi\ntouch ran-once\nexit 1\n",
    );

    verdict(dir.path()).arg("run").assert().code(2);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("out/verdict.json")).unwrap())
            .unwrap();
    assert_eq!(json["flaky"], 2);
    assert_eq!(json["retries_used"], 2);
}

#[test]
fn test_muted_counts_in_json_report() {
    let dir = project("muted = [\"math::adds\"]", "exit 0\n");

    verdict(dir.path())
        .arg("run")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Muted:"));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("out/verdict.json")).unwrap())
            .unwrap();
    assert_eq!(json["passed"], 2);
    assert_eq!(json["muted_passed"], 1);
    assert_eq!(json["muted_failures"], 0);
}

#[test]
fn test_muted_failure_without_retry_exits_zero() {
    let dir = project(
        "max_attempts_per_test = 3\nmuted = [\"math::adds\", \"math::divides\"]\nretry_muted = false",
        "exit 1\n",
    );

    verdict(dir.path()).arg("run").assert().code(0);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("out/verdict.json")).unwrap())
            .unwrap();
    assert_eq!(json["muted_failures"], 2);
    assert_eq!(json["failure_count"], 0);
    assert_eq!(json["retries_used"], 0);
}

#[test]
fn test_max_attempts_flag_overrides_config() {
    let dir = project(
        "max_attempts_per_test = 2",
        "if [ -f ran-once ]; then exit 0; fi\ntouch ran-once\nexit 1\n",
    );

    verdict(dir.path())
        .args(["run", "--max-attempts", "1"])
        .assert()
        .code(1);
}

#[test]
fn test_collect_json() {
    let dir = project("", "exit 0\n");

    let output = verdict(dir.path())
        .args(["collect", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let tests: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(tests[0]["id"], "math::adds");
    assert_eq!(tests[1]["id"], "math::divides");
    assert_eq!(tests[1]["group"], "unit");
}

#[test]
fn test_partition_text() {
    let dir = project("", "exit 0\n");

    verdict(dir.path())
        .args(["partition", "--shard-count", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shard 0: 1 test(s)"))
        .stdout(predicate::str::contains("shard 1: 1 test(s)"));
}

#[test]
fn test_validate_rejects_missing_placeholder() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("verdict.toml"),
        r#"
[groups.unit.framework]
type = "generic"
discover_command = "sh list.sh"
run_command = "sh run.sh"
"#,
    )
    .unwrap();

    verdict(dir.path())
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("{tests}"));
}

#[test]
fn test_init_writes_loadable_config() {
    let dir = TempDir::new().unwrap();

    verdict(dir.path())
        .args(["init", "--framework", "cucumber"])
        .assert()
        .success();
    assert!(dir.path().join("verdict.toml").exists());

    verdict(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("features: cucumber"));

    verdict(dir.path()).arg("init").assert().code(1);
}
