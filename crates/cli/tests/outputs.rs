use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("tickrace-{}-{}", prefix, nonce));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

const RACY_SYSTEM: &str = r#"
name: racy-reader
shared:
  role: reader
  guard: unprotected
sim:
  clocks_per_step: 500
"#;

fn run_script(dir: &PathBuf, script: &str, extra: &[&str]) -> std::process::Output {
    let script_path = dir.join("script.yaml");
    std::fs::write(&script_path, script).expect("Failed to write script");

    let mut args = vec!["test", "--script", script_path.to_str().unwrap()];
    args.extend_from_slice(extra);
    Command::new(env!("CARGO_BIN_EXE_tickrace"))
        .args(&args)
        .output()
        .expect("Failed to execute tickrace")
}

#[test]
fn test_cli_test_mode_outputs() {
    let dir = temp_dir("outputs");
    std::fs::write(dir.join("racy.yaml"), RACY_SYSTEM).unwrap();
    let output_dir = dir.join("artifacts");

    let output = run_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  system: "racy.yaml"
limits:
  max_steps: 100
assertions:
  - race_detected: true
  - expected_stop_reason: max_steps
"#,
        &["--output-dir", output_dir.to_str().unwrap()],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let junit = std::fs::read_to_string(output_dir.join("junit.xml")).unwrap();
    assert!(junit.contains("<testsuite"));
    assert!(junit.contains("<testcase"));

    let result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(output_dir.join("result.json")).unwrap())
            .unwrap();
    assert_eq!(result["status"], "pass");
    assert_eq!(result["stop_reason"], "max_steps");
    assert_eq!(result["steps"], 100);
    assert_eq!(result["races"], 1);
    assert_eq!(result["system_hash"].as_str().unwrap().len(), 64);
    assert!(result["config"]["system"]
        .as_str()
        .unwrap()
        .contains("racy.yaml"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_junit_flag_writes_file() {
    let dir = temp_dir("junit");
    let junit_path = dir.join("report.xml");

    let output = run_script(
        &dir,
        r#"
schema_version: "1.0"
limits:
  max_steps: 1
assertions:
  - expected_stop_reason: max_steps
"#,
        &["--junit", junit_path.to_str().unwrap()],
    );
    assert!(output.status.success());

    let junit = std::fs::read_to_string(&junit_path).unwrap();
    assert!(junit.contains("tickrace test"));
    assert!(!junit.contains("<failure"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_wall_time() {
    let dir = temp_dir("walltime");
    let output = run_script(
        &dir,
        r#"
schema_version: "1.0"
limits:
  max_steps: 10000000
  wall_time_ms: 0
assertions:
  - expected_stop_reason: wall_time
"#,
        &[],
    );
    assert!(output.status.success());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_min_toggles() {
    let dir = temp_dir("toggles");
    let output = run_script(
        &dir,
        r#"
schema_version: "1.0"
limits:
  max_steps: 260000
assertions:
  - min_toggles: { led: handler, count: 1 }
  - min_toggles: { led: main, count: 100 }
  - race_detected: false
"#,
        &[],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_max_steps_guard() {
    let dir = temp_dir("huge");
    let output = run_script(
        &dir,
        r#"
schema_version: "1.0"
limits:
  max_steps: 60000000
"#,
        &[],
    );
    assert_eq!(output.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_protected_fails_race_assertion() {
    let dir = temp_dir("protected");
    std::fs::write(
        dir.join("protected.yaml"),
        RACY_SYSTEM.replace("unprotected", "protected"),
    )
    .unwrap();
    let output_dir = dir.join("artifacts");

    let output = run_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  system: "protected.yaml"
limits:
  max_steps: 100
assertions:
  - race_detected: true
"#,
        &["--output-dir", output_dir.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(1));

    let junit = std::fs::read_to_string(output_dir.join("junit.xml")).unwrap();
    assert!(junit.contains("<failure"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_bad_schema_version() {
    let dir = temp_dir("schema");
    let output = run_script(
        &dir,
        r#"
schema_version: "2.0"
limits:
  max_steps: 1
"#,
        &[],
    );
    assert_eq!(output.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&dir);
}
