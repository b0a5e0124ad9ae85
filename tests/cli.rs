use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

const TWO_FRAMES: &str = r#"
fail_handler = 0x200
mode_switch = 0x100

[call]
arity = 1
args = [0x51]

[[frame]]
return_address = 0x1000
frame_size = 2
arity = 1
live = [1]
slots = [0x11, 0x12, 0x13]

[[frame]]
return_address = 0x2000
frame_size = 1
handler = 0x3000
"#;

fn write_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// Run moca-native and return (stdout, stderr, success)
fn run(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_moca-native"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute moca-native");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_walk_lists_frames() {
    let scenario = write_file(TWO_FRAMES);
    let path = scenario.path().to_str().unwrap();

    let (stdout, stderr, success) = run(&["walk", path]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.contains("ra=0x1000 size=2 arity=1"));
    assert!(stdout.contains("ra=0x2000 size=1 arity=0 handler=0x3000"));
    assert!(stdout.ends_with("2 frames\n"));
}

#[test]
fn test_walk_json() {
    let scenario = write_file(TWO_FRAMES);
    let path = scenario.path().to_str().unwrap();

    let (stdout, stderr, success) = run(&["walk", path, "--json"]);
    assert!(success, "stderr:\n{}", stderr);

    let frames: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let frames = frames.as_array().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["base"], 1);
    assert_eq!(frames[0]["live"], serde_json::json!([2]));
    assert_eq!(frames[1]["base"], 5);
    assert_eq!(frames[1]["handler"], 0x3000);
}

#[test]
fn test_unwind() {
    let scenario = write_file(TWO_FRAMES);
    let path = scenario.path().to_str().unwrap();

    let (stdout, _, success) = run(&["unwind", path, "--catches", "0"]);
    assert!(success);
    assert!(stdout.contains("handler  0x3000 (catch)"));
    assert!(stdout.contains("resume   sp=5"));

    let (stdout, _, success) = run(&["unwind", path, "--catches", "-1"]);
    assert!(success);
    assert!(stdout.contains("handler  0x200 (terminator)"));
    assert!(stdout.contains("resume   sp=7"));
}

#[test]
fn test_trap_uses_config() {
    let scenario = write_file(TWO_FRAMES);
    let path = scenario.path().to_str().unwrap();

    // Seven words are far below the default threshold.
    let (stdout, _, success) = run(&["trap", path]);
    assert!(success);
    assert!(stdout.contains("no trap"));

    let config = write_file("[native]\nmin_stack_words = 0\nskip_frames = 2\n");
    let config_path = config.path().to_str().unwrap();
    let (stdout, stderr, success) = run(&["--config", config_path, "trap", path]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.contains("trap     slot 6"));
    assert!(stdout.contains("graylim  7"));
    assert!(stdout.contains("saved ra 0x100"));
}

#[test]
fn test_trace_logs_trap_and_unwind_events() {
    let scenario = write_file(TWO_FRAMES);
    let path = scenario.path().to_str().unwrap();
    let config = write_file("[native]\nmin_stack_words = 0\nskip_frames = 2\n");
    let config_path = config.path().to_str().unwrap();

    let (_, stderr, success) = run(&["--trace", "--config", config_path, "trap", path]);
    assert!(success);
    assert!(stderr.contains("stack trap installed"), "stderr:\n{}", stderr);

    let (_, stderr, success) = run(&["--trace", "unwind", path]);
    assert!(success);
    assert!(stderr.contains("native exception handler found"), "stderr:\n{}", stderr);

    // Quiet by default.
    let (_, stderr, success) = run(&["--config", config_path, "trap", path]);
    assert!(success);
    assert!(stderr.is_empty(), "stderr:\n{}", stderr);
}

#[test]
fn test_rust_log_enables_trace_without_flag() {
    let scenario = write_file(TWO_FRAMES);
    let config = write_file("[native]\nmin_stack_words = 0\nskip_frames = 2\n");

    let output = Command::new(env!("CARGO_BIN_EXE_moca-native"))
        .args(["--config", config.path().to_str().unwrap(), "trap"])
        .arg(scenario.path())
        .env("RUST_LOG", "trace")
        .output()
        .expect("failed to execute moca-native");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success());
    assert!(stderr.contains("stack trap installed"), "stderr:\n{}", stderr);
}

#[test]
fn test_dump() {
    let scenario = write_file(TWO_FRAMES);
    let path = scenario.path().to_str().unwrap();

    let (stdout, stderr, success) = run(&["dump", path]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.contains("nsp"));
    assert!(stdout.contains("narity"));
    assert!(stdout.contains("NATIVE RA"));
}

#[test]
fn test_missing_call_arguments_rejected() {
    // The call claims a stack argument that is not there.
    let scenario = write_file(
        r#"
[call]
arity = 1

[[frame]]
return_address = 0x1000
frame_size = 1
slots = [0x77]
"#,
    );
    let path = scenario.path().to_str().unwrap();
    let (_, stderr, success) = run(&["walk", path]);
    assert!(!success);
    assert!(
        stderr.contains("call of arity 1 has 0 stack arguments"),
        "stderr:\n{}",
        stderr
    );

    // Passed in a register, the same call is consistent.
    let config = write_file("[native]\narg_registers = 1\n");
    let config_path = config.path().to_str().unwrap();
    let (stdout, stderr, success) = run(&["--config", config_path, "walk", path]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.ends_with("1 frames\n"));
}

#[test]
fn test_unreadable_inputs() {
    let missing = write_file("not = [valid");
    let (_, stderr, success) = run(&["walk", missing.path().to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("failed to parse scenario"));

    let scenario = write_file(TWO_FRAMES);
    let (_, stderr, success) = run(&[
        "walk",
        scenario.path().to_str().unwrap(),
        "--config",
        "/nonexistent/config.toml",
    ]);
    assert!(!success);
    assert!(stderr.contains("failed to read"));
}

#[test]
fn test_bad_config_rejected() {
    let scenario = write_file(TWO_FRAMES);
    let config = write_file("[native]\nskip_frames = 0\n");
    let (_, stderr, success) = run(&[
        "--config",
        config.path().to_str().unwrap(),
        "walk",
        scenario.path().to_str().unwrap(),
    ]);
    assert!(!success);
    assert!(stderr.contains("skip_frames"));
}
