use std::io::Write;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn labrun() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_labrun"));
    cmd.current_dir(env!("CARGO_MANIFEST_DIR"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn testdata(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

/// Writes a config using the test job template and the given bkr command.
fn config_with_command(command: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        "[runner]\njobtemplate = {:?}\nwatchdelay_secs = 0\n\n[bkr]\ncommand = {:?}\nretries = 1\nretry_delay_secs = 0\n",
        testdata("job.xml").display().to_string(),
        command
    )
    .unwrap();
    file
}

#[test]
fn test_help_lists_subcommands() {
    labrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_validate_example_config() {
    labrun()
        .args(["--config", "testdata/config.toml", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Max aborted: 3"));
}

#[test]
fn test_validate_missing_config_fails() {
    labrun()
        .args(["--config", "does-not-exist.toml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does-not-exist.toml"));
}

#[test]
fn test_run_requires_url_and_release() {
    labrun()
        .args(["--config", "testdata/config.toml", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--url"));
}

#[cfg(unix)]
#[test]
fn test_run_without_wait_prints_job_ids() {
    let config = config_with_command(r#"sh -c "cat >/dev/null; echo \"Submitted: ['J:42']\"""#);
    labrun()
        .arg("--config")
        .arg(config.path())
        .args(["run", "--url", "https://example.com/kernel.tar.gz", "--release", "4.17.0"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("J:42"));
}

#[cfg(unix)]
#[test]
fn test_run_with_failing_tool_exits_with_error_code() {
    let config = config_with_command("sh -c \"cat >/dev/null; exit 1\"");
    labrun()
        .arg("--config")
        .arg(config.path())
        .args(["run", "--url", "https://example.com/kernel.tar.gz", "--release", "4.17.0"])
        .assert()
        .code(2);
}
