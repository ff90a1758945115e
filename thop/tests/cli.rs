// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests that spawn the `thop` binary itself, the way
//! `shpool`'s `tests/attach.rs` spawns the daemon binary -- here with
//! `assert_cmd` rather than the teacher's hand-rolled `cargo
//! --message-format=json` binary finder, since thop has no daemon
//! socket to wait on: each invocation is a single short-lived process.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn thop_cmd(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("thop").unwrap();
    cmd.env("HOME", home);
    cmd.env("XDG_CONFIG_HOME", home.join("config"));
    cmd.env("XDG_DATA_HOME", home.join("data"));
    cmd.env_remove("THOP_CONFIG");
    cmd.env_remove("THOP_STATE_FILE");
    cmd
}

#[test]
fn status_on_empty_config_lists_local_session() {
    let home = tempdir().unwrap();
    thop_cmd(home.path())
        .arg("--status")
        .assert()
        .success()
        .stdout(predicate::str::contains("local"));
}

#[test]
fn status_json_parses_as_single_element_array() {
    let home = tempdir().unwrap();
    let output = thop_cmd(home.path()).arg("--status").arg("--json").output().unwrap();
    assert!(output.status.success());
    let parsed: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0]["name"], "local");
}

#[test]
fn one_shot_command_prints_stdout_and_exits_zero() {
    let home = tempdir().unwrap();
    thop_cmd(home.path())
        .arg("-c")
        .arg("echo hello-from-thop")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello-from-thop"));
}

#[test]
fn one_shot_command_propagates_nonzero_exit_code() {
    let home = tempdir().unwrap();
    thop_cmd(home.path()).arg("-c").arg("exit 7").assert().code(7);
}

#[test]
fn cd_persists_across_invocations_via_state_file() {
    let home = tempdir().unwrap();
    thop_cmd(home.path()).arg("-c").arg("mkdir -p /tmp/thop-cli-test-a").assert().success();
    thop_cmd(home.path()).arg("-c").arg("cd /tmp/thop-cli-test-a").assert().success();
    thop_cmd(home.path())
        .arg("-c")
        .arg("pwd")
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/thop-cli-test-a"));
}

#[test]
fn proxy_loop_runs_multiple_lines_and_exits_zero_on_eof() {
    let home = tempdir().unwrap();
    thop_cmd(home.path())
        .arg("--proxy")
        .write_stdin("echo one\necho two\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("one"))
        .stdout(predicate::str::contains("two"));
}
