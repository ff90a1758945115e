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

//! The local execution context: runs commands as one-shot child
//! processes of the user's shell, the same way `libshpool`'s
//! `daemon/shell.rs` spawns a shell, but without holding it open as a
//! pty-backed pool -- each `execute` call gets its own child. See
//! spec.md §4.C.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thop_protocol::{ExecuteResult, SessionKind};
use tracing::{info, instrument, warn};

use crate::consts;
use crate::error::{ErrorKind, ThopError};
use crate::session::{classify_cd, resolve_against, CdTarget, CmdContext, Session};
use crate::tty;
use crate::user;

pub struct LocalSession {
    name: String,
    shell: String,
    cwd: String,
    env: BTreeMap<String, String>,
    home: Option<String>,
}

impl LocalSession {
    pub fn new(name: impl Into<String>, shell: Option<String>, cwd: impl Into<String>) -> LocalSession {
        let info = user::info().ok();
        let shell = shell.or_else(|| info.as_ref().map(|i| i.default_shell.clone())).unwrap_or_else(|| "/bin/sh".to_string());
        let home = info.map(|i| i.home_dir);
        LocalSession { name: name.into(), shell, cwd: cwd.into(), env: BTreeMap::new(), home }
    }

    fn spawn(&self, cmd: &str) -> anyhow::Result<Child> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.cwd)
            .env("TERM", consts::DEFAULT_TERM)
            .env("CLICOLOR", "1")
            .env("CLICOLOR_FORCE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.env {
            command.env(k, v);
        }
        command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ThopError::new(ErrorKind::CommandNotFound, &self.name, format!("{}: command not found", cmd)).into()
            } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                ThopError::new(ErrorKind::PermissionDenied, &self.name, e.to_string()).into()
            } else {
                anyhow::Error::new(e).context("spawning local command")
            }
        })
    }

    /// Runs `cd && pwd` in the real shell so `~`, `..`, and symlinks
    /// resolve exactly the way the user's shell would resolve them,
    /// rather than reimplementing path canonicalization by hand.
    #[instrument(skip(self))]
    fn run_cd(&mut self, target: &str) -> anyhow::Result<ExecuteResult> {
        let resolved = resolve_against(&self.cwd, target);
        let probe = format!("cd {} && pwd", shell_words::quote(&resolved));
        let mut child = self.spawn(&probe)?;
        let output = child.wait_with_output().context("waiting on cd probe")?;

        if output.status.success() {
            let new_cwd = String::from_utf8_lossy(&output.stdout).trim().to_string();
            self.cwd = new_cwd;
            Ok(ExecuteResult { stdout: String::new(), stderr: String::new(), exit_code: 0 })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Ok(ExecuteResult { stdout: String::new(), stderr, exit_code: output.status.code().unwrap_or(1) })
        }
    }
}

impl Session for LocalSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Local
    }

    fn is_connected(&self) -> bool {
        // The local session is always reachable; "connected" just tracks
        // whether it's been selected/seeded, not any live resource.
        true
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    #[instrument(skip(self, ctx), fields(session = %self.name))]
    fn execute_with_context(&mut self, cmd: &str, ctx: &CmdContext) -> anyhow::Result<ExecuteResult> {
        match classify_cd(cmd, self.home.as_deref()) {
            CdTarget::Cd(target) => return self.run_cd(&target),
            CdTarget::NoHome => {
                return Ok(ExecuteResult {
                    stdout: String::new(),
                    stderr: "cd: HOME not set".to_string(),
                    exit_code: 1,
                })
            }
            CdTarget::NotCd => {}
        }

        let mut child = self.spawn(cmd)?;
        let mut stdout_pipe = child.stdout.take().context("child missing stdout pipe")?;
        let mut stderr_pipe = child.stderr.take().context("child missing stderr pipe")?;

        let (stdout_tx, stdout_rx) = mpsc::channel();
        let stdout_thread = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf);
            let _ = stdout_tx.send(buf);
        });
        let (stderr_tx, stderr_rx) = mpsc::channel();
        let stderr_thread = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf);
            let _ = stderr_tx.send(buf);
        });

        let start = Instant::now();
        let exit_status = loop {
            if let Some(status) = child.try_wait().context("polling child status")? {
                break status;
            }
            if ctx.is_cancelled() {
                info!("command cancelled after {:?}, killing child", start.elapsed());
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_thread.join();
                let _ = stderr_thread.join();
                return Ok(ExecuteResult {
                    stdout: stdout_rx.try_recv().map(|b| String::from_utf8_lossy(&b).to_string()).unwrap_or_default(),
                    stderr: "^C\n".to_string(),
                    exit_code: 130,
                });
            }
            if ctx.is_expired() {
                warn!("command exceeded its deadline after {:?}, killing child", start.elapsed());
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_thread.join();
                let _ = stderr_thread.join();
                return Err(ThopError::new(ErrorKind::CommandTimeout, &self.name, format!("command timed out after {:?}", start.elapsed())).retryable().into());
            }
            thread::sleep(consts::WATCHDOG_POLL_DURATION);
        };

        let stdout = stdout_thread.join().ok().and_then(|r| r.ok()).unwrap_or_default();
        let stderr = stderr_thread.join().ok().and_then(|r| r.ok()).unwrap_or_default();
        let stdout_rx_buf = stdout_rx.try_recv().unwrap_or(stdout);
        let stderr_rx_buf = stderr_rx.try_recv().unwrap_or(stderr);

        Ok(ExecuteResult {
            stdout: String::from_utf8_lossy(&stdout_rx_buf).to_string(),
            stderr: String::from_utf8_lossy(&stderr_rx_buf).to_string(),
            exit_code: exit_status.code().unwrap_or(-1),
        })
    }

    #[instrument(skip(self), fields(session = %self.name))]
    fn execute_interactive(&mut self) -> anyhow::Result<i32> {
        let pty_system = native_pty_system();
        let size = tty::Size::from_fd(0).unwrap_or(tty::Size { rows: 24, cols: 80 });
        let pair = pty_system
            .openpty(PtySize { rows: size.rows, cols: size.cols, pixel_width: 0, pixel_height: 0 })
            .context("opening local pty")?;

        let mut builder = CommandBuilder::new(&self.shell);
        builder.cwd(&self.cwd);
        builder.env("TERM", consts::DEFAULT_TERM);
        for (k, v) in &self.env {
            builder.env(k, v);
        }

        let mut child = pair.slave.spawn_command(builder).context("spawning interactive shell")?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().context("cloning pty reader")?;
        let mut writer = pair.master.take_writer().context("taking pty writer")?;

        let guard = tty::set_attach_flags()?;
        let copy_out = thread::spawn(move || {
            let mut buf = [0u8; consts::BUF_SIZE];
            let mut stdout = std::io::stdout();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).is_err() {
                            break;
                        }
                        let _ = stdout.flush();
                    }
                }
            }
        });

        let copy_in = thread::spawn(move || {
            let mut buf = [0u8; consts::BUF_SIZE];
            let mut stdin = std::io::stdin();
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let status = child.wait().context("waiting on interactive shell")?;
        drop(guard);
        let _ = copy_out.join();
        let _ = copy_in.join();

        Ok(status.exit_code() as i32)
    }

    fn get_cwd(&self) -> &str {
        &self.cwd
    }

    fn set_cwd(&mut self, cwd: String) {
        self.cwd = cwd;
    }

    fn get_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn session() -> LocalSession {
        LocalSession::new("local", Some("/bin/sh".to_string()), "/tmp")
    }

    #[test]
    fn executes_simple_command() -> anyhow::Result<()> {
        let mut s = session();
        let result = s.execute("echo hello")?;
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, 0);
        Ok(())
    }

    #[test]
    fn nonzero_exit_is_reported_without_error() -> anyhow::Result<()> {
        let mut s = session();
        let result = s.execute("exit 3")?;
        assert_eq!(result.exit_code, 3);
        Ok(())
    }

    #[test]
    fn cd_updates_cwd() -> anyhow::Result<()> {
        let mut s = session();
        s.execute("cd /")?;
        assert_eq!(s.get_cwd(), "/");
        Ok(())
    }

    #[test]
    fn cd_into_missing_dir_leaves_cwd_untouched() -> anyhow::Result<()> {
        let mut s = session();
        let before = s.get_cwd().to_string();
        let result = s.execute("cd /does/not/exist")?;
        assert_ne!(result.exit_code, 0);
        assert_eq!(s.get_cwd(), before);
        Ok(())
    }

    #[test]
    fn missing_command_inside_script_is_a_normal_nonzero_exit() -> anyhow::Result<()> {
        // A command the shell itself can't resolve is the shell's problem,
        // not thop's -- it comes back as exit 127, not a `spawn` error.
        let mut s = session();
        let result = s.execute("this-command-does-not-exist-anywhere")?;
        assert_eq!(result.exit_code, 127);
        Ok(())
    }

    #[test]
    fn missing_shell_binary_reports_command_not_found() {
        let mut s = LocalSession::new("local", Some("/no/such/thop-test-shell".to_string()), "/tmp");
        let err = s.execute("echo hi").unwrap_err();
        let te = crate::error::downcast(&err);
        assert_eq!(te.kind, ErrorKind::CommandNotFound);
    }

    #[test]
    fn cancellation_reports_exit_130() -> anyhow::Result<()> {
        let mut s = session();
        let ctx = CmdContext::unbounded();
        ctx.cancel();
        let result = s.execute_with_context("sleep 5", &ctx)?;
        assert_eq!(result.exit_code, 130);
        Ok(())
    }
}
