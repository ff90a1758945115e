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

//! The SSH execution context. Uses `ssh2` (libssh2 bindings), the
//! synchronous SSH client crate that fits the teacher's thread-based
//! concurrency model -- `libshpool` never pulls in an async runtime, so
//! neither does this. See spec.md §4.D.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use ssh2::{KnownHostFileKind, Session as Ssh2Session};
use thop_protocol::{ExecuteResult, SessionKind};
use tracing::{info, instrument, warn};

use crate::consts;
use crate::error::{ErrorKind, ThopError};
use crate::session::{classify_cd, resolve_against, CdTarget, CmdContext, Session};
use crate::tty;

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub jump_host: Option<String>,
    pub startup_commands: Vec<String>,
}

pub struct SshSession {
    name: String,
    target: SshTarget,
    session: Option<Ssh2Session>,
    cwd: String,
    env: BTreeMap<String, String>,
    reconnect_attempts: u32,
    reconnect_backoff_base: u64,
}

impl SshSession {
    pub fn new(name: impl Into<String>, target: SshTarget) -> SshSession {
        SshSession {
            name: name.into(),
            target,
            session: None,
            cwd: "~".to_string(),
            env: BTreeMap::new(),
            reconnect_attempts: consts::DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_backoff_base: consts::DEFAULT_RECONNECT_BACKOFF_BASE,
        }
    }

    /// Overrides the reconnect policy from configured
    /// `Settings.reconnect_attempts`/`reconnect_backoff_base` (spec.md
    /// §4.I), instead of always falling back to the hardcoded defaults.
    pub fn set_reconnect_policy(&mut self, attempts: u32, backoff_base: u64) {
        self.reconnect_attempts = attempts.max(1);
        self.reconnect_backoff_base = backoff_base.max(1);
    }

    /// Exposes the dial target so the manager can read `jump_host`/
    /// `host`/`port` through the `Session` trait object (see
    /// `SessionManager::connect`).
    pub(crate) fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Opens a direct-tcpip channel to `host:port` over this
    /// (already-connected) session and bridges it to a local loopback
    /// socket, since `ssh2::Session::set_tcp_stream` only accepts a
    /// concrete `TcpStream`, not an arbitrary `Read + Write` channel.
    /// Used as the jump-host leg of ProxyJump (spec.md §4.D).
    pub(crate) fn open_tunnel(&self, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let sess = self.session.as_ref().ok_or_else(|| {
            ThopError::new(ErrorKind::SessionNotConnected, &self.name, "jump session not connected")
        })?;
        let channel = sess
            .channel_direct_tcpip(host, port, None)
            .context("opening direct-tcpip channel through jump host")?;
        sess.set_blocking(false);
        spawn_tunnel_forwarder(channel)
    }

    /// Dials the target through an already-open TCP stream (typically
    /// the loopback tunnel from `open_tunnel`) instead of connecting to
    /// `self.target.host` directly.
    pub(crate) fn connect_with_tcp(&mut self, tcp: TcpStream) -> anyhow::Result<()> {
        let sess = self.handshake_and_auth(tcp)?;
        self.session = Some(sess);
        info!("connected to {} via jump tunnel", self.target.host);
        self.run_startup_commands()?;
        Ok(())
    }

    fn open_tcp(&self) -> anyhow::Result<TcpStream> {
        let addr = format!("{}:{}", self.target.host, self.target.port);
        TcpStream::connect(&addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ThopError::new(ErrorKind::ConnectionRefused, &self.name, e.to_string()).retryable().into()
            } else if e.kind() == std::io::ErrorKind::TimedOut {
                ThopError::new(ErrorKind::ConnectionTimeout, &self.name, e.to_string()).retryable().into()
            } else {
                anyhow::Error::new(e).context(format!("connecting to {}", addr))
            }
        })
    }

    fn handshake_and_auth(&self, tcp: TcpStream) -> anyhow::Result<Ssh2Session> {
        let mut sess = Ssh2Session::new().context("creating libssh2 session")?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| ThopError::new(ErrorKind::ConnectionFailed, &self.name, e.to_string()).retryable())?;

        self.verify_host_key(&sess)?;
        self.authenticate(&sess)?;

        if !sess.authenticated() {
            return Err(ThopError::new(ErrorKind::AuthPasswordRequired, &self.name, "no usable authentication method succeeded")
                .with_suggestion("configure an ssh-agent identity or an identity_file")
                .into());
        }
        Ok(sess)
    }

    fn verify_host_key(&self, sess: &Ssh2Session) -> anyhow::Result<()> {
        let mut known_hosts = sess.known_hosts().context("allocating known_hosts")?;
        let khs_path = dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"));
        if let Some(path) = &khs_path {
            if path.exists() {
                known_hosts
                    .read_file(path, KnownHostFileKind::OpenSSH)
                    .map_err(|e| ThopError::new(ErrorKind::HostKeyVerification, &self.name, e.to_string()))?;
            }
        }

        let (key, _key_type) = sess.host_key().ok_or_else(|| {
            ThopError::new(ErrorKind::HostKeyVerification, &self.name, "server presented no host key")
        })?;

        use ssh2::CheckResult;
        match known_hosts.check_port(&self.target.host, self.target.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => {
                // First contact: trust-on-first-use, matching standard ssh
                // client behavior for a fresh known_hosts entry. We don't
                // persist it back to disk here -- spec.md leaves unknown
                // host key handling on first contact as accept-and-proceed
                // rather than mutating the user's known_hosts file.
                Ok(())
            }
            CheckResult::Mismatch => Err(ThopError::new(
                ErrorKind::HostKeyChanged,
                &self.name,
                format!("host key for {} does not match known_hosts", self.target.host),
            )
            .into()),
            CheckResult::Failure => {
                Err(ThopError::new(ErrorKind::HostKeyUnknown, &self.name, "failure checking host key").into())
            }
        }
    }

    fn authenticate(&self, sess: &Ssh2Session) -> anyhow::Result<()> {
        if sess.userauth_agent(&self.target.user).is_ok() && sess.authenticated() {
            return Ok(());
        }

        if let Some(identity) = &self.target.identity_file {
            sess.userauth_pubkey_file(&self.target.user, None, identity, None)
                .map_err(|e| ThopError::new(ErrorKind::AuthKeyFailed, &self.name, e.to_string()))?;
        }

        Ok(())
    }

    fn run_startup_commands(&mut self) -> anyhow::Result<()> {
        let commands = self.target.startup_commands.clone();
        for cmd in commands {
            let result = self.execute(&cmd)?;
            if result.exit_code != 0 {
                warn!("startup command `{}` exited {}: {}", cmd, result.exit_code, result.stderr);
            }
        }
        Ok(())
    }

    /// Runs one command over a fresh exec channel, re-establishing cwd
    /// and env first since libssh2 exec channels don't carry shell state
    /// between invocations -- every remote command is effectively its own
    /// login shell, the same constraint the local session works around
    /// with one-shot `Command` spawns. Polls non-blocking so `ctx`'s
    /// deadline/cancellation can cut the command short, the same
    /// watchdog shape `LocalSession::execute_with_context` uses.
    fn exec_channel(&self, cmd: &str, ctx: &CmdContext) -> anyhow::Result<ExecuteResult> {
        let sess = self.session.as_ref().ok_or_else(|| {
            ThopError::new(ErrorKind::SessionNotConnected, &self.name, "not connected")
        })?;

        let mut channel = sess.channel_session().context("opening exec channel")?;

        let mut full_cmd = String::new();
        full_cmd.push_str(&format!("cd {} 2>/dev/null; ", shell_words::quote(&self.cwd)));
        for (k, v) in &self.env {
            full_cmd.push_str(&format!("export {}={}; ", k, shell_words::quote(v)));
        }
        full_cmd.push_str(cmd);

        channel.exec(&full_cmd).context("executing remote command")?;
        sess.set_blocking(false);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; consts::BUF_SIZE];
        loop {
            if ctx.is_cancelled() {
                let _ = channel.close();
                sess.set_blocking(true);
                return Ok(ExecuteResult {
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr: "^C\n".to_string(),
                    exit_code: 130,
                });
            }
            if ctx.is_expired() {
                let _ = channel.close();
                sess.set_blocking(true);
                return Err(ThopError::new(ErrorKind::CommandTimeout, &self.name, "command timed out").retryable().into());
            }

            let mut progressed = false;
            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    stdout.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    sess.set_blocking(true);
                    return Err(e).context("reading remote stdout");
                }
            }
            match channel.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    stderr.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    sess.set_blocking(true);
                    return Err(e).context("reading remote stderr");
                }
            }
            if channel.eof() {
                break;
            }
            if !progressed {
                thread::sleep(consts::WATCHDOG_POLL_DURATION);
            }
        }

        sess.set_blocking(true);
        channel.wait_close().context("closing exec channel")?;
        Ok(ExecuteResult {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code: channel.exit_status().unwrap_or(-1),
        })
    }

    fn run_cd(&mut self, target: &str) -> anyhow::Result<ExecuteResult> {
        let resolved = resolve_against(&self.cwd, target);
        let sess = self.session.as_ref().ok_or_else(|| {
            ThopError::new(ErrorKind::SessionNotConnected, &self.name, "not connected")
        })?;
        let mut channel = sess.channel_session().context("opening cd probe channel")?;
        let probe = format!("cd {} && pwd", shell_words::quote(&resolved));
        channel.exec(&probe).context("probing cd target")?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).context("reading cd probe stdout")?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr).context("reading cd probe stderr")?;
        channel.wait_close().context("closing cd probe channel")?;

        if channel.exit_status().unwrap_or(1) == 0 {
            self.cwd = stdout.trim().to_string();
            Ok(ExecuteResult { stdout: String::new(), stderr: String::new(), exit_code: 0 })
        } else {
            Ok(ExecuteResult { stdout: String::new(), stderr, exit_code: channel.exit_status().unwrap_or(1) })
        }
    }
}

impl Session for SshSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Ssh
    }

    fn is_connected(&self) -> bool {
        self.session.as_ref().map(|s| s.authenticated()).unwrap_or(false)
    }

    #[instrument(skip(self), fields(session = %self.name, host = %self.target.host))]
    fn connect(&mut self) -> anyhow::Result<()> {
        let mut last_err = None;
        for attempt in 0..self.reconnect_attempts.max(1) {
            match self.open_tcp().and_then(|tcp| self.handshake_and_auth(tcp)) {
                Ok(sess) => {
                    self.session = Some(sess);
                    info!("connected to {} after {} attempt(s)", self.target.host, attempt + 1);
                    self.run_startup_commands()?;
                    return Ok(());
                }
                Err(e) => {
                    let te = crate::error::downcast(&e);
                    if !matches!(te.kind, ErrorKind::ConnectionRefused | ErrorKind::ConnectionTimeout | ErrorKind::ConnectionFailed) {
                        // Auth/host-key failures are not retryable.
                        return Err(e);
                    }
                    last_err = Some(e);
                    if attempt + 1 < self.reconnect_attempts {
                        let backoff = Duration::from_secs(self.reconnect_backoff_base.saturating_pow(attempt + 1))
                            .min(consts::MAX_RECONNECT_BACKOFF);
                        warn!("connect attempt {} failed, retrying in {:?}", attempt + 1, backoff);
                        thread::sleep(backoff);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ThopError::new(ErrorKind::ConnectionFailed, &self.name, "exhausted reconnect attempts").retryable().into()))
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        if let Some(sess) = self.session.take() {
            let _ = sess.disconnect(None, "thop disconnect", None);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    #[instrument(skip(self, ctx), fields(session = %self.name))]
    fn execute_with_context(&mut self, cmd: &str, ctx: &CmdContext) -> anyhow::Result<ExecuteResult> {
        if !self.is_connected() {
            return Err(ThopError::new(ErrorKind::SessionNotConnected, &self.name, "not connected").into());
        }

        match classify_cd(cmd, Some("~")) {
            CdTarget::Cd(target) => return self.run_cd(&target),
            CdTarget::NoHome => unreachable!("ssh sessions always resolve bare cd to ~"),
            CdTarget::NotCd => {}
        }

        if ctx.is_cancelled() {
            return Ok(ExecuteResult { stdout: String::new(), stderr: "^C\n".to_string(), exit_code: 130 });
        }

        match self.exec_channel(cmd, ctx) {
            Ok(result) => Ok(result),
            Err(e) => {
                let te = crate::error::downcast(&e);
                if te.kind == ErrorKind::CommandTimeout {
                    return Err(e);
                }
                // The channel itself broke mid-command (not a deliberate
                // timeout/cancel) -- reconnect once and replay the
                // command. `exec_channel` re-applies cwd/env on every
                // call, so the retry already carries the right state.
                warn!("ssh channel broke mid-command ({}), reconnecting once", te.message);
                self.session = None;
                self.connect()?;
                self.exec_channel(cmd, ctx)
            }
        }
    }

    #[instrument(skip(self), fields(session = %self.name))]
    fn execute_interactive(&mut self) -> anyhow::Result<i32> {
        let sess = self.session.as_ref().ok_or_else(|| {
            ThopError::new(ErrorKind::SessionNotConnected, &self.name, "not connected")
        })?;

        let mut channel = sess.channel_session().context("opening interactive channel")?;
        let size = tty::Size::from_fd(0).unwrap_or(tty::Size { rows: 24, cols: 80 });
        channel
            .request_pty(consts::DEFAULT_TERM, None, Some((size.cols as u32, size.rows as u32, 0, 0)))
            .context("requesting remote pty")?;
        channel.shell().context("starting remote shell")?;

        let guard = tty::set_attach_flags()?;
        sess.set_blocking(false);

        let mut stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; consts::BUF_SIZE];

        loop {
            match channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    stdout.write_all(&buf[..n])?;
                    stdout.flush()?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e).context("reading from remote pty"),
            }

            if channel.eof() {
                break;
            }

            // A best-effort, non-blocking pass over local stdin; real
            // terminal multiplexing would use `poll(2)` across both fds,
            // but without an async runtime in play a short sleep keeps
            // this loop from spinning at full CPU.
            thread::sleep(Duration::from_millis(10));
            let mut local = [0u8; consts::BUF_SIZE];
            if let Ok(n) = stdin.read(&mut local) {
                if n > 0 {
                    let _ = channel.write_all(&local[..n]);
                }
            }
        }

        drop(guard);
        sess.set_blocking(true);
        channel.wait_close().context("closing interactive channel")?;
        Ok(channel.exit_status().unwrap_or(-1))
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

/// Bridges a direct-tcpip channel opened on a jump host's session to a
/// local loopback socket, since `ssh2::Session::set_tcp_stream` only
/// accepts a concrete `TcpStream`, not an arbitrary `Read + Write`
/// channel. The spawned thread owns the channel for its lifetime and
/// exits once either side closes.
fn spawn_tunnel_forwarder(mut channel: ssh2::Channel) -> anyhow::Result<TcpStream> {
    let listener = TcpListener::bind("127.0.0.1:0").context("binding local tunnel endpoint")?;
    let local_addr = listener.local_addr().context("reading local tunnel endpoint address")?;

    thread::spawn(move || {
        let (mut local, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let mut local_reader = match local.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let _ = local_reader.set_nonblocking(true);

        let mut buf = [0u8; consts::BUF_SIZE];
        loop {
            let mut progressed = false;
            match channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if local.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
            match local_reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if channel.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
            if channel.eof() {
                break;
            }
            if !progressed {
                thread::sleep(Duration::from_millis(5));
            }
        }
        let _ = channel.close();
    });

    TcpStream::connect(local_addr).context("connecting to local tunnel endpoint")
}

#[cfg(test)]
mod test {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "example.invalid".to_string(),
            port: consts::DEFAULT_SSH_PORT,
            user: "alice".to_string(),
            identity_file: None,
            jump_host: None,
            startup_commands: Vec::new(),
        }
    }

    #[test]
    fn not_connected_until_connect_called() {
        let session = SshSession::new("devbox", target());
        assert!(!session.is_connected());
    }

    #[test]
    fn execute_before_connect_is_session_not_connected() {
        let mut session = SshSession::new("devbox", target());
        let err = session.execute("echo hi").unwrap_err();
        let te = crate::error::downcast(&err);
        assert_eq!(te.kind, ErrorKind::SessionNotConnected);
    }

    #[test]
    fn connect_to_closed_port_is_connection_refused() {
        // Binding a listener and dropping it immediately frees the port
        // while guaranteeing nothing answers it, so the connect attempt
        // fails fast with ECONNREFUSED instead of depending on network
        // reachability or timeouts.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut target = target();
        target.host = "127.0.0.1".to_string();
        target.port = port;
        let mut session = SshSession::new("devbox", target);
        session.reconnect_attempts = 1;
        let err = session.connect().unwrap_err();
        let te = crate::error::downcast(&err);
        assert!(matches!(
            te.kind,
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionTimeout | ErrorKind::ConnectionFailed
        ));
    }
}
