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

//! The session manager: a name-keyed registry of live sessions plus the
//! notion of an "active" one, mirroring the way `libshpool`'s
//! `daemon/server.rs` keeps a `Mutex`-guarded map of live sessions behind
//! a lock that's released before any blocking I/O runs. See spec.md §4.E.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thop_protocol::{ExecuteResult, SessionKind, SessionSnapshot};
use tracing::{info, instrument};

use crate::consts;
use crate::error::{ErrorKind, ThopError};
use crate::session::{local::LocalSession, ssh::SshSession, CmdContext, Session};
use crate::state::Store;

type SessionHandle = Arc<Mutex<Box<dyn Session>>>;

pub struct SessionManager {
    sessions: Mutex<BTreeMap<String, SessionHandle>>,
    active: Mutex<String>,
    store: Arc<Store>,
    timeout: std::time::Duration,
    reconnect_attempts: u32,
    reconnect_backoff_base: u64,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        timeout: std::time::Duration,
        reconnect_attempts: u32,
        reconnect_backoff_base: u64,
    ) -> SessionManager {
        let active = store.get_active_session();
        SessionManager {
            sessions: Mutex::new(BTreeMap::new()),
            active: Mutex::new(active),
            store,
            timeout,
            reconnect_attempts,
            reconnect_backoff_base,
        }
    }

    /// Registers a session under `name`, lazily -- sessions aren't
    /// constructed until first referenced, since constructing an
    /// `SshSession` shouldn't imply dialing out. Restores `cwd`/`env`
    /// from a prior run's persisted state if the store already knows
    /// about this session (invariant 1, spec.md §8), falling back to
    /// `default_cwd` for a session seen for the first time.
    pub fn register_local(&self, name: &str, shell: Option<String>, default_cwd: impl Into<String>) {
        let persisted = self.store.get_all_sessions().get(name).cloned();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(name.to_string()).or_insert_with(|| {
            let mut session = LocalSession::new(name, shell, default_cwd.into());
            if let Some(p) = persisted {
                if !p.cwd.is_empty() {
                    session.set_cwd(p.cwd);
                }
                session.set_env(p.env);
            }
            Arc::new(Mutex::new(Box::new(session) as Box<dyn Session>))
        });
    }

    pub fn register_ssh(&self, name: &str, target: crate::session::ssh::SshTarget) {
        let persisted = self.store.get_all_sessions().get(name).cloned();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(name.to_string()).or_insert_with(|| {
            let mut session = SshSession::new(name, target);
            session.set_reconnect_policy(self.reconnect_attempts, self.reconnect_backoff_base);
            if let Some(p) = persisted {
                if !p.cwd.is_empty() {
                    session.set_cwd(p.cwd);
                }
                session.set_env(p.env);
            }
            Arc::new(Mutex::new(Box::new(session) as Box<dyn Session>))
        });
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(name)
    }

    /// Connects the named session, dialing through a configured jump
    /// host first when one is set (spec.md §4.D ProxyJump): the jump
    /// session is connected recursively, then a direct-tcpip tunnel
    /// opened on it is handed to the target session in place of a
    /// direct dial. Neither leg holds the registry lock while dialing.
    #[instrument(skip(self))]
    pub fn connect(&self, name: &str) -> anyhow::Result<()> {
        if self.with_session_mut(name, |session| Ok(session.is_connected()))? {
            return Ok(());
        }

        let jump_name = self.with_session_mut(name, |session| {
            Ok(session.as_any_mut().downcast_mut::<SshSession>().and_then(|s| s.target().jump_host.clone()))
        })?;

        match jump_name {
            Some(jump_name) => {
                self.connect(&jump_name)?;
                let (host, port) = self.with_session_mut(name, |session| {
                    let ssh = session
                        .as_any_mut()
                        .downcast_mut::<SshSession>()
                        .expect("jump_host is only ever set on an SshTarget");
                    Ok((ssh.target().host.clone(), ssh.target().port))
                })?;
                let tunnel = self.with_session_mut(&jump_name, |session| {
                    let jump_ssh = session.as_any_mut().downcast_mut::<SshSession>().ok_or_else(|| {
                        ThopError::new(ErrorKind::OperationFailed, &jump_name, "jump_host session is not an SSH session")
                    })?;
                    jump_ssh.open_tunnel(&host, port)
                })?;
                self.with_session_mut(name, |session| {
                    let ssh = session
                        .as_any_mut()
                        .downcast_mut::<SshSession>()
                        .expect("jump_host is only ever set on an SshTarget");
                    ssh.connect_with_tcp(tunnel)
                })?;
            }
            None => {
                self.with_session_mut(name, |session| session.connect())?;
            }
        }

        self.store.set_session_connected(name, self.kind_of(name)?, true)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn disconnect(&self, name: &str) -> anyhow::Result<()> {
        if name == consts::LOCAL_SESSION_NAME {
            return Err(ThopError::new(ErrorKind::CannotCloseLocal, name, "the local session cannot be closed").into());
        }
        self.with_session_mut(name, |session| session.disconnect())?;
        self.store.set_session_connected(name, self.kind_of(name)?, false)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_active_session(&self, name: &str) -> anyhow::Result<()> {
        if !self.has_session(name) {
            return Err(ThopError::new(ErrorKind::SessionNotFound, name, "no such session").into());
        }
        if self.kind_of(name)? == SessionKind::Ssh && !self.with_session_mut(name, |s| Ok(s.is_connected()))? {
            self.connect(name)?;
        }
        *self.active.lock().unwrap() = name.to_string();
        self.store.set_active_session(name)?;
        info!("active session is now {}", name);
        Ok(())
    }

    pub fn get_active_session_name(&self) -> String {
        self.active.lock().unwrap().clone()
    }

    #[instrument(skip(self, ctx))]
    pub fn execute(&self, name: &str, cmd: &str, ctx: &CmdContext) -> anyhow::Result<ExecuteResult> {
        let ctx = ctx.clone().with_default_deadline(self.timeout);
        let result = self.with_session_mut(name, |session| {
            if !session.is_connected() {
                return Err(ThopError::new(ErrorKind::SessionNotConnected, name, "not connected").into());
            }
            session.execute_with_context(cmd, &ctx)
        })?;
        self.sync_cwd_env(name)?;
        Ok(result)
    }

    #[instrument(skip(self))]
    pub fn execute_interactive(&self, name: &str) -> anyhow::Result<i32> {
        let result = self.with_session_mut(name, |session| session.execute_interactive())?;
        self.sync_cwd_env(name)?;
        Ok(result)
    }

    pub fn get_session_snapshot(&self, name: &str) -> anyhow::Result<SessionSnapshot> {
        self.with_session_mut(name, |session| {
            Ok(SessionSnapshot {
                name: session.name().to_string(),
                kind: session.kind(),
                connected: session.is_connected(),
                cwd: session.get_cwd().to_string(),
                env: session.get_env().clone(),
                timeout_secs: self.timeout.as_secs(),
            })
        })
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.values().cloned().collect()
        };
        handles
            .iter()
            .map(|handle| {
                let session = handle.lock().unwrap();
                SessionSnapshot {
                    name: session.name().to_string(),
                    kind: session.kind(),
                    connected: session.is_connected(),
                    cwd: session.get_cwd().to_string(),
                    env: session.get_env().clone(),
                    timeout_secs: self.timeout.as_secs(),
                }
            })
            .collect()
    }

    fn kind_of(&self, name: &str) -> anyhow::Result<SessionKind> {
        self.with_session_mut(name, |session| Ok(session.kind()))
    }

    fn sync_cwd_env(&self, name: &str) -> anyhow::Result<()> {
        let (cwd, env) =
            self.with_session_mut(name, |session| Ok((session.get_cwd().to_string(), session.get_env().clone())))?;
        self.store.set_session_cwd(name, &cwd)?;
        self.store.set_session_env(name, env)?;
        Ok(())
    }

    /// Runs `f` against the named session, holding the registry lock
    /// only long enough to clone out its `Arc` -- `f` itself may block
    /// on network I/O (an SSH exec round trip or handshake), and must
    /// run under nothing but that session's own lock so a stalled
    /// session cannot stall calls against any other session (spec.md
    /// §5: "Commands to different sessions may execute concurrently").
    fn with_session_mut<T>(&self, name: &str, f: impl FnOnce(&mut Box<dyn Session>) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let handle = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(name).cloned()
        }
        .ok_or_else(|| ThopError::new(ErrorKind::SessionNotFound, name, "no such session"))?;
        let mut session = handle.lock().unwrap();
        f(&mut session)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (SessionManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(Store::load(&path).unwrap());
        let manager = SessionManager::new(
            store,
            consts::DEFAULT_TIMEOUT,
            consts::DEFAULT_RECONNECT_ATTEMPTS,
            consts::DEFAULT_RECONNECT_BACKOFF_BASE,
        );
        manager.register_local(consts::LOCAL_SESSION_NAME, Some("/bin/sh".to_string()), "/tmp");
        (manager, dir)
    }

    #[test]
    fn local_session_is_connected_by_default() {
        let (manager, _dir) = manager();
        let snap = manager.get_session_snapshot("local").unwrap();
        assert!(snap.connected);
    }

    #[test]
    fn cannot_close_local_session() {
        let (manager, _dir) = manager();
        let err = manager.disconnect("local").unwrap_err();
        let te = crate::error::downcast(&err);
        assert_eq!(te.kind, ErrorKind::CannotCloseLocal);
    }

    #[test]
    fn execute_runs_against_named_session() -> anyhow::Result<()> {
        let (manager, _dir) = manager();
        let result = manager.execute("local", "echo hi", &CmdContext::unbounded())?;
        assert_eq!(result.stdout.trim(), "hi");
        Ok(())
    }

    #[test]
    fn set_active_session_rejects_unknown_name() {
        let (manager, _dir) = manager();
        let err = manager.set_active_session("ghost").unwrap_err();
        let te = crate::error::downcast(&err);
        assert_eq!(te.kind, ErrorKind::SessionNotFound);
    }
}
