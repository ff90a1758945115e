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

//! The polymorphic session contract. Local and SSH sessions share one
//! capability set (`Session`); we implement it as a tagged struct per
//! kind plus a dispatch trait object rather than leaning on inheritance,
//! the same shape the teacher gives its `Hooks` trait in `hooks.rs`.

pub mod local;
pub mod ssh;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thop_protocol::{ExecuteResult, SessionKind};

/// The cooperative-cancellation/timeout bound passed into every execute
/// call. Rust has no stdlib equivalent to Go's `context.Context` (the
/// idiom spec.md's interface was originally described in), so this is
/// the one small abstraction this crate introduces that has no direct
/// counterpart in the teacher -- `libshpool` never needed cancellation
/// because its commands run inside an already-open pty, not per-call.
#[derive(Clone)]
pub struct CmdContext {
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl CmdContext {
    pub fn unbounded() -> CmdContext {
        CmdContext { deadline: None, cancel: Arc::new(AtomicBool::new(false)) }
    }

    pub fn with_timeout(timeout: Duration) -> CmdContext {
        CmdContext { deadline: Some(Instant::now() + timeout), cancel: Arc::new(AtomicBool::new(false)) }
    }

    /// Rebuilds `ctx` sharing `cancel` as its cancellation flag, keeping
    /// `ctx`'s deadline. Used by the RPC server to splice a per-request
    /// flag (flipped by an advisory `cancelled` notification) into the
    /// context passed down to `Manager::execute`.
    pub fn linked(ctx: CmdContext, cancel: Arc<AtomicBool>) -> CmdContext {
        CmdContext { deadline: ctx.deadline, cancel }
    }

    /// Fills in `timeout` as the deadline if `self` doesn't already have
    /// one. Used by `Manager::execute` so the Session-level default
    /// timeout (spec.md §3) applies even when a caller hands in an
    /// unbounded context.
    pub fn with_default_deadline(mut self, timeout: Duration) -> CmdContext {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + timeout);
        }
        self
    }

    /// A handle that a different thread (e.g. a SIGINT handler) can use
    /// to cancel this context.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}

/// The shared capability set every session kind implements:
/// `{Name, Type, Connect, Disconnect, IsConnected, Execute,
/// ExecuteWithContext, ExecuteInteractive, GetCWD, SetCWD, GetEnv,
/// SetEnv}` from spec.md §9.
pub trait Session: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> SessionKind;
    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> anyhow::Result<()>;
    fn disconnect(&mut self) -> anyhow::Result<()>;

    /// Lets the manager reach SSH-only behavior (ProxyJump) through the
    /// trait object without widening this trait for every session kind.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    fn execute(&mut self, cmd: &str) -> anyhow::Result<ExecuteResult> {
        self.execute_with_context(cmd, &CmdContext::unbounded())
    }
    fn execute_with_context(&mut self, cmd: &str, ctx: &CmdContext) -> anyhow::Result<ExecuteResult>;

    /// Runs the session's shell attached to a pty, mirroring stdin/stdout
    /// until the shell exits. Returns the shell's exit code.
    fn execute_interactive(&mut self) -> anyhow::Result<i32>;

    fn get_cwd(&self) -> &str;
    fn set_cwd(&mut self, cwd: String);
    fn get_env(&self) -> &BTreeMap<String, String>;
    fn set_env(&mut self, env: BTreeMap<String, String>);
}

/// Shared `cd`/`cd <path>` recognition, used identically by
/// `LocalSession` and `SshSession::execute` since neither a one-shot
/// child process nor a remote exec channel persists shell state across
/// commands (spec.md §4.C / §9).
#[derive(Debug, PartialEq, Eq)]
pub enum CdTarget {
    /// Not a bare `cd` invocation; run the command normally.
    NotCd,
    /// A `cd` invocation, resolved to the (possibly relative) path that
    /// should be canonicalized and `cd`'d into.
    Cd(String),
    /// `cd` with no `$HOME` set.
    NoHome,
}

pub fn classify_cd(cmd: &str, home: Option<&str>) -> CdTarget {
    let trimmed = cmd.trim();
    let rest = if trimmed == "cd" {
        Some("")
    } else {
        trimmed.strip_prefix("cd ")
    };
    let Some(rest) = rest else {
        return CdTarget::NotCd;
    };

    // Only treat this as the builtin if the whole command is a simple
    // `cd [path]` -- if there's a shell operator in play (`&&`, `;`,
    // `|`, redirection) we let the real shell handle the whole thing.
    if rest.contains(['&', ';', '|', '>', '<']) {
        return CdTarget::NotCd;
    }

    let arg = rest.trim();
    if arg.is_empty() {
        return match home {
            Some(h) => CdTarget::Cd(h.to_string()),
            None => CdTarget::NoHome,
        };
    }

    if let Some(rest) = arg.strip_prefix('~') {
        if let Some(h) = home {
            return CdTarget::Cd(format!("{}{}", h, rest));
        }
    }

    CdTarget::Cd(arg.to_string())
}

/// Resolves a (possibly relative) `cd` target against the session's
/// current working directory.
pub fn resolve_against(cwd: &str, target: &str) -> String {
    if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), target)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_plain_cd() {
        assert_eq!(classify_cd("cd", Some("/home/alice")), CdTarget::Cd("/home/alice".to_string()));
    }

    #[test]
    fn classify_cd_no_home() {
        assert_eq!(classify_cd("cd", None), CdTarget::NoHome);
    }

    #[test]
    fn classify_cd_with_path() {
        assert_eq!(classify_cd("cd /tmp/thopA", Some("/home/alice")), CdTarget::Cd("/tmp/thopA".to_string()));
    }

    #[test]
    fn classify_cd_tilde() {
        assert_eq!(classify_cd("cd ~/projects", Some("/home/alice")), CdTarget::Cd("/home/alice/projects".to_string()));
    }

    #[test]
    fn classify_non_cd() {
        assert_eq!(classify_cd("echo cd", Some("/home/alice")), CdTarget::NotCd);
    }

    #[test]
    fn classify_cd_with_operator_is_not_builtin() {
        assert_eq!(classify_cd("cd /tmp && ls", Some("/home/alice")), CdTarget::NotCd);
    }

    #[test]
    fn resolve_relative_path() {
        assert_eq!(resolve_against("/home/alice", "projects"), "/home/alice/projects");
    }

    #[test]
    fn resolve_absolute_path_unchanged() {
        assert_eq!(resolve_against("/home/alice", "/tmp/thopA"), "/tmp/thopA");
    }
}
