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

//! The persistent state store: a single JSON document recording the
//! active session and per-session cwd/env/connection status, protected
//! by advisory file locking so that multiple `thop` instances don't
//! clobber one another. See spec.md §4.A.

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use fs2::FileExt;
use thop_protocol::{PersistedSession, PersistentState, SessionKind};
use tracing::{info, instrument};

use crate::consts;
use crate::error::{ErrorKind, ThopError};

pub struct Store {
    path: PathBuf,
    state: Mutex<PersistentState>,
}

impl Store {
    /// Resolves the default state file path:
    /// `$XDG_DATA_HOME/thop/state.json`, falling back to
    /// `~/.local/share/thop/state.json`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let mut path = match env::var("XDG_DATA_HOME") {
            Ok(xdg) => PathBuf::from(xdg),
            Err(_) => {
                let home = env::var("HOME").context("no XDG_DATA_HOME or HOME set")?;
                PathBuf::from(home).join(".local").join("share")
            }
        };
        path.push("thop");
        path.push("state.json");
        Ok(path)
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Store> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("creating state dir")?;
            set_dir_mode(dir, 0o700)?;
        }

        let state = if !path.exists() {
            let cwd = env::current_dir().context("getting cwd")?.to_string_lossy().to_string();
            let mut sessions = BTreeMap::new();
            sessions.insert(
                consts::LOCAL_SESSION_NAME.to_string(),
                PersistedSession { r#type: SessionKind::Local, connected: true, cwd, env: BTreeMap::new() },
            );
            let seeded = PersistentState {
                active_session: consts::LOCAL_SESSION_NAME.to_string(),
                sessions,
                updated_at: Utc::now(),
            };
            write_locked(&path, &seeded).context("seeding initial state file")?;
            seeded
        } else {
            read_locked(&path)?
        };

        info!("loaded state with active_session={}", state.active_session);
        Ok(Store { path, state: Mutex::new(state) })
    }

    pub fn get_active_session(&self) -> String {
        self.state.lock().unwrap().active_session.clone()
    }

    pub fn get_all_sessions(&self) -> BTreeMap<String, PersistedSession> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn snapshot(&self) -> PersistentState {
        self.state.lock().unwrap().clone()
    }

    #[instrument(skip(self))]
    pub fn set_active_session(&self, name: &str) -> anyhow::Result<()> {
        self.mutate(|state| {
            state.active_session = name.to_string();
            state.sessions.entry(name.to_string()).or_default();
        })
    }

    #[instrument(skip(self))]
    pub fn set_session_connected(&self, name: &str, kind: SessionKind, connected: bool) -> anyhow::Result<()> {
        self.mutate(|state| {
            let entry = state.sessions.entry(name.to_string()).or_default();
            entry.r#type = kind;
            entry.connected = connected;
        })
    }

    #[instrument(skip(self))]
    pub fn set_session_cwd(&self, name: &str, cwd: &str) -> anyhow::Result<()> {
        self.mutate(|state| {
            state.sessions.entry(name.to_string()).or_default().cwd = cwd.to_string();
        })
    }

    #[instrument(skip(self))]
    pub fn set_session_env(&self, name: &str, env: BTreeMap<String, String>) -> anyhow::Result<()> {
        self.mutate(|state| {
            state.sessions.entry(name.to_string()).or_default().env = env;
        })
    }

    /// Applies `f` to a working copy of the state, persists the copy, and
    /// only swaps it into the committed in-memory state on a successful
    /// save -- so a failed write never leaves a partially-updated state
    /// visible to readers.
    fn mutate<F: FnOnce(&mut PersistentState)>(&self, f: F) -> anyhow::Result<()> {
        let mut guard = self.state.lock().unwrap();
        let mut working = guard.clone();
        f(&mut working);
        working.updated_at = Utc::now();
        write_locked(&self.path, &working).context("saving state")?;
        *guard = working;
        Ok(())
    }
}

fn read_locked(path: &Path) -> anyhow::Result<PersistentState> {
    let file = File::open(path).map_err(|e| {
        ThopError::new(ErrorKind::StateIOError, "", format!("opening state file: {}", e))
    })?;
    file.lock_shared().map_err(|e| ThopError::new(ErrorKind::StateIOError, "", format!("locking state file: {}", e)))?;

    let mut contents = String::new();
    let read_result = (&file).read_to_string(&mut contents);
    let _ = file.unlock();
    read_result.map_err(|e| ThopError::new(ErrorKind::StateIOError, "", format!("reading state file: {}", e)))?;

    serde_json::from_str(&contents)
        .map_err(|e| ThopError::new(ErrorKind::StateCorrupted, "", format!("parsing state file: {}", e)).into())
}

fn write_locked(path: &Path, state: &PersistentState) -> anyhow::Result<()> {
    let mut open_opts = OpenOptions::new();
    open_opts.create(true).truncate(true).write(true);
    #[cfg(unix)]
    open_opts.mode(0o600);

    let file = open_opts
        .open(path)
        .map_err(|e| ThopError::new(ErrorKind::StateIOError, "", format!("opening state file for write: {}", e)))?;
    file.lock_exclusive()
        .map_err(|e| ThopError::new(ErrorKind::StateIOError, "", format!("locking state file: {}", e)))?;

    let serialized = serde_json::to_vec_pretty(state)
        .map_err(|e| ThopError::new(ErrorKind::StateIOError, "", format!("serializing state: {}", e)))?;
    let write_result = (&file).write_all(&serialized);
    let _ = file.unlock();
    write_result.map_err(|e| ThopError::new(ErrorKind::StateIOError, "", format!("writing state file: {}", e)))?;

    #[cfg(unix)]
    set_file_mode(path, 0o600)?;

    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path, mode: u32) -> anyhow::Result<()> {
    let mut perms = fs::metadata(dir)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(dir, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seeds_local_session_on_first_load() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        let store = Store::load(&path)?;

        assert_eq!(store.get_active_session(), "local");
        assert!(store.get_all_sessions().contains_key("local"));
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn mutation_survives_reload() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        {
            let store = Store::load(&path)?;
            store.set_session_cwd("local", "/tmp/thopA")?;
            store.set_active_session("local")?;
        }

        let reloaded = Store::load(&path)?;
        assert_eq!(reloaded.get_all_sessions()["local"].cwd, "/tmp/thopA");
        Ok(())
    }

    #[test]
    fn corrupt_file_is_reported() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        fs::write(&path, b"not json at all")?;

        let result = Store::load(&path);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn env_round_trips() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        let store = Store::load(&path)?;

        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "1".to_string());
        store.set_session_env("local", env.clone())?;

        let reloaded = Store::load(&path)?;
        assert_eq!(reloaded.get_all_sessions()["local"].env, env);
        Ok(())
    }
}
