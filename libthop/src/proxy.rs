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

//! The simpler stdin→active-session→stdout front end, for agent
//! integrations that don't want to speak JSON-RPC. See spec.md §4.G.

use std::io::{BufRead, Write};

use tracing::{instrument, warn};

use crate::error::downcast;
use crate::manager::SessionManager;
use crate::session::CmdContext;

/// Runs a single command against the active session and returns the
/// mapped CLI exit code (§6/§7: 0 success, 1 general, 2 auth, 3
/// host-key).
#[instrument(skip(manager))]
pub fn run_once(manager: &SessionManager, cmd: &str, mut out: impl Write, mut err: impl Write) -> anyhow::Result<i32> {
    let session_name = manager.get_active_session_name();
    match manager.execute(&session_name, cmd, &CmdContext::unbounded()) {
        Ok(result) => {
            write_terminated(&mut out, &result.stdout)?;
            write_terminated(&mut err, &result.stderr)?;
            Ok(result.exit_code)
        }
        Err(e) => {
            let te = downcast(&e);
            write_terminated(&mut err, &format!("thop: {}", te))?;
            Ok(te.kind.exit_code())
        }
    }
}

/// Reads commands from `input` one per line, routes each to the active
/// session, and writes results to `out`/`err`. Continues after a
/// per-command error; only EOF ends the loop (always exit 0).
#[instrument(skip_all)]
pub fn run<R: BufRead>(manager: &SessionManager, input: R, mut out: impl Write, mut err: impl Write) -> anyhow::Result<i32> {
    for line in input.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("error reading proxy input: {}", e);
                break;
            }
        };
        let cmd = line.trim_end_matches(['\r', '\n']);
        if cmd.is_empty() {
            continue;
        }
        run_once(manager, cmd, &mut out, &mut err)?;
    }
    Ok(0)
}

fn write_terminated(w: &mut impl Write, s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        return Ok(());
    }
    w.write_all(s.as_bytes())?;
    if !s.ends_with('\n') {
        w.write_all(b"\n")?;
    }
    Ok(())
}
