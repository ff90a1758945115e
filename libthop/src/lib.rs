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

use std::io;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod config;
pub mod consts;
pub mod error;
pub mod manager;
pub mod proxy;
pub mod rpc;
pub mod session;
pub mod ssh_config;
pub mod state;
mod tty;
mod user;

use config::SessionKind as ConfigSessionKind;
use error::downcast;
use manager::SessionManager;
use session::ssh::SshTarget;
use state::Store;

/// The command line arguments that thop expects. These can be directly
/// parsed with clap or manually constructed in order to present some
/// other user interface.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    #[clap(long, action, help = "Run the simpler stdin-to-active-session proxy loop instead of the JSON-RPC server")]
    pub proxy: bool,

    #[clap(short = 'c', long = "cmd", value_name = "CMD", help = "Run a single command against the active session and exit")]
    pub cmd: Option<String>,

    #[clap(long, action, help = "Print every configured session and its connection state, then exit")]
    pub status: bool,

    #[clap(long = "config", value_name = "PATH", action, help = "A toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(long, action, help = "Emit machine-readable JSON instead of plain text where it matters (--status)")]
    pub json: bool,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    pub verbose: u8,

    #[clap(short, long, action, help = "Suppress all but warning/error logs")]
    pub quiet: bool,
}

/// Runs the thop tool with the given arguments. Initializes logging,
/// config, and state, builds the session manager, and dispatches to
/// whichever external interface the flags select (§6): `--status`,
/// `-c <cmd>`, `--proxy`, or (the default) the JSON-RPC agent server on
/// stdio. Exits the process directly with the mapped exit code (§7),
/// the same way the teacher's own `run()` does for its subcommands.
pub fn run(args: Args) -> anyhow::Result<()> {
    init_logging(&args);

    let res = run_inner(&args);
    match res {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let te = downcast(&err);
            error!("{:?}", err);
            std::process::exit(te.kind.exit_code());
        }
    }
}

fn init_logging(args: &Args) {
    let trace_level = if args.quiet {
        tracing::Level::WARN
    } else if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(Mutex::new(io::stderr()))
        .init();
}

fn run_inner(args: &Args) -> anyhow::Result<i32> {
    let cfg = config::read_config(&args.config_file)?;

    let state_path = match &cfg.settings.state_file {
        Some(p) => std::path::PathBuf::from(p),
        None => Store::default_path()?,
    };
    let store = Arc::new(Store::load(&state_path)?);

    let timeout = std::time::Duration::from_secs(cfg.settings.command_timeout.unwrap_or(consts::DEFAULT_TIMEOUT.as_secs()));
    let manager = Arc::new(build_manager(&cfg, Arc::clone(&store), timeout)?);

    if let Some(default_session) = &cfg.settings.default_session {
        manager.set_active_session(default_session)?;
    }

    if args.status {
        return run_status(&manager, args.json);
    }

    if let Some(cmd) = &args.cmd {
        let stdout = io::stdout();
        let stderr = io::stderr();
        return proxy::run_once(&manager, cmd, stdout.lock(), stderr.lock());
    }

    if args.proxy {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let stderr = io::stderr();
        return proxy::run(&manager, stdin.lock(), stdout.lock(), stderr.lock());
    }

    let server = rpc::server::RpcServer::new(Arc::clone(&manager), cfg, Arc::clone(&store));
    let stdin = io::stdin();
    let stdout = io::stdout();
    server.run(stdin.lock(), stdout.lock())?;
    Ok(0)
}

fn run_status(manager: &SessionManager, json: bool) -> anyhow::Result<i32> {
    let sessions = manager.list_sessions();
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        for s in &sessions {
            println!("{}\t{}\t{}\t{}", s.name, s.kind, if s.connected { "connected" } else { "disconnected" }, s.cwd);
        }
    }
    Ok(0)
}

/// Builds the manager's session registry from configuration, resolving
/// SSH host parameters against `~/.ssh/config` the way spec.md §4.D
/// describes: unspecified host/user/port/identity_file fall back to the
/// resolver.
fn build_manager(cfg: &config::Config, store: Arc<Store>, timeout: std::time::Duration) -> anyhow::Result<SessionManager> {
    let reconnect_attempts = cfg.settings.reconnect_attempts.unwrap_or(consts::DEFAULT_RECONNECT_ATTEMPTS);
    let reconnect_backoff_base = cfg.settings.reconnect_backoff_base.unwrap_or(consts::DEFAULT_RECONNECT_BACKOFF_BASE);
    let manager = SessionManager::new(store, timeout, reconnect_attempts, reconnect_backoff_base);

    let ssh_config_path = dirs::home_dir().map(|h| h.join(".ssh").join("config")).context("resolving home dir for ssh config")?;
    let resolver = ssh_config::Resolver::load(&ssh_config_path)?;

    for (name, session_cfg) in &cfg.sessions {
        match session_cfg.kind {
            ConfigSessionKind::Local => {
                let cwd = std::env::current_dir()?.to_string_lossy().to_string();
                manager.register_local(name, session_cfg.shell.clone(), cwd);
            }
            ConfigSessionKind::Ssh => {
                let host = session_cfg.host.clone().unwrap_or_else(|| resolver.resolve_host(name));
                let user = session_cfg
                    .user
                    .clone()
                    .or_else(|| resolver.resolve_user(name))
                    .unwrap_or_else(|| std::env::var("USER").unwrap_or_default());
                let port = session_cfg
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| resolver.resolve_port(name));
                let identity_file = session_cfg
                    .identity_file
                    .clone()
                    .or_else(|| resolver.resolve_identity_file(name))
                    .map(std::path::PathBuf::from);
                let jump_host = session_cfg.jump_host.clone().or_else(|| resolver.resolve_proxy_jump(name));

                manager.register_ssh(
                    name,
                    SshTarget {
                        host,
                        port: port.parse().unwrap_or(consts::DEFAULT_SSH_PORT),
                        user,
                        identity_file,
                        jump_host,
                        startup_commands: session_cfg.startup_commands.clone(),
                    },
                );
            }
        }
    }

    Ok(manager)
}
