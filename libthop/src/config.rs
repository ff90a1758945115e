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

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();

    let config_str = if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        Some(fs::read_to_string(config_path).context("reading config toml (explicit path)")?)
    } else if let Ok(env_path) = env::var("THOP_CONFIG") {
        info!("parsing config from THOP_CONFIG ({})", env_path);
        Some(fs::read_to_string(&env_path).context("reading config toml (THOP_CONFIG)")?)
    } else {
        let path = default_config_path()?;
        if path.exists() {
            Some(fs::read_to_string(&path).context("reading config toml (default path)")?)
        } else {
            None
        }
    };

    if let Some(s) = config_str {
        config = toml::from_str(&s).context("parsing config file")?;
    }

    if let Ok(session) = env::var("THOP_DEFAULT_SESSION") {
        config.settings.default_session = Some(session);
    }
    if let Ok(level) = env::var("THOP_LOG_LEVEL") {
        config.settings.log_level = Some(level);
    }
    if let Ok(state_file) = env::var("THOP_STATE_FILE") {
        config.settings.state_file = Some(state_file);
    }

    config.ensure_local_session();

    Ok(config)
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let mut path = match env::var("XDG_CONFIG_HOME") {
        Ok(xdg) => PathBuf::from(xdg),
        Err(_) => {
            let home = env::var("HOME").context("no XDG_CONFIG_HOME or HOME set")?;
            PathBuf::from(home).join(".config")
        }
    };
    path.push("thop");
    path.push("config.toml");
    Ok(path)
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionConfig>,
}

impl Config {
    /// A `local` session is implicitly added if the config doesn't
    /// mention one, per spec.md §6.
    fn ensure_local_session(&mut self) {
        self.sessions.entry(consts::LOCAL_SESSION_NAME.to_string()).or_insert_with(|| SessionConfig {
            kind: SessionKind::Local,
            shell: None,
            host: None,
            user: None,
            port: None,
            identity_file: None,
            jump_host: None,
            startup_commands: Vec::new(),
        });
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Settings {
    pub default_session: Option<String>,
    pub command_timeout: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_backoff_base: Option<u64>,
    pub log_level: Option<String>,
    pub state_file: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Ssh,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub shell: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub jump_host: Option<String>,
    #[serde(default)]
    pub startup_commands: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal() -> anyhow::Result<()> {
        let toml_str = r#"
            [settings]
            default_session = "local"
            command_timeout = 30

            [sessions.devbox]
            type = "ssh"
            host = "dev.example.com"
            user = "alice"
        "#;
        let mut config: Config = toml::from_str(toml_str)?;
        config.ensure_local_session();

        assert_eq!(config.settings.command_timeout, Some(30));
        assert!(config.sessions.contains_key("local"));
        assert_eq!(config.sessions["devbox"].host.as_deref(), Some("dev.example.com"));
        Ok(())
    }

    #[test]
    fn empty_config_still_has_local() {
        let mut config = Config::default();
        config.ensure_local_session();
        assert_eq!(config.sessions["local"].kind, SessionKind::Local);
    }
}
