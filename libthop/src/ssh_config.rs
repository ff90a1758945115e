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

//! A small parser for the subset of OpenSSH client config syntax thop
//! needs in order to resolve a host alias to connection parameters.
//! Pulling in a dedicated ssh-config crate would be overkill for the
//! handful of directives we care about, so this hand-rolls the parse the
//! same way the teacher's `config.rs` hand-parses its own config shapes.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{instrument, warn};

pub const DEFAULT_PORT: &str = "22";

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<String>,
    pub identity_file: Option<String>,
    pub proxy_jump: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    hosts: HashMap<String, HostConfig>,
}

impl Resolver {
    /// Loads and parses an OpenSSH client config file. A missing file is
    /// not an error -- the resolver just returns an empty map.
    #[instrument(skip_all)]
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Resolver> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Resolver::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(Resolver::parse(&contents))
    }

    pub fn parse(contents: &str) -> Resolver {
        let mut hosts: HashMap<String, HostConfig> = HashMap::new();
        let mut current_aliases: Vec<String> = Vec::new();

        for raw_line in contents.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match split_directive(line) {
                Some(kv) => kv,
                None => continue,
            };
            let key_lower = key.to_lowercase();

            if key_lower == "host" {
                current_aliases = value
                    .split_whitespace()
                    .filter(|pat| !pat.contains('*') && !pat.contains('?'))
                    .map(|s| s.to_string())
                    .collect();
                for alias in &current_aliases {
                    hosts.entry(alias.clone()).or_default();
                }
                continue;
            }

            if current_aliases.is_empty() {
                // Directive outside of any (non-wildcard) Host block we
                // track -- e.g. a global default or a wildcard-only block.
                continue;
            }

            for alias in &current_aliases {
                let entry = hosts.entry(alias.clone()).or_default();
                match key_lower.as_str() {
                    "hostname" => entry.hostname.get_or_insert(value.clone()),
                    "user" => entry.user.get_or_insert(value.clone()),
                    "port" => entry.port.get_or_insert(value.clone()),
                    "identityfile" => entry.identity_file.get_or_insert(expand_tilde(&value)),
                    "proxyjump" => entry.proxy_jump.get_or_insert(value.clone()),
                    _ => continue,
                };
            }
        }

        Resolver { hosts }
    }

    pub fn resolve_host(&self, alias: &str) -> String {
        self.hosts.get(alias).and_then(|h| h.hostname.clone()).unwrap_or_else(|| alias.to_string())
    }

    pub fn resolve_user(&self, alias: &str) -> Option<String> {
        self.hosts.get(alias).and_then(|h| h.user.clone())
    }

    pub fn resolve_port(&self, alias: &str) -> String {
        self.hosts
            .get(alias)
            .and_then(|h| h.port.clone())
            .unwrap_or_else(|| DEFAULT_PORT.to_string())
    }

    pub fn resolve_identity_file(&self, alias: &str) -> Option<String> {
        self.hosts.get(alias).and_then(|h| h.identity_file.clone())
    }

    pub fn resolve_proxy_jump(&self, alias: &str) -> Option<String> {
        self.hosts.get(alias).and_then(|h| h.proxy_jump.clone())
    }

    pub fn hosts(&self) -> &HashMap<String, HostConfig> {
        &self.hosts
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Splits `Key value`, `Key=value`, or `Key = value` into (Key, value),
/// stripping a single layer of surrounding quotes from the value.
fn split_directive(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    let split_idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = &line[..split_idx];
    let mut rest = line[split_idx..].trim_start_matches(|c: char| c.is_whitespace() || c == '=');
    rest = rest.trim();

    let value = if rest.len() >= 2
        && ((rest.starts_with('"') && rest.ends_with('"')) || (rest.starts_with('\'') && rest.ends_with('\'')))
    {
        &rest[1..rest.len() - 1]
    } else {
        rest
    };

    if key.is_empty() {
        warn!("skipping unparseable ssh config line: {}", line);
        return None;
    }

    Some((key.to_string(), value.to_string()))
}

fn expand_tilde(value: &str) -> String {
    if let Some(rest) = value.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), rest);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_multiple_aliases_in_one_block() {
        let resolver = Resolver::parse("Host dev staging\nHostName dev.example.com\n");
        assert_eq!(resolver.resolve_host("dev"), "dev.example.com");
        assert_eq!(resolver.resolve_host("staging"), "dev.example.com");
    }

    #[test]
    fn unknown_alias_passes_through() {
        let resolver = Resolver::parse("Host dev\nHostName dev.example.com\n");
        assert_eq!(resolver.resolve_host("*"), "*");
        assert_eq!(resolver.resolve_host("nope"), "nope");
    }

    #[test]
    fn wildcard_patterns_never_become_keys() {
        let resolver = Resolver::parse(
            "Host *\n    ServerAliveInterval 30\n\nHost dev?\n    HostName wild.example.com\n\nHost prod\n    HostName prod.example.com\n",
        );
        assert!(!resolver.hosts().contains_key("*"));
        assert!(!resolver.hosts().contains_key("dev?"));
        assert!(resolver.hosts().contains_key("prod"));
    }

    #[test]
    fn equals_and_quoted_values() {
        let resolver = Resolver::parse("Host box\n  User=\"alice\"\n  Port = 2222\n");
        assert_eq!(resolver.resolve_user("box").as_deref(), Some("alice"));
        assert_eq!(resolver.resolve_port("box"), "2222");
    }

    #[test]
    fn default_port_when_unset() {
        let resolver = Resolver::parse("Host box\nHostName box.example.com\n");
        assert_eq!(resolver.resolve_port("box"), "22");
    }

    #[test]
    fn tilde_identity_file_expands() {
        let resolver = Resolver::parse("Host box\n  IdentityFile ~/.ssh/box_key\n");
        let resolved = resolver.resolve_identity_file("box").unwrap();
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("/.ssh/box_key"));
    }

    #[test]
    fn missing_file_is_empty_map() {
        let resolver = Resolver::load("/nonexistent/path/to/config").unwrap();
        assert!(resolver.hosts().is_empty());
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let resolver = Resolver::parse("# a comment\n\nHost box # trailing\n  HostName box.example.com # another\n");
        assert_eq!(resolver.resolve_host("box"), "box.example.com");
    }
}
