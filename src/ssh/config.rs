//! Effective SSH connection options
//!
//! Layers command-line options over `~/.ssh/config` over compiled-in
//! defaults, producing one immutable record per target host.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use super::error::SshError;
use crate::config::{SshConfigFile, SshOptions, StrictHostKeyChecking, DEFAULT_PORT};

/// Fully merged connection parameters for one target host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveOptions {
    /// Host name as requested (display name and config lookup key)
    pub alias: String,

    /// Address to connect to (`HostName`, or the alias)
    pub host: String,

    /// SSH port (default: 22)
    pub port: String,

    /// Username for authentication, empty when nothing set one
    pub user: String,

    /// Per-host identity file, tried after the agent and before the
    /// identities given on the command line
    pub identity_file: Option<PathBuf>,

    /// Unset, yes or no
    pub forward_agent: Option<bool>,

    /// Command used as transport instead of a TCP socket
    pub proxy_command: Option<String>,

    /// Bounds dial and handshake
    pub connect_timeout: Option<Duration>,

    pub strict_host_key_checking: StrictHostKeyChecking,

    pub user_known_hosts_file: Option<PathBuf>,
}

impl EffectiveOptions {
    /// Resolve the options for `target` (`host` or `host:port`).
    ///
    /// Precedence for every field is command line > config file > defaults.
    /// A port in `target` counts as a command-line value, below `-o Port`.
    pub fn resolve(
        target: &str,
        config: &SshConfigFile,
        cli: &SshOptions,
        defaults: &SshOptions,
    ) -> Result<Self, SshError> {
        let (alias, explicit_port) = split_host_port(target)?;

        let mut cli = cli.clone();
        if cli.port.is_none() {
            cli.port = explicit_port;
        }

        let section = config.options_for(&alias);
        let merged = merge_options(Some(&section), &cli, defaults);

        let port = merged.port().to_string();
        if port.parse::<u16>().is_err() {
            return Err(SshError::invalid_host(target, format!("invalid port {:?}", port)));
        }

        Ok(Self {
            host: merged.host_name.unwrap_or_else(|| alias.clone()),
            alias,
            port,
            user: merged.user.unwrap_or_default(),
            identity_file: merged.identity_file,
            forward_agent: merged.forward_agent,
            proxy_command: merged.proxy_command,
            connect_timeout: merged.connect_timeout.map(Duration::from_secs),
            strict_host_key_checking: merged.strict_host_key_checking.unwrap_or_default(),
            user_known_hosts_file: merged.user_known_hosts_file,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        join_host_port(&self.host, &self.port)
    }

    pub fn port_number(&self) -> u16 {
        self.port.parse().unwrap_or(22)
    }

    pub fn forward_agent(&self) -> bool {
        self.forward_agent.unwrap_or(false)
    }
}

/// Merge one layer per field: command line, then config section, then
/// defaults.
pub fn merge_options(
    section: Option<&SshOptions>,
    cli: &SshOptions,
    defaults: &SshOptions,
) -> SshOptions {
    let mut merged = cli.clone();
    if let Some(section) = section {
        merged.fill_from(section);
    }
    merged.fill_from(defaults);
    merged
}

/// Compiled-in defaults: port 22 and the local user name
pub fn default_options() -> SshOptions {
    SshOptions {
        port: Some(DEFAULT_PORT.to_string()),
        user: Some(whoami::username()),
        ..Default::default()
    }
}

/// Split `host`, `host:port`, `[v6]` or `[v6]:port`.
///
/// The port is `None` when absent or empty.
pub fn split_host_port(target: &str) -> Result<(String, Option<String>), SshError> {
    let target = target.trim();

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| SshError::invalid_host(target, "missing ']' in address"))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = if after.is_empty() {
            None
        } else if let Some(port) = after.strip_prefix(':') {
            Some(port)
        } else {
            return Err(SshError::invalid_host(target, "unexpected text after ']'"));
        };
        (host, port)
    } else {
        if target.contains(']') {
            return Err(SshError::invalid_host(target, "unexpected ']' in address"));
        }
        match target.matches(':').count() {
            0 => (target, None),
            1 => match target.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (target, None),
            },
            _ => return Err(SshError::invalid_host(target, "too many colons in address")),
        }
    };

    if host.is_empty() {
        return Err(SshError::invalid_host(target, "missing host"));
    }

    let port = match port {
        None | Some("") => None,
        Some(port) => {
            if port.parse::<u16>().is_err() {
                return Err(SshError::invalid_host(target, format!("invalid port {:?}", port)));
            }
            Some(port.to_string())
        }
    };

    Ok((host.to_string(), port))
}

/// Join host and port, bracketing hosts that contain a colon
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Normalise a target to `host:port`, appending port 22 when none is given.
pub fn clean_host(target: &str) -> Result<String, SshError> {
    let (host, port) = split_host_port(target)?;
    Ok(join_host_port(&host, port.as_deref().unwrap_or(DEFAULT_PORT)))
}
