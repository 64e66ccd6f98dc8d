//! Command-line interface

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::config::{resolve_identity, SshConfigError};
use crate::ssh::SshError;

#[derive(Parser, Debug)]
#[command(
    name = "slex",
    version,
    about = "SSH commands multiplexed",
    long_about = "Run one command on many hosts over SSH.\nConnection settings come from ~/.ssh/config, overridden by -o options.\nOutput of every host is shown live; the last lines of each host stay on screen.",
    after_help = "EXAMPLES:\n  Run on two hosts:          slex --host web1,web2 uptime\n  Hosts from a file:         slex --hosts hosts.txt -c 50 'df -h /'\n  Command from stdin:        echo 'systemctl restart app' | slex --host web1\n  Through a bastion:         slex --host db1 -o 'ProxyCommand ssh -W %h:%p bastion' hostname"
)]
pub struct Cli {
    #[arg(
        long = "host",
        value_name = "HOST",
        value_delimiter = ',',
        help = "SSH host address, host:port or [v6]:port (repeatable, comma separated)"
    )]
    pub hosts: Vec<String>,

    #[arg(
        long = "hosts",
        value_name = "FILE",
        help = "File containing host addresses separated by a new line"
    )]
    pub hosts_file: Option<PathBuf>,

    #[arg(
        short = 'u',
        long,
        help = "User to execute the command as\nA User from ~/.ssh/config or -o wins; defaults to the local user"
    )]
    pub user: Option<String>,

    #[arg(
        short = 'i',
        long = "identity",
        value_name = "FILE",
        help = "SSH identity to use for connecting to the host (repeatable)\nA bare file name is looked up in ~/.ssh\nFalls back to ~/.ssh/id_dsa, id_ecdsa, id_ed25519, id_rsa"
    )]
    pub identities: Vec<String>,

    #[arg(
        short = 'o',
        long = "option",
        value_name = "OPTION",
        help = "SSH client option, e.g. 'Port 2222' or 'User=deploy' (repeatable)"
    )]
    pub options: Vec<String>,

    #[arg(
        short = 'A',
        long,
        help = "Authenticate with the ssh agent and forward it to the hosts\nRequires SSH_AUTH_SOCK"
    )]
    pub agent: bool,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VALUE",
        help = "Set environment variables for the SSH command (repeatable)"
    )]
    pub env: Vec<String>,

    #[arg(short = 'q', long, help = "Disable output from the ssh command")]
    pub quiet: bool,

    #[arg(
        short = 'c',
        long,
        default_value_t = 10,
        help = "Set the concurrent worker limit"
    )]
    pub concurrency: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, help = "Output format")]
    pub format: OutputFormat,

    #[arg(short = 'F', long = "config", value_name = "FILE", help = "SSH config file [default: ~/.ssh/config]")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Enable debug output for the logs")]
    pub debug: bool,

    #[arg(
        trailing_var_arg = true,
        help = "Command to run; read from stdin when omitted"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Live per-host view
    Text,
    /// One JSON document once every host finished
    Json,
}

/// Setup errors; any of these aborts the run before a host is contacted
#[derive(Error, Debug)]
pub enum CliError {
    #[error("no command specified")]
    NoCommand,

    #[error("no host specified for command to run")]
    NoHosts,

    #[error("cannot read hosts file {path}: {source}")]
    HostsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot read command from stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("invalid environment variable {0:?}, expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] SshConfigError),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl Cli {
    /// Hosts from `--host` followed by those of `--hosts`
    pub fn load_hosts(&self) -> Result<Vec<String>, CliError> {
        let mut hosts: Vec<String> = self
            .hosts
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();

        if let Some(path) = &self.hosts_file {
            hosts.extend(read_hosts_file(path)?);
        }

        if hosts.is_empty() {
            return Err(CliError::NoHosts);
        }
        Ok(hosts)
    }

    /// The trailing words joined by spaces, or all of `stdin` when there
    /// are none
    pub fn read_command<R: Read>(&self, stdin: R) -> Result<String, CliError> {
        let command = if self.command.is_empty() {
            let mut raw = String::new();
            let mut stdin = stdin;
            stdin.read_to_string(&mut raw).map_err(CliError::Stdin)?;
            raw.trim().to_string()
        } else {
            self.command.join(" ")
        };

        if command.trim().is_empty() {
            return Err(CliError::NoCommand);
        }
        Ok(command)
    }

    pub fn env_vars(&self) -> Result<Vec<(String, String)>, CliError> {
        parse_env(&self.env)
    }

    /// `-i` values with `~` expanded and bare names under `~/.ssh`
    pub fn identity_files(&self) -> Vec<PathBuf> {
        self.identities.iter().map(|i| resolve_identity(i)).collect()
    }
}

pub fn read_hosts_file(path: &Path) -> Result<Vec<String>, CliError> {
    let content = std::fs::read_to_string(path).map_err(|source| CliError::HostsFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_hosts(&content))
}

/// One host per line; blank lines and `#` comments are skipped
pub fn parse_hosts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Parse `KEY=VALUE` pairs; the value may be empty or contain `=`.
pub fn parse_env<S: AsRef<str>>(vars: &[S]) -> Result<Vec<(String, String)>, CliError> {
    vars.iter()
        .map(|var| {
            let var = var.as_ref();
            match var.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.to_string()))
                }
                _ => Err(CliError::InvalidEnv(var.to_string())),
            }
        })
        .collect()
}
