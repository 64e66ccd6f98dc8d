//! Configuration Module
//!
//! OpenSSH client configuration: `~/.ssh/config` sections and `-o` options.

pub mod ssh_config;

pub use ssh_config::{
    default_ssh_config_path, expand_tilde, parse_options, parse_ssh_config,
    parse_ssh_config_content, resolve_identity, ConfigSection, SshConfigError, SshConfigFile,
    SshOptions, StrictHostKeyChecking, DEFAULT_PORT,
};
