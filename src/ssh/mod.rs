//! SSH module - connections, authentication and remote execution
//!
//! Built on the russh client library.
//!
//! # Features
//! - Effective options from the command line, `~/.ssh/config` and defaults
//! - Ordered authentication: ssh-agent, then identity files
//! - Encrypted private keys, unlocked once with a terminal prompt
//! - ProxyCommand transports
//! - Host key verification via ~/.ssh/known_hosts
//! - Agent forwarding to the local `SSH_AUTH_SOCK`

mod agent;
mod auth;
mod client;
mod config;
mod error;
pub mod known_hosts;
mod proxy;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod test_server;

pub use agent::{SshAgentClient, SSH_AUTH_SOCK};
pub use auth::{
    build_auth_methods, default_identity_files, load_identity, terminal_prompt, AuthChain,
    AuthMethod, KeyRing, NamedAuthMethod, PassphrasePrompt, AGENT_METHOD, DEFAULT_IDENTITIES,
};
pub use client::ClientHandler;
pub use config::{
    clean_host, default_options, join_host_port, merge_options, split_host_port,
    EffectiveOptions,
};
pub use error::{SshError, AUTH_EXHAUSTED};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use proxy::{expand_proxy_command, ProxyCommandStream};
pub use session::{CommandRequest, RemoteSession};
pub use transport::{Connector, SessionPhase};
