//! Per-host failures
//!
//! Everything that can go wrong between resolving a host and its command
//! exiting. The message of each variant is what ends up under the host's
//! header, so they read as plain sentences.

use thiserror::Error;

/// Message recorded on a job when every authentication method failed.
pub const AUTH_EXHAUSTED: &str =
    "none of the provided authentication methods can establish SSH session successfully";

#[derive(Error, Debug)]
pub enum SshError {
    #[error("invalid host address {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("{0}")]
    Connect(String),

    #[error("proxy command: {0}")]
    ProxyCommand(String),

    #[error("authentication: {0}")]
    Auth(String),

    #[error("no authentication methods available (no agent and no loadable identity file)")]
    NoAuthMethods,

    #[error("{AUTH_EXHAUSTED}")]
    AuthExhausted,

    #[error("host key verification failed: {0}")]
    HostKey(String),

    #[error("channel: {0}")]
    Channel(String),

    #[error("cannot set environment variable {name}: {reason}")]
    Environment { name: String, reason: String },

    #[error("command exited with status {0}")]
    ExitStatus(u32),

    #[error("command terminated by signal {0}")]
    ExitSignal(String),

    #[error("remote command exited without exit status or exit signal")]
    ExitMissing,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("ssh: {0}")]
    Protocol(String),

    #[error("identity: {0}")]
    Key(String),

    #[error("{0}")]
    Timeout(String),

    #[error("ssh agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("ssh agent: {0}")]
    Agent(String),
}

impl SshError {
    pub fn invalid_host(host: &str, reason: impl Into<String>) -> Self {
        SshError::InvalidHost {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    /// Remote command ran and reported failure, as opposed to a failure
    /// to reach or log into the host
    pub fn is_remote_exit(&self) -> bool {
        matches!(self, SshError::ExitStatus(_) | SshError::ExitSignal(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::IO(io) => SshError::Io(io),
            other => SshError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}

impl From<russh::keys::ssh_key::Error> for SshError {
    fn from(e: russh::keys::ssh_key::Error) -> Self {
        SshError::Key(e.to_string())
    }
}

// Failed jobs carry their error into the JSON report
impl serde::Serialize for SshError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(SshError::AuthExhausted.to_string(), AUTH_EXHAUSTED);
        assert_eq!(
            SshError::ExitStatus(3).to_string(),
            "command exited with status 3"
        );
        assert_eq!(
            SshError::invalid_host("[::1", "missing ']'").to_string(),
            "invalid host address \"[::1\": missing ']'"
        );
    }

    #[test]
    fn test_remote_exit() {
        assert!(SshError::ExitStatus(1).is_remote_exit());
        assert!(SshError::ExitSignal("KILL".into()).is_remote_exit());
        assert!(!SshError::AuthExhausted.is_remote_exit());
    }

    #[test]
    fn test_serialize_as_message() {
        let json = serde_json::to_string(&SshError::NoAuthMethods).unwrap();
        assert!(json.starts_with("\"no authentication methods"));
    }
}
