//! russh client handler
//!
//! Processes server-initiated events for one connection:
//! - Host key verification against known_hosts
//! - Agent channels opened by the server after agent forwarding was granted

use std::path::PathBuf;
use std::sync::Arc;

use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{debug, info};

use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use crate::config::StrictHostKeyChecking;

/// Client handler for russh callbacks
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    strict: StrictHostKeyChecking,
    known_hosts: Arc<KnownHostsStore>,
    /// Local agent socket that forwarded agent channels are bridged to
    agent_socket: Option<PathBuf>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        strict: StrictHostKeyChecking,
        known_hosts: Arc<KnownHostsStore>,
    ) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
            agent_socket: None,
        }
    }

    pub fn with_agent_socket(mut self, socket: Option<PathBuf>) -> Self {
        self.agent_socket = socket;
        self
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.strict == StrictHostKeyChecking::No {
            debug!("Host key checking disabled for {}:{}", self.host, self.port);
            return Ok(true);
        }

        match self.known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict == StrictHostKeyChecking::Yes {
                    return Err(SshError::HostKey(format!(
                        "unknown host {}:{} (fingerprint: {}) and StrictHostKeyChecking is yes",
                        self.host, self.port, fingerprint
                    )));
                }

                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self.known_hosts.add_host(&self.host, self.port, server_public_key) {
                    debug!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKey(format!(
                "key for {}:{} has changed! Expected: {}, Actual: {}. \
                 If the change is legitimate, remove the old key from {}",
                self.host,
                self.port,
                expected_fingerprint,
                actual_fingerprint,
                self.known_hosts.path().display()
            ))),
        }
    }

    /// Called when the remote side uses the forwarded agent.
    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(socket) = self.agent_socket.clone() else {
            debug!(
                "{}: server opened an agent channel but no agent is available",
                self.host
            );
            return Ok(());
        };

        debug!("{}: bridging forwarded agent channel", self.host);
        tokio::spawn(async move {
            if let Err(e) = bridge_agent_channel(channel, socket).await {
                debug!("Forwarded agent channel ended: {}", e);
            }
        });
        Ok(())
    }
}

#[cfg(unix)]
async fn bridge_agent_channel(channel: Channel<Msg>, socket: PathBuf) -> std::io::Result<()> {
    let mut local = tokio::net::UnixStream::connect(&socket).await?;
    let mut remote = channel.into_stream();
    tokio::io::copy_bidirectional(&mut remote, &mut local).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn bridge_agent_channel(_channel: Channel<Msg>, socket: PathBuf) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("agent socket {} is not supported here", socket.display()),
    ))
}
