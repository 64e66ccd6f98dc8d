//! SSH Agent Client
//!
//! One connection to the local agent (`SSH_AUTH_SOCK`) shared by every
//! worker. Signing requests are serialized through a mutex; the identity
//! list is fetched once at connect time.
//!
//! # The `AgentSigner` Workaround (Send + RPITIT)
//!
//! russh's built-in `impl Signer for AgentClient` returns `impl Future + Send`
//! via RPITIT. Inside [`Handle::authenticate_publickey_with`], the call
//! `signer.auth_publickey_sign(&key, ...)` captures `&key` where `key` is a local
//! `PublicKey` from `Reply::SignRequest`. The compiler cannot prove `Send` for
//! this borrow's lifetime through RPITIT (related: rust-lang/rust#100013).
//!
//! `AgentSigner` clones `&PublicKey` into an owned value before the async
//! block, so the future only captures owned values.

use std::future::Future;
use std::path::PathBuf;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::client::ClientHandler;
use super::error::SshError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Environment variable naming the agent socket
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// Send-safe [`Signer`] over the shared agent connection.
struct AgentSigner<'a> {
    agent: &'a Mutex<DynAgent>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        let agent = self.agent;
        async move {
            agent
                .lock()
                .await
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Agent connection shared across workers
pub struct SshAgentClient {
    agent: Mutex<DynAgent>,
    identities: Vec<ssh_key::PublicKey>,
    socket: PathBuf,
}

impl SshAgentClient {
    /// Connect to the agent named by `SSH_AUTH_SOCK`.
    ///
    /// A missing variable is reported before any connection attempt.
    pub async fn connect() -> Result<Self, SshError> {
        let socket = std::env::var_os(SSH_AUTH_SOCK)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                SshError::AgentUnavailable(
                    "Unable to connect to the ssh agent. Please, check that SSH_AUTH_SOCK \
                     is set and the ssh agent is running"
                        .to_string(),
                )
            })?;

        Self::connect_socket(socket).await
    }

    #[cfg(unix)]
    pub async fn connect_socket(socket: PathBuf) -> Result<Self, SshError> {
        info!("Connecting to SSH Agent at {}", socket.display());

        let mut agent = AgentClient::connect_uds(&socket)
            .await
            .map_err(|e| {
                SshError::AgentUnavailable(format!(
                    "Failed to connect to SSH Agent at {}: {}",
                    socket.display(),
                    e
                ))
            })?
            .dynamic();

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| SshError::Agent(format!("Failed to list agent keys: {}", e)))?;

        info!("SSH Agent reports {} key(s)", identities.len());

        Ok(Self {
            agent: Mutex::new(agent),
            identities,
            socket,
        })
    }

    #[cfg(not(unix))]
    pub async fn connect_socket(socket: PathBuf) -> Result<Self, SshError> {
        Err(SshError::AgentUnavailable(format!(
            "SSH Agent sockets are not supported on this platform ({})",
            socket.display()
        )))
    }

    /// Socket path, used to bridge forwarded agent channels
    pub fn socket(&self) -> &PathBuf {
        &self.socket
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Authenticate with the SSH server using agent-held keys
    ///
    /// Tries each agent key in turn; the agent signs the server challenge.
    pub async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), SshError> {
        if self.identities.is_empty() {
            return Err(SshError::Agent(
                "SSH Agent has no keys loaded. Add keys with: ssh-add".to_string(),
            ));
        }

        let mut last_error: Option<String> = None;
        for key in &self.identities {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner { agent: &self.agent },
                )
                .await
            {
                Ok(result) if result.success() => {
                    debug!("Agent key accepted: {}", key.comment());
                    return Ok(());
                }
                Ok(_failure) => {
                    debug!("Key rejected by server: {}", key.comment());
                }
                Err(e) => {
                    debug!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SshError::Agent(format!(
            "No agent key was accepted by the server (tried {} key(s)){}",
            self.identities.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        match SshAgentClient::connect_socket(dir.path().join("agent.sock")).await {
            Err(SshError::AgentUnavailable(msg)) => assert!(msg.contains("agent.sock")),
            Err(e) => panic!("Unexpected error type: {:?}", e),
            Ok(_) => panic!("Connected to a socket that does not exist"),
        }
    }
}
