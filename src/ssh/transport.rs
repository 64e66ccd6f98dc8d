//! Session establishment
//!
//! For every authentication method in chain order a fresh transport is
//! opened (TCP socket or ProxyCommand helper), the SSH handshake runs over
//! it with `client::connect_stream()`, and the method is tried. The first
//! method that authenticates wins; the others are never attempted.
//!
//! A host that cannot be reached at all fails with the transport error of
//! the first attempt. Only once some method got to authenticate does a
//! failure of the whole chain read as exhausted authentication.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::auth::{AuthChain, AuthMethod, NamedAuthMethod};
use super::client::ClientHandler;
use super::config::EffectiveOptions;
use super::error::SshError;
use super::known_hosts::KnownHostsStore;
use super::proxy::{expand_proxy_command, ProxyCommandStream};

/// Lifecycle of one host's job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Authenticating,
    Established,
    Closed,
    Failed,
}

impl SessionPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Failed)
    }
}

/// Opens authenticated connections; shared by all workers.
pub struct Connector {
    ssh_config: Arc<client::Config>,
    default_known_hosts: PathBuf,
    known_hosts: Mutex<HashMap<PathBuf, Arc<KnownHostsStore>>>,
    agent_socket: Option<PathBuf>,
}

impl Connector {
    pub fn new(default_known_hosts: PathBuf, agent_socket: Option<PathBuf>) -> Self {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            ssh_config: Arc::new(ssh_config),
            default_known_hosts,
            known_hosts: Mutex::new(HashMap::new()),
            agent_socket,
        }
    }

    /// Known hosts store for `UserKnownHostsFile`, loaded once per path
    fn known_hosts_for(&self, options: &EffectiveOptions) -> Arc<KnownHostsStore> {
        let path = options
            .user_known_hosts_file
            .clone()
            .unwrap_or_else(|| self.default_known_hosts.clone());

        self.known_hosts
            .lock()
            .entry(path.clone())
            .or_insert_with(|| Arc::new(KnownHostsStore::with_path(path)))
            .clone()
    }

    /// Try each method of `chain` in order until one authenticates.
    ///
    /// `on_phase` is told about every `Connecting`/`Authenticating`
    /// transition and the final `Established`.
    pub async fn establish_session<F>(
        &self,
        options: &EffectiveOptions,
        chain: &AuthChain,
        on_phase: F,
    ) -> Result<Handle<ClientHandler>, SshError>
    where
        F: Fn(SessionPhase),
    {
        if chain.is_empty() {
            return Err(SshError::NoAuthMethods);
        }
        if options.user.is_empty() {
            return Err(SshError::Auth("no user name to log in as".to_string()));
        }

        let known_hosts = self.known_hosts_for(options);
        let mut reached_auth = false;

        for method in chain.iter() {
            on_phase(SessionPhase::Connecting);
            let mut handle = match self.connect(options, known_hosts.clone()).await {
                Ok(handle) => handle,
                // Every later attempt would hit the same key
                Err(e @ SshError::HostKey(_)) => return Err(e),
                // Host never got as far as authentication; the next method
                // would only dial (and time out) again
                Err(e) if !reached_auth => return Err(e),
                Err(e) => {
                    debug!("Connection for method {} failed: {}", method.name, e);
                    continue;
                }
            };

            reached_auth = true;
            on_phase(SessionPhase::Authenticating);
            match authenticate(&mut handle, &options.user, method).await {
                Ok(()) => {
                    info!("Session established using {}", method.name);
                    on_phase(SessionPhase::Established);
                    return Ok(handle);
                }
                Err(e) => {
                    debug!("Failed to establish session using {}: {}", method.name, e);
                    if let Err(e) = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "en")
                        .await
                    {
                        debug!("Disconnect after failed authentication: {}", e);
                    }
                }
            }
        }

        Err(SshError::AuthExhausted)
    }

    /// Open a transport and run the handshake, bounded by `ConnectTimeout`
    async fn connect(
        &self,
        options: &EffectiveOptions,
        known_hosts: Arc<KnownHostsStore>,
    ) -> Result<Handle<ClientHandler>, SshError> {
        let handler = ClientHandler::new(
            options.host.clone(),
            options.port_number(),
            options.strict_host_key_checking,
            known_hosts,
        )
        .with_agent_socket(self.agent_socket.clone());

        let address = options.address();
        let config = self.ssh_config.clone();

        let connect = async move {
            match &options.proxy_command {
                Some(template) => {
                    let command =
                        expand_proxy_command(template, &options.host, &options.port, &options.user);
                    let stream = ProxyCommandStream::spawn(&command)?;
                    handshake(config, stream, handler).await
                }
                None => {
                    debug!("Dialing {}", address);
                    let stream = TcpStream::connect(&address).await.map_err(|e| {
                        SshError::Connect(format!("Failed to connect to {}: {}", address, e))
                    })?;
                    stream.set_nodelay(true)?;
                    handshake(config, stream, handler).await
                }
            }
        };

        with_timeout(options.connect_timeout, &options.alias, connect).await
    }
}

async fn handshake<S>(
    config: Arc<client::Config>,
    stream: S,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    client::connect_stream(config, stream, handler).await
}

async fn with_timeout<T, Fut>(
    limit: Option<Duration>,
    host: &str,
    fut: Fut,
) -> Result<T, SshError>
where
    Fut: Future<Output = Result<T, SshError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            SshError::Timeout(format!("Connection to {} timed out after {:?}", host, limit))
        })?,
        None => fut.await,
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    method: &NamedAuthMethod,
) -> Result<(), SshError> {
    match &method.method {
        AuthMethod::Agent(agent) => agent.authenticate(handle, user).await,
        AuthMethod::Key(key) => {
            let hash_alg = if is_rsa(key) {
                handle.best_supported_rsa_hash().await?.flatten()
            } else {
                None
            };
            let result = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
                .await?;
            if result.success() {
                Ok(())
            } else {
                Err(SshError::Auth(format!(
                    "key {} rejected for {}",
                    method.name, user
                )))
            }
        }
    }
}

fn is_rsa(key: &PrivateKey) -> bool {
    matches!(key.algorithm(), Algorithm::Rsa { .. })
}
