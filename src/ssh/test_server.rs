//! In-process SSH server and agent for session tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::keys::agent::client::AgentClient;
use russh::keys::{decode_secret_key, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::{TcpListener, UnixListener};

use super::config::EffectiveOptions;
use crate::config::StrictHostKeyChecking;

const PLAIN_KEY: &str = include_str!("../../tests/fixtures/id_ed25519_plain");
const ENCRYPTED_KEY: &str = include_str!("../../tests/fixtures/id_ed25519_encrypted");

/// Key the test server accepts
pub fn authorized_key() -> PrivateKey {
    decode_secret_key(PLAIN_KEY, None).unwrap()
}

/// A valid key the test server does not know
pub fn unknown_key() -> PrivateKey {
    decode_secret_key(ENCRYPTED_KEY, Some("hunter2")).unwrap()
}

/// Options for a host listening on localhost
pub fn local_options(port: u16) -> EffectiveOptions {
    EffectiveOptions {
        alias: "local".to_string(),
        host: "127.0.0.1".to_string(),
        port: port.to_string(),
        user: "deploy".to_string(),
        identity_file: None,
        forward_agent: None,
        proxy_command: None,
        connect_timeout: Some(Duration::from_secs(5)),
        strict_host_key_checking: StrictHostKeyChecking::No,
        user_known_hosts_file: None,
    }
}

/// What the server answers to an exec request
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub stdout: &'static str,
    pub stderr: &'static str,
    /// None closes the channel without an exit status
    pub exit_status: Option<u32>,
    /// Environment variable the server refuses
    pub reject_env: Option<&'static str>,
}

impl Script {
    pub fn exit(status: u32) -> Self {
        Self {
            exit_status: Some(status),
            ..Default::default()
        }
    }
}

/// Shared by every connection the server accepts
#[derive(Default)]
pub struct Record {
    pub connections: AtomicUsize,
    pub auth_attempts: AtomicUsize,
    pub env: Mutex<Vec<(String, String)>>,
    pub commands: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct TestHandler {
    authorized: PublicKey,
    script: Script,
    record: Arc<Record>,
}

impl server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, _user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        self.record.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if key.key_data() == self.authorized.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.script.reject_env.is_some_and(|name| name == variable_name) {
            session.channel_failure(channel)?;
        } else {
            self.record
                .env
                .lock()
                .push((variable_name.to_string(), variable_value.to_string()));
            session.channel_success(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record
            .commands
            .lock()
            .push(String::from_utf8_lossy(data).into_owned());
        session.channel_success(channel)?;

        if !self.script.stdout.is_empty() {
            session.data(channel, CryptoVec::from_slice(self.script.stdout.as_bytes()))?;
        }
        if !self.script.stderr.is_empty() {
            session.extended_data(
                channel,
                1,
                CryptoVec::from_slice(self.script.stderr.as_bytes()),
            )?;
        }
        if let Some(status) = self.script.exit_status {
            session.exit_status_request(channel, status)?;
        }
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}

/// Serve `script` on a localhost port until the test ends.
pub async fn start_server(script: Script) -> (u16, Arc<Record>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let record = Arc::new(Record::default());

    let config = Arc::new(server::Config {
        keys: vec![authorized_key()],
        inactivity_timeout: None,
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });
    let handler = TestHandler {
        authorized: authorized_key().public_key().clone(),
        script,
        record: record.clone(),
    };

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            handler.record.connections.fetch_add(1, Ordering::SeqCst);
            let config = config.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, socket, handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    (port, record)
}

/// Run an agent on a socket under `dir` holding `keys`.
pub async fn start_agent(dir: &Path, keys: &[PrivateKey]) -> PathBuf {
    let socket = dir.join("agent.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let incoming = Box::pin(futures_util::stream::unfold(listener, |listener| async move {
        let next = listener.accept().await.map(|(stream, _)| stream);
        Some((next, listener))
    }));
    tokio::spawn(russh::keys::agent::server::serve(incoming, ()));

    let mut client = AgentClient::connect_uds(&socket).await.unwrap();
    for key in keys {
        client.add_identity(key, &[]).await.unwrap();
    }
    socket
}
