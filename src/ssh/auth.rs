//! SSH Authentication Chain
//!
//! Builds the ordered list of authentication methods tried for each host:
//! - the shared SSH agent (first, when one is connected)
//! - the host's own `IdentityFile`, if any
//! - identity files from the command line, or the default `~/.ssh/id_*` keys
//!
//! Loading never fails as a whole. A key that cannot be read, parsed or
//! decrypted is dropped from the chain and logged.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{decode_secret_key, PrivateKey};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::agent::SshAgentClient;
use super::error::SshError;

/// Name of the agent-backed method
pub const AGENT_METHOD: &str = "ssh-agent";

/// Default identity files under `~/.ssh`, in attempt order
pub const DEFAULT_IDENTITIES: [&str; 4] = ["id_dsa", "id_ecdsa", "id_ed25519", "id_rsa"];

/// Source of passphrases for encrypted keys
pub type PassphrasePrompt<'a> = &'a (dyn Fn(&Path) -> io::Result<Zeroizing<String>> + Sync);

/// Read a passphrase from the controlling terminal without echo
pub fn terminal_prompt(path: &Path) -> io::Result<Zeroizing<String>> {
    rpassword::prompt_password(format!("Key passphrase for {}: ", path.display()))
        .map(Zeroizing::new)
}

/// One way of proving identity to a server
#[derive(Clone)]
pub enum AuthMethod {
    /// Keys held by the local agent
    Agent(Arc<SshAgentClient>),
    /// A decoded private key
    Key(Arc<PrivateKey>),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Agent(agent) => f
                .debug_tuple("Agent")
                .field(&agent.identity_count())
                .finish(),
            AuthMethod::Key(key) => f.debug_tuple("Key").field(&key.algorithm()).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NamedAuthMethod {
    /// `ssh-agent` or the identity file path
    pub name: String,
    pub method: AuthMethod,
}

/// Authentication methods in attempt order; names are unique.
#[derive(Debug, Clone, Default)]
pub struct AuthChain {
    methods: Vec<NamedAuthMethod>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a method unless one with the same name is present
    pub fn push(&mut self, name: impl Into<String>, method: AuthMethod) {
        let name = name.into();
        if self.contains(&name) {
            return;
        }
        self.methods.push(NamedAuthMethod { name, method });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedAuthMethod> {
        self.methods.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.methods.iter().map(|m| m.name.as_str()).collect()
    }

    /// Copy of this chain with `key` inserted after the agent method
    pub fn with_identity(&self, name: &str, key: Arc<PrivateKey>) -> AuthChain {
        if self.contains(name) {
            return self.clone();
        }

        let at = self
            .methods
            .iter()
            .position(|m| !matches!(m.method, AuthMethod::Agent(_)))
            .unwrap_or(self.methods.len());

        let mut methods = self.methods.clone();
        methods.insert(
            at,
            NamedAuthMethod {
                name: name.to_string(),
                method: AuthMethod::Key(key),
            },
        );
        AuthChain { methods }
    }
}

/// `~/.ssh/{id_dsa,id_ecdsa,id_ed25519,id_rsa}`
pub fn default_identity_files() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let ssh_dir = home.join(".ssh");
    DEFAULT_IDENTITIES.iter().map(|name| ssh_dir.join(name)).collect()
}

/// Build the base chain: agent first, then every identity file that loads.
///
/// An empty `identity_files` falls back to [`default_identity_files`].
pub fn build_auth_methods(
    identity_files: &[PathBuf],
    agent: Option<Arc<SshAgentClient>>,
    prompt: PassphrasePrompt<'_>,
) -> AuthChain {
    let mut chain = AuthChain::new();

    if let Some(agent) = agent {
        chain.push(AGENT_METHOD, AuthMethod::Agent(agent));
    }

    let defaults;
    let files = if identity_files.is_empty() {
        defaults = default_identity_files();
        &defaults[..]
    } else {
        identity_files
    };

    for path in files {
        match load_identity(path, prompt) {
            Ok(key) => {
                debug!("Loaded {} key from {}", key.algorithm(), path.display());
                chain.push(path.to_string_lossy(), AuthMethod::Key(Arc::new(key)));
            }
            Err(e) => debug!("Skipping identity {}: {}", path.display(), e),
        }
    }

    info!("Authentication methods: {:?}", chain.names());
    chain
}

/// Read and decode one private key, prompting once if it is encrypted.
pub fn load_identity(path: &Path, prompt: PassphrasePrompt<'_>) -> Result<PrivateKey, SshError> {
    let contents = Zeroizing::new(std::fs::read_to_string(path)?);
    decode_identity(&contents, path, prompt)
}

fn decode_identity(
    contents: &str,
    path: &Path,
    prompt: PassphrasePrompt<'_>,
) -> Result<PrivateKey, SshError> {
    // OpenSSH format: the key block says whether it is encrypted
    if contents.contains("BEGIN OPENSSH PRIVATE KEY") {
        let key = PrivateKey::from_openssh(contents)?;
        if !key.is_encrypted() {
            return Ok(key);
        }
        let passphrase = prompt(path)?;
        return key
            .decrypt(passphrase.as_bytes())
            .map_err(|e| SshError::Key(format!("cannot decrypt {}: {}", path.display(), e)));
    }

    // Legacy PEM: "Proc-Type: 4,ENCRYPTED"
    if contents.contains("ENCRYPTED") {
        let passphrase = prompt(path)?;
        return Ok(decode_secret_key(contents, Some(passphrase.as_str()))?);
    }

    Ok(decode_secret_key(contents, None)?)
}

/// Per-host identity files, each loaded once before dispatch
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: HashMap<PathBuf, Arc<PrivateKey>>,
}

impl KeyRing {
    /// Load every distinct path not already present in `base`.
    pub fn load<I>(paths: I, base: &AuthChain, prompt: PassphrasePrompt<'_>) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut keys = HashMap::new();
        for path in paths {
            if keys.contains_key(&path) || base.contains(&path.to_string_lossy()) {
                continue;
            }
            match load_identity(&path, prompt) {
                Ok(key) => {
                    keys.insert(path, Arc::new(key));
                }
                Err(e) => debug!("Skipping host identity {}: {}", path.display(), e),
            }
        }
        Self { keys }
    }

    /// Chain for one host: `base` plus the host's identity, if loaded
    pub fn chain_for(&self, base: &AuthChain, identity: Option<&Path>) -> AuthChain {
        match identity.and_then(|p| self.keys.get(p).map(|k| (p, k))) {
            Some((path, key)) => base.with_identity(&path.to_string_lossy(), key.clone()),
            None => base.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
