//! Known hosts for SSH host key verification
//!
//! A read-mostly view of `~/.ssh/known_hosts` (or `UserKnownHostsFile`),
//! shared by every worker of a run. New keys are appended under a write lock.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// `|1|salt|hash` host name: HMAC-SHA1 of the lookup key under `salt`
#[derive(Clone, Debug)]
struct HashedHost {
    salt: Vec<u8>,
    hash: Vec<u8>,
    entry: HostKeyEntry,
}

impl HashedHost {
    fn parse(name: &str, entry: &HostKeyEntry) -> Option<Self> {
        let (salt, hash) = name.strip_prefix("|1|")?.split_once('|')?;
        Some(Self {
            salt: BASE64.decode(salt).ok()?,
            hash: BASE64.decode(hash).ok()?,
            entry: entry.clone(),
        })
    }

    fn matches(&self, lookup_key: &str) -> bool {
        Hmac::<Sha1>::new_from_slice(&self.salt)
            .map(|mac| mac.chain_update(lookup_key).verify_slice(&self.hash).is_ok())
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct KnownHosts {
    /// lookup key -> keys, in file order
    plain: HashMap<String, Vec<HostKeyEntry>>,
    hashed: Vec<HashedHost>,
}

impl KnownHosts {
    fn entries_for<'a>(&'a self, lookup_key: &'a str) -> impl Iterator<Item = &'a HostKeyEntry> {
        self.plain
            .get(lookup_key)
            .into_iter()
            .flatten()
            .chain(
                self.hashed
                    .iter()
                    .filter(move |h| h.matches(lookup_key))
                    .map(|h| &h.entry),
            )
    }
}

pub struct KnownHostsStore {
    hosts: RwLock<KnownHosts>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    /// Load the store from `path`. A missing or unreadable file is an empty
    /// store.
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(KnownHosts::default()),
            path,
        };

        if let Err(e) = store.load() {
            debug!("Known hosts file {} not loaded: {}", store.path.display(), e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    match HashedHost::parse(hostname, &entry) {
                        Some(hashed) => hosts.hashed.push(hashed),
                        None => {
                            debug!("Skipping malformed hashed host {}", hostname);
                            continue;
                        }
                    }
                } else {
                    hosts
                        .plain
                        .entry(hostname.to_lowercase())
                        .or_default()
                        .push(entry.clone());
                }
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} plain hosts, {} hashed)",
            entry_count,
            hosts.plain.len(),
            hosts.hashed.len()
        );
        Ok(())
    }

    /// Lookup key for host:port, `[host]:port` for non-default ports
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint of a public key
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    /// Verify a host's public key.
    ///
    /// Any line for the host with the same key type and key data verifies
    /// it; the key counts as changed only when none of them does.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let mut known = false;
        let mut mismatch: Option<&HostKeyEntry> = None;

        for entry in hosts.entries_for(&lookup_key) {
            known = true;
            if entry.key_type != actual_key_type {
                continue;
            }
            if entry.key_data == actual_key_b64 {
                return HostKeyVerification::Verified;
            }
            mismatch.get_or_insert(entry);
        }

        if let Some(entry) = mismatch {
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|bytes| fingerprint_bytes(&bytes))
                .unwrap_or_else(|_| "unknown".to_string());
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        if known {
            debug!(
                "Host {} known but no {} key stored, treating as new",
                lookup_key, actual_key_type
            );
        } else {
            debug!("Unknown host: {}", lookup_key);
        }
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Add a new host key to the cache and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        let mut hosts = self.hosts.write();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        hosts.plain.entry(lookup_key.clone()).or_default().push(HostKeyEntry {
            key_type: key_type.clone(),
            key_data: key_b64,
        });

        info!("Added host key for {} ({}) to known_hosts", lookup_key, key_type);
        Ok(())
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}
