//! SSH Config Parser
//!
//! Parses an OpenSSH client config (`~/.ssh/config`) into `Host` sections.
//! Supports:
//! - Host, HostName, User, Port, IdentityFile, ProxyCommand, ForwardAgent
//! - ConnectTimeout, StrictHostKeyChecking, UserKnownHostsFile
//! - Glob host patterns (`*`, `?`) and negated patterns (`!pattern`)
//!
//! Every other keyword is dropped when the line is parsed: the option record
//! is a fixed struct, there is no catch-all map.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

/// Port used when neither the command line nor the config sets one.
pub const DEFAULT_PORT: &str = "22";

/// `keyword value`, `keyword=value`, `keyword = value`, `keyword<TAB>value`
static OPTION_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\w+)(?:\s*=\s*|\s+)(.+?)\s*$").expect("option pattern is valid")
});

/// Host-key checking policy (`StrictHostKeyChecking`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrictHostKeyChecking {
    /// Reject hosts missing from known_hosts
    Yes,
    /// Accept any key, changed keys included
    No,
    /// Record unknown hosts, reject changed keys
    #[default]
    AcceptNew,
}

impl StrictHostKeyChecking {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(Self::Yes),
            "no" | "off" | "false" => Some(Self::No),
            "accept-new" => Some(Self::AcceptNew),
            _ => None,
        }
    }
}

/// OpenSSH client options as found in a config section or on the command line.
///
/// Every field is optional; an unset field defers to the next layer when the
/// effective options for a host are resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SshOptions {
    /// `Host` pattern (only meaningful for `-o Host=...`)
    pub host: Option<String>,
    pub host_name: Option<String>,
    pub port: Option<String>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub forward_agent: Option<bool>,
    pub proxy_command: Option<String>,
    /// Seconds
    pub connect_timeout: Option<u64>,
    pub strict_host_key_checking: Option<StrictHostKeyChecking>,
    pub user_known_hosts_file: Option<PathBuf>,
}

impl SshOptions {
    /// Port, `"22"` when unset
    pub fn port(&self) -> &str {
        self.port.as_deref().unwrap_or(DEFAULT_PORT)
    }

    /// Apply one `keyword value` pair. The first value for a keyword wins,
    /// as in OpenSSH. Returns false for keywords that are not recognized.
    fn apply(&mut self, keyword: &str, value: &str) -> bool {
        fn set<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }

        match keyword.to_ascii_lowercase().as_str() {
            "host" => set(&mut self.host, Some(value.to_string())),
            "hostname" => set(&mut self.host_name, Some(value.to_string())),
            "port" => set(&mut self.port, Some(value.to_string())),
            "user" => set(&mut self.user, Some(value.to_string())),
            // One identity per host: later IdentityFile lines do not add
            // further keys the way OpenSSH accumulates them
            "identityfile" => set(&mut self.identity_file, Some(resolve_identity(value))),
            "forwardagent" => {
                let parsed = parse_yes_no(value);
                if parsed.is_none() {
                    warn!("Ignoring ForwardAgent {:?}: expected yes or no", value);
                }
                set(&mut self.forward_agent, parsed);
            }
            "proxycommand" => {
                if !value.eq_ignore_ascii_case("none") {
                    set(&mut self.proxy_command, Some(value.to_string()));
                }
            }
            "connecttimeout" => match value.parse::<u64>() {
                Ok(secs) => set(&mut self.connect_timeout, Some(secs)),
                Err(_) => warn!("Ignoring ConnectTimeout {:?}: not an integer", value),
            },
            "stricthostkeychecking" => {
                let parsed = StrictHostKeyChecking::parse(value);
                if parsed.is_none() {
                    warn!("Ignoring StrictHostKeyChecking {:?}", value);
                }
                set(&mut self.strict_host_key_checking, parsed);
            }
            "userknownhostsfile" => {
                set(&mut self.user_known_hosts_file, Some(expand_tilde(value)))
            }
            _ => return false,
        }
        true
    }

    /// Fill the fields that are still unset from `other`.
    pub fn fill_from(&mut self, other: &SshOptions) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }

        fill(&mut self.host, &other.host);
        fill(&mut self.host_name, &other.host_name);
        fill(&mut self.port, &other.port);
        fill(&mut self.user, &other.user);
        fill(&mut self.identity_file, &other.identity_file);
        fill(&mut self.forward_agent, &other.forward_agent);
        fill(&mut self.proxy_command, &other.proxy_command);
        fill(&mut self.connect_timeout, &other.connect_timeout);
        fill(&mut self.strict_host_key_checking, &other.strict_host_key_checking);
        fill(&mut self.user_known_hosts_file, &other.user_known_hosts_file);
    }
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

/// Split an option line into keyword and value.
fn split_option(line: &str) -> Option<(&str, &str)> {
    let caps = OPTION_EXPR.captures(line)?;
    let keyword = caps.get(1)?.as_str();
    let value = caps.get(2)?.as_str();
    Some((keyword, value))
}

/// Converts a list of OpenSSH client options (`-o` values) to [`SshOptions`].
///
/// Entries that cannot be split into a keyword and a value are skipped, as
/// are unknown keywords.
pub fn parse_options<S: AsRef<str>>(plain: &[S]) -> SshOptions {
    let mut options = SshOptions::default();
    for entry in plain {
        let entry = entry.as_ref();
        match split_option(entry) {
            Some((keyword, value)) => {
                if !options.apply(keyword, value) {
                    debug!("Dropping unsupported SSH option {:?}", keyword);
                }
            }
            None => debug!("Skipping malformed SSH option {:?}", entry),
        }
    }
    options
}

/// A parsed `Host` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSection {
    /// The literal token after `Host`
    pub host: String,
    pub options: SshOptions,
}

impl ConfigSection {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            options: SshOptions {
                host: Some(host.to_string()),
                ..Default::default()
            },
        }
    }

    /// Check whether `hostname` is selected by this section's patterns.
    ///
    /// The literal token always matches itself. Otherwise at least one
    /// positive pattern must match and no negated pattern may match.
    pub fn matches(&self, hostname: &str) -> bool {
        if self.host == hostname {
            return true;
        }

        let mut matched = false;
        for pattern in self.host.split_whitespace() {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, hostname) {
                    return false;
                }
            } else if glob_match(pattern, hostname) {
                matched = true;
            }
        }
        matched
    }
}

fn glob_match(pattern: &str, hostname: &str) -> bool {
    if pattern == hostname {
        return true;
    }
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches_with(
            hostname,
            glob::MatchOptions {
                case_sensitive: false,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        ),
        Err(_) => false,
    }
}

/// All sections of one config file, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigFile {
    sections: Vec<ConfigSection>,
}

impl SshConfigFile {
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigSection> {
        self.sections.iter()
    }

    /// Section keyed by its literal `Host` token. The first one wins when a
    /// token is repeated.
    pub fn get(&self, host: &str) -> Option<&ConfigSection> {
        self.sections.iter().find(|s| s.host == host)
    }

    /// Options for `hostname` folded over every matching section in file
    /// order; the first value obtained for a field wins.
    pub fn options_for(&self, hostname: &str) -> SshOptions {
        let mut options = SshOptions::default();
        for section in self.sections.iter().filter(|s| s.matches(hostname)) {
            options.fill_from(&section.options);
        }
        options
    }
}

/// SSH config parser errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Parse SSH config file. A missing file is an empty config.
pub async fn parse_ssh_config(path: &Path) -> Result<SshConfigFile, SshConfigError> {
    debug!("Parsing ssh config file: {}", path.display());

    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Cannot find ssh config file: {}", path.display());
            return Ok(SshConfigFile::default());
        }
        Err(source) => {
            return Err(SshConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    Ok(parse_ssh_config_content(&content))
}

/// Parse SSH config content string
pub fn parse_ssh_config_content(content: &str) -> SshConfigFile {
    let mut sections = Vec::new();
    let mut current: Option<ConfigSection> = None;

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((keyword, value)) = split_option(line) else {
            debug!("Skipping malformed config line {:?}", line);
            continue;
        };

        if keyword.eq_ignore_ascii_case("host") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(ConfigSection::new(value));
        } else if let Some(ref mut section) = current {
            if !section.options.apply(keyword, value) {
                debug!("Ignoring {} in Host {}", keyword, section.host);
            }
        }
    }

    // Don't forget the last section
    if let Some(section) = current {
        sections.push(section);
    }

    SshConfigFile { sections }
}

/// Expand `~/` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Resolve an identity file: a bare file name lives in `~/.ssh/`.
pub fn resolve_identity(identity: &str) -> PathBuf {
    let expanded = expand_tilde(identity);
    let bare = expanded
        .parent()
        .map(|p| p.as_os_str().is_empty())
        .unwrap_or(true);
    if bare {
        if let Some(home) = dirs::home_dir() {
            return home.join(".ssh").join(expanded);
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_port(host: &str, port: &str) -> SshOptions {
        SshOptions {
            host: Some(host.to_string()),
            port: Some(port.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_options_keyword_space_argument() {
        let out = parse_options(&["Host 127.0.0.1", "Port 22"]);
        assert_eq!(out, host_port("127.0.0.1", "22"));
    }

    #[test]
    fn test_parse_options_keyword_equals_argument() {
        let out = parse_options(&["Host=127.0.0.1", "Port=22"]);
        assert_eq!(out, host_port("127.0.0.1", "22"));
    }

    #[test]
    fn test_parse_options_keyword_spaced_equals_argument() {
        let out = parse_options(&["Host = 127.0.0.1", "Port = 22"]);
        assert_eq!(out, host_port("127.0.0.1", "22"));
    }

    #[test]
    fn test_parse_options_keyword_tab_argument() {
        let out = parse_options(&["Host\t127.0.0.1", "Port\t22"]);
        assert_eq!(out, host_port("127.0.0.1", "22"));
    }

    #[test]
    fn test_parse_options_case_insensitive_and_unknown_dropped() {
        let out = parse_options(&[
            "USER deploy",
            "forwardagent yes",
            "ServerAliveInterval 60",
            "ConnectTimeout=7",
        ]);
        assert_eq!(out.user.as_deref(), Some("deploy"));
        assert_eq!(out.forward_agent, Some(true));
        assert_eq!(out.connect_timeout, Some(7));
        assert!(out.host_name.is_none());
    }

    #[test]
    fn test_parse_options_malformed_entries_are_skipped() {
        let out = parse_options(&["", "   ", "=", "Port", "-- 1", "User ok"]);
        assert_eq!(out.user.as_deref(), Some("ok"));
        assert!(out.port.is_none());
    }

    #[test]
    fn test_parse_options_bad_values_leave_field_unset() {
        let out = parse_options(&["ForwardAgent maybe", "ConnectTimeout soon"]);
        assert!(out.forward_agent.is_none());
        assert!(out.connect_timeout.is_none());
    }

    #[test]
    fn test_parse_options_first_value_wins() {
        let out = parse_options(&["User first", "User second"]);
        assert_eq!(out.user.as_deref(), Some("first"));
    }

    #[test]
    fn test_empty_and_comment_only_config() {
        assert!(parse_ssh_config_content("").is_empty());
        assert!(parse_ssh_config_content("# only\n#comments\n\n").is_empty());
    }

    #[test]
    fn test_single_section() {
        let config = parse_ssh_config_content("Host github.com\n    User github\n");
        assert_eq!(config.len(), 1);

        let section = config.get("github.com").unwrap();
        assert_eq!(section.options.port(), "22");
        assert_eq!(section.options.user.as_deref(), Some("github"));
    }

    #[test]
    fn test_consecutive_sections_do_not_leak() {
        let content = r#"
# Comment
Host alpha
    HostName alpha.example.com
    User admin
    Port 2222
Host beta
    ProxyCommand nc %h %p
"#;
        let config = parse_ssh_config_content(content);
        assert_eq!(config.len(), 2);

        let alpha = &config.get("alpha").unwrap().options;
        assert_eq!(alpha.host_name.as_deref(), Some("alpha.example.com"));
        assert_eq!(alpha.user.as_deref(), Some("admin"));
        assert_eq!(alpha.port(), "2222");
        assert!(alpha.proxy_command.is_none());

        let beta = &config.get("beta").unwrap().options;
        assert_eq!(beta.proxy_command.as_deref(), Some("nc %h %p"));
        assert!(beta.user.is_none());
        assert!(beta.host_name.is_none());
        assert_eq!(beta.port(), "22");
    }

    #[test]
    fn test_section_without_body() {
        let config = parse_ssh_config_content("Host empty\nHost full\n  User x\n");
        let empty = config.get("empty").unwrap();
        assert_eq!(empty.options.port(), "22");
        assert_eq!(
            empty.options,
            SshOptions {
                host: Some("empty".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_lines_before_first_host_are_ignored() {
        let config = parse_ssh_config_content("User global\nHost a\n");
        assert_eq!(config.len(), 1);
        assert!(config.get("a").unwrap().options.user.is_none());
    }

    #[test]
    fn test_host_line_syntaxes() {
        let config = parse_ssh_config_content("Host=one\nhost = two\nHOST\tthree\n");
        assert!(config.get("one").is_some());
        assert!(config.get("two").is_some());
        assert!(config.get("three").is_some());
    }

    #[test]
    fn test_proxy_command_none_is_unset() {
        let config = parse_ssh_config_content("Host a\n  ProxyCommand none\n");
        assert!(config.get("a").unwrap().options.proxy_command.is_none());
    }

    #[test]
    fn test_glob_patterns() {
        let content = r#"
Host web-* !web-secret
    User www
Host *.internal
    ProxyCommand ssh bastion -W %h:%p
Host *
    User fallback
    Port 2200
"#;
        let config = parse_ssh_config_content(content);

        let web = config.options_for("web-01");
        assert_eq!(web.user.as_deref(), Some("www"));
        assert_eq!(web.port(), "2200");

        let secret = config.options_for("web-secret");
        assert_eq!(secret.user.as_deref(), Some("fallback"));

        let internal = config.options_for("db.internal");
        assert_eq!(
            internal.proxy_command.as_deref(),
            Some("ssh bastion -W %h:%p")
        );
    }

    #[test]
    fn test_exact_section_wins_over_later_wildcard() {
        let config = parse_ssh_config_content("Host db\n  User dba\nHost *\n  User other\n");
        assert_eq!(config.options_for("db").user.as_deref(), Some("dba"));
        assert_eq!(config.options_for("unknown").user.as_deref(), Some("other"));
    }

    #[test]
    fn test_identity_file_resolution() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(resolve_identity("id_rsa"), home.join(".ssh").join("id_rsa"));
        assert_eq!(resolve_identity("~/keys/a"), home.join("keys").join("a"));
        assert_eq!(resolve_identity("/etc/key"), PathBuf::from("/etc/key"));
    }

    #[test]
    fn test_only_first_identity_file_is_kept() {
        let config = parse_ssh_config_content(
            "Host web\n  IdentityFile /keys/deploy\n  IdentityFile /keys/backup\nHost *\n  IdentityFile /keys/any\n",
        );
        assert_eq!(
            config.options_for("web").identity_file,
            Some(PathBuf::from("/keys/deploy"))
        );
    }

    #[tokio::test]
    async fn test_missing_config_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_ssh_config(&dir.path().join("nope")).await.unwrap();
        assert!(config.is_empty());
    }

    #[tokio::test]
    async fn test_parse_config_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host github.com\n  User github\n").unwrap();

        let config = parse_ssh_config(&path).await.unwrap();
        assert_eq!(config.get("github.com").unwrap().options.user.as_deref(), Some("github"));
    }
}
