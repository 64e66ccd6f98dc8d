//! One run: resolve every host, load credentials, dispatch, report.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::cli::{Cli, CliError, OutputFormat};
use crate::config::{default_ssh_config_path, parse_options, parse_ssh_config};
use crate::dispatch::{dispatch, write_json_report, Job, Renderer, SshRunner};
use crate::ssh::{
    build_auth_methods, default_options, terminal_prompt, CommandRequest, Connector,
    EffectiveOptions, KeyRing, KnownHostsStore, SshAgentClient, SshError, SSH_AUTH_SOCK,
};

/// Run `command` on every host of `cli`.
///
/// Returns whether every host succeeded. Errors are setup failures raised
/// before any host is contacted.
pub async fn run(cli: Cli, command: String) -> Result<bool, CliError> {
    let hosts = cli.load_hosts()?;
    let env = cli.env_vars()?;
    debug!("hosts {:?}", hosts);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_ssh_config_path()?,
    };
    let config = parse_ssh_config(&config_path).await?;
    info!("Loaded {} config section(s) from {}", config.len(), config_path.display());

    let cli_options = parse_options(&cli.options);
    let mut defaults = default_options();
    if let Some(user) = &cli.user {
        defaults.user = Some(user.clone());
    }

    let signal = Arc::new(Notify::new());
    let jobs: Vec<Arc<Job>> = hosts
        .iter()
        .map(|host| {
            let options = EffectiveOptions::resolve(host, &config, &cli_options, &defaults);
            Arc::new(Job::new(host.clone(), options, signal.clone()))
        })
        .collect();

    let agent = if cli.agent {
        Some(Arc::new(SshAgentClient::connect().await?))
    } else {
        None
    };
    let agent_socket = agent
        .as_ref()
        .map(|agent| agent.socket().clone())
        .or_else(|| std::env::var_os(SSH_AUTH_SOCK).map(PathBuf::from));

    // Every passphrase prompt happens here, before the live view starts
    let identity_files = cli.identity_files();
    let host_identities: Vec<PathBuf> = jobs
        .iter()
        .filter_map(|job| job.options()?.identity_file.clone())
        .collect();
    let chain_agent = agent.clone();
    let (auth, keys) = tokio::task::spawn_blocking(move || {
        let auth = build_auth_methods(&identity_files, chain_agent, &terminal_prompt);
        let keys = KeyRing::load(host_identities, &auth, &terminal_prompt);
        (auth, keys)
    })
    .await
    .map_err(|e| SshError::Key(format!("identity loading failed: {}", e)))?;

    let connector = Connector::new(KnownHostsStore::default_path(), agent_socket);
    let request = CommandRequest { command, env };
    let runner = Arc::new(SshRunner::new(
        connector,
        auth,
        keys,
        request,
        agent.is_some(),
        cli.quiet,
    ));

    let renderer = match cli.format {
        OutputFormat::Text => Some(Renderer::stdout(signal.clone())),
        OutputFormat::Json => None,
    };
    dispatch(&jobs, cli.concurrency, runner, renderer).await;

    if cli.format == OutputFormat::Json {
        write_json_report(&jobs, &mut io::stdout().lock())?;
    }

    let failed = jobs.iter().filter(|job| job.failed()).count();
    info!("Finished on {} host(s), {} failed", jobs.len(), failed);
    Ok(failed == 0)
}
