//! SSH-backed [`HostRunner`]

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::job::{Job, JobWriter};
use super::pool::HostRunner;
use crate::ssh::{
    AuthChain, CommandRequest, Connector, KeyRing, RemoteSession, SshError,
};

/// Connects, authenticates and runs the command on each job's host
pub struct SshRunner {
    connector: Connector,
    auth: AuthChain,
    keys: KeyRing,
    request: CommandRequest,
    /// Agent present: forward it unless the host says `ForwardAgent no`
    agent_enabled: bool,
    quiet: bool,
}

impl SshRunner {
    pub fn new(
        connector: Connector,
        auth: AuthChain,
        keys: KeyRing,
        request: CommandRequest,
        agent_enabled: bool,
        quiet: bool,
    ) -> Self {
        Self {
            connector,
            auth,
            keys,
            request,
            agent_enabled,
            quiet,
        }
    }
}

#[async_trait]
impl HostRunner for SshRunner {
    async fn run(&self, job: Arc<Job>) -> Result<(), SshError> {
        let options = job
            .options()
            .ok_or_else(|| SshError::invalid_host(job.target(), "options not resolved"))?;
        debug!("Using SSH client options: {:?}", options);

        let chain = self
            .keys
            .chain_for(&self.auth, options.identity_file.as_deref());
        let handle = self
            .connector
            .establish_session(options, &chain, |phase| job.set_phase(phase))
            .await?;

        let forward_agent = options.forward_agent.unwrap_or(self.agent_enabled);
        let mut session = RemoteSession::new(handle);

        let result = if self.quiet {
            session
                .run(&self.request, forward_agent, &mut io::sink(), &mut io::sink())
                .await
        } else {
            let mut stdout = JobWriter::new(job.clone());
            let mut stderr = JobWriter::new(job.clone());
            let result = session
                .run(&self.request, forward_agent, &mut stdout, &mut stderr)
                .await;
            stdout.finish();
            stderr.finish();
            result
        };

        // A close error only matters when the command succeeded
        let closed = session.close().await;
        result.and(closed)
    }
}
