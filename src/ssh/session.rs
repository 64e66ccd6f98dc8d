//! Remote command execution
//!
//! One exec channel on an authenticated connection: optional agent
//! forwarding, environment variables, the command itself, then streamed
//! output until the server closes the channel.

use std::io::Write;

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tracing::{debug, info};

use super::client::ClientHandler;
use super::error::SshError;

/// What to run on every host
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub command: String,
    /// Applied in order before the command runs
    pub env: Vec<(String, String)>,
}

/// An established connection and, once opened, its exec channel
pub struct RemoteSession {
    handle: Handle<ClientHandler>,
    channel: Option<Channel<Msg>>,
    /// Server already sent Close for the channel
    channel_closed: bool,
}

impl RemoteSession {
    pub fn new(handle: Handle<ClientHandler>) -> Self {
        Self {
            handle,
            channel: None,
            channel_closed: false,
        }
    }

    /// Open the exec channel, run `request` and stream its output.
    ///
    /// Standard output goes to `stdout`, extended data to `stderr`. A
    /// non-zero exit status, an exit signal, or a channel that closes
    /// without reporting either is an error.
    pub async fn run<O, E>(
        &mut self,
        request: &CommandRequest,
        forward_agent: bool,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<(), SshError>
    where
        O: Write + Send,
        E: Write + Send,
    {
        let channel = self.handle.channel_open_session().await?;
        let channel = self.channel.insert(channel);

        if forward_agent {
            channel.agent_forward(true).await?;
            wait_reply(channel, &mut self.channel_closed)
                .await
                .map_err(|reason| {
                    SshError::Channel(format!("agent forwarding request {}", reason))
                })?;
            debug!("Agent forwarding enabled");
        }

        for (name, value) in &request.env {
            channel.set_env(true, name.as_str(), value.as_str()).await?;
            wait_reply(channel, &mut self.channel_closed)
                .await
                .map_err(|reason| SshError::Environment {
                    name: name.clone(),
                    reason: reason.to_string(),
                })?;
        }

        debug!("Executing: {}", request.command);
        channel.exec(true, request.command.as_str()).await?;

        let mut exit_status = None;
        let mut exit_signal = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.write_all(data)?,
                ChannelMsg::ExtendedData { ref data, ext } => {
                    if ext != 1 {
                        debug!("Extended data of type {} treated as stderr", ext);
                    }
                    stderr.write_all(data)?
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    exit_signal = Some(format!("{:?}", signal_name))
                }
                ChannelMsg::Failure => {
                    return Err(SshError::Channel("exec request rejected".to_string()))
                }
                ChannelMsg::Close => {
                    self.channel_closed = true;
                    break;
                }
                _ => {}
            }
        }

        stdout.flush()?;
        stderr.flush()?;

        if let Some(signal) = exit_signal {
            return Err(SshError::ExitSignal(signal));
        }
        match exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(SshError::ExitStatus(code)),
            None => Err(SshError::ExitMissing),
        }
    }

    /// Close the channel, then the connection.
    pub async fn close(self) -> Result<(), SshError> {
        if let Some(channel) = self.channel {
            if !self.channel_closed {
                if let Err(e) = channel.close().await {
                    debug!("Channel close: {}", e);
                }
            }
        }

        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await?;
        info!("Session closed");
        Ok(())
    }
}

/// Wait for the Success/Failure reply to a `want_reply` request
async fn wait_reply(channel: &mut Channel<Msg>, closed: &mut bool) -> Result<(), &'static str> {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Success => return Ok(()),
            ChannelMsg::Failure => return Err("rejected by server"),
            ChannelMsg::Close => {
                *closed = true;
                return Err("failed: channel closed");
            }
            _ => {}
        }
    }
    *closed = true;
    Err("failed: channel closed")
}
