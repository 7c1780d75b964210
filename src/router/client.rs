//! Command channel connection to the recognition router

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{read_multipart, write_multipart};
use super::command::{GREET, OutboundCommand, RouterDirective};
use super::retry::{RetryPolicy, delay_for_attempt};
use super::tracker::UtteranceTracker;
use crate::{Error, Result};

/// Sending half of the command channel
///
/// Cloneable; commands are queued and written in order by the connection task.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    outbound: mpsc::UnboundedSender<OutboundCommand>,
}

impl CommandChannel {
    /// A channel whose commands are read from the returned receiver
    ///
    /// Lets the commands be consumed by something other than a router
    /// connection, such as a local recorder.
    #[must_use]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { outbound: tx }, rx)
    }

    /// Queue a command for the router
    ///
    /// # Errors
    ///
    /// Returns error if the connection task has stopped
    pub fn send(&self, command: OutboundCommand) -> Result<()> {
        self.outbound
            .send(command)
            .map_err(|e| Error::Channel(format!("command channel closed, dropped {}", e.0.command)))
    }
}

/// Router connection settings
#[derive(Debug, Clone)]
pub struct RouterLink {
    /// Router address (`host:port`)
    pub address: String,
    /// Identity frame sent on every connection
    pub identity: String,
    /// Reconnect policy
    pub policy: RetryPolicy,
}

/// How a connected session ended
enum SessionEnd {
    Cancelled,
    Lost(Error),
}

impl RouterLink {
    /// Spawn the connection task
    ///
    /// Inbound directives are forwarded to `directives`. The returned handle
    /// resolves with an error once the reconnect policy is exhausted.
    #[must_use]
    pub fn spawn(
        self,
        directives: mpsc::UnboundedSender<RouterDirective>,
        cancel: CancellationToken,
    ) -> (CommandChannel, JoinHandle<Result<()>>) {
        let (channel, rx) = CommandChannel::detached();
        let handle = tokio::spawn(async move { self.run(rx, directives, cancel).await });
        (channel, handle)
    }

    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<OutboundCommand>,
        directives: mpsc::UnboundedSender<RouterDirective>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut tracker = UtteranceTracker::new();
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                r = self.connect() => r,
            };

            let (reader, writer) = match connected {
                Ok(halves) => {
                    failures = 0;
                    halves
                }
                Err(e) => {
                    failures += 1;
                    if !self.policy.allows(failures) {
                        return Err(Error::Channel(format!(
                            "router {} unreachable after {failures} attempts: {e}",
                            self.address
                        )));
                    }
                    let delay = delay_for_attempt(&self.policy, failures - 1);
                    tracing::warn!(
                        address = %self.address,
                        error = %e,
                        attempt = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "router connect failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            match session(reader, writer, &mut outbound, &mut tracker, &directives, &cancel).await {
                SessionEnd::Cancelled => return Ok(()),
                SessionEnd::Lost(e) => {
                    tracing::warn!(address = %self.address, error = %e, "router connection lost");
                    tracker.connection_lost();
                    failures = 1;
                }
            }
        }
    }

    /// Connect and perform the identity + greet handshake
    async fn connect(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        tracing::info!(address = %self.address, "connecting to router");
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();

        write_multipart(&mut writer, &[self.identity.as_bytes()]).await?;
        tracing::info!(identity = %self.identity, "sending greetings to router");
        write_multipart(&mut writer, &[GREET.as_bytes(), &[]]).await?;

        Ok((reader, writer))
    }
}

/// Pump commands out and directives in until the connection fails
async fn session(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    outbound: &mut mpsc::UnboundedReceiver<OutboundCommand>,
    tracker: &mut UtteranceTracker,
    directives: &mpsc::UnboundedSender<RouterDirective>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let sink = directives.clone();
    let mut inbound: JoinHandle<Result<()>> =
        tokio::spawn(async move { receive_directives(&mut reader, &sink).await });

    let end = loop {
        tokio::select! {
            () = cancel.cancelled() => break SessionEnd::Cancelled,
            joined = &mut inbound => {
                let err = match joined {
                    Ok(Ok(())) => break SessionEnd::Cancelled,
                    Ok(Err(e)) => e,
                    Err(e) => Error::Channel(format!("router reader failed: {e}")),
                };
                break SessionEnd::Lost(err);
            }
            next = outbound.recv() => {
                let Some(OutboundCommand { command, payload }) = next else {
                    break SessionEnd::Cancelled;
                };
                if !tracker.admit(command) {
                    continue;
                }
                if let Err(e) = write_multipart(&mut writer, &[command.as_str().as_bytes(), payload.as_slice()]).await {
                    break SessionEnd::Lost(e);
                }
                tracing::trace!(%command, bytes = payload.len(), "sent command");
            }
        }
    };

    inbound.abort();
    end
}

/// Read and decode router messages until the stream ends
///
/// Returns `Ok(())` only if the directive consumer went away.
async fn receive_directives(
    reader: &mut OwnedReadHalf,
    sink: &mpsc::UnboundedSender<RouterDirective>,
) -> Result<()> {
    loop {
        let Some(parts) = read_multipart(reader).await? else {
            return Err(Error::Channel("router closed the connection".to_string()));
        };

        match RouterDirective::decode(parts) {
            Ok(directive) => {
                if sink.send(directive).is_err() {
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "dropping malformed router message"),
        }
    }
}
