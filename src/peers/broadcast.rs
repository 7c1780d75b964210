//! Mute request publish/subscribe
//!
//! Each node publishes `request <mute|unmute> <id>` to every connected
//! subscriber and subscribes to each discovered peer's publisher. Delivery
//! is fire-and-forget: no acknowledgements, no ordering across peers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::router::codec::{read_multipart, write_multipart};
use crate::router::retry::{RetryPolicy, delay_for_attempt};
use crate::{Error, Result};

/// Topic every mute message starts with
pub const TOPIC: &str = "request";

/// Messages buffered per subscriber before it starts lagging
const FANOUT_CAPACITY: usize = 32;

/// Requested change to a peer's listening state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteAction {
    Mute,
    Unmute,
}

impl MuteAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mute => "mute",
            Self::Unmute => "unmute",
        }
    }
}

impl std::fmt::Display for MuteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mute or unmute request from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    pub action: MuteAction,
    /// Identity of the sending node
    pub peer: String,
}

impl PeerRequest {
    /// Wire form including the topic
    #[must_use]
    pub fn to_message(&self) -> String {
        format!("{TOPIC} {} {}", self.action, self.peer)
    }

    /// Parse a received message
    ///
    /// Returns `Ok(None)` for messages outside the topic.
    ///
    /// # Errors
    ///
    /// Returns error if a topic message does not carry exactly an action and
    /// an identifier
    pub fn parse(message: &str) -> Result<Option<Self>> {
        let Some(body) = message.strip_prefix(TOPIC) else {
            return Ok(None);
        };

        let mut tokens = body.split_whitespace();
        let (Some(action), Some(peer), None) = (tokens.next(), tokens.next(), tokens.next()) else {
            return Err(Error::Protocol(format!("malformed mute message: {message:?}")));
        };

        let action = match action {
            "mute" => MuteAction::Mute,
            "unmute" => MuteAction::Unmute,
            other => {
                return Err(Error::Protocol(format!("unknown mute action: {other:?}")));
            }
        };

        Ok(Some(Self {
            action,
            peer: peer.to_string(),
        }))
    }
}

/// Publishing side of the mute channel
#[derive(Debug, Clone)]
pub struct MutePublisher {
    identity: String,
    fanout: broadcast::Sender<Arc<str>>,
    subscribers: Arc<AtomicUsize>,
    local_addr: SocketAddr,
}

impl MutePublisher {
    /// Bind the publish port and start accepting subscribers
    ///
    /// The returned handle resolves with an error if accepting fails.
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn bind(
        addr: SocketAddr,
        identity: String,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Channel(format!("cannot bind mute publisher on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        let subscribers = Arc::new(AtomicUsize::new(0));

        tracing::info!(%local_addr, "mute publisher listening");

        let task = tokio::spawn(accept_loop(
            listener,
            fanout.clone(),
            Arc::clone(&subscribers),
            cancel,
        ));

        Ok((
            Self {
                identity,
                fanout,
                subscribers,
                local_addr,
            },
            task,
        ))
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribers currently connected
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Publish a request under this node's identity
    pub fn publish(&self, action: MuteAction) {
        let message = PeerRequest {
            action,
            peer: self.identity.clone(),
        }
        .to_message();

        match self.fanout.send(Arc::from(message.as_str())) {
            Ok(n) => tracing::debug!(%action, subscribers = n, "published mute request"),
            Err(_) => tracing::trace!(%action, "no subscribers for mute request"),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    fanout: broadcast::Sender<Arc<str>>,
    subscribers: Arc<AtomicUsize>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            r = listener.accept() => {
                r.map_err(|e| Error::Channel(format!("mute publisher accept failed: {e}")))?
            }
        };

        tracing::debug!(%peer, "subscriber connected");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        subscribers.fetch_add(1, Ordering::AcqRel);

        let rx = fanout.subscribe();
        let subscribers = Arc::clone(&subscribers);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            serve_subscriber(stream, rx, &cancel).await;
            subscribers.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(%peer, "subscriber disconnected");
        });
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<Arc<str>>,
    cancel: &CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            r = rx.recv() => r,
        };

        match message {
            Ok(message) => {
                if write_multipart(&mut stream, &[message.as_bytes()]).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "slow mute subscriber skipped messages");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Subscribe to a peer's publisher, forwarding requests to `sink`
///
/// Reconnects with backoff for as long as the node runs; a peer that goes
/// away is simply retried at the policy's maximum delay.
#[must_use]
pub fn spawn_subscription(
    addr: SocketAddr,
    sink: mpsc::UnboundedSender<PeerRequest>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                () = cancel.cancelled() => return,
                r = TcpStream::connect(addr) => r,
            };

            match connected {
                Ok(stream) => {
                    tracing::info!(peer = %addr, "subscribed to peer");
                    attempt = 0;
                    let end = tokio::select! {
                        () = cancel.cancelled() => return,
                        end = receive_requests(stream, &sink) => end,
                    };
                    match end {
                        Ok(()) => return,
                        Err(e) => tracing::debug!(peer = %addr, error = %e, "peer subscription dropped"),
                    }
                }
                Err(e) => tracing::debug!(peer = %addr, error = %e, "peer not reachable"),
            }

            let delay = delay_for_attempt(&policy, attempt.min(policy.max_retries));
            attempt = attempt.saturating_add(1);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    })
}

/// Read published messages until the stream fails
///
/// Returns `Ok(())` only if the request consumer went away.
async fn receive_requests(
    mut stream: TcpStream,
    sink: &mpsc::UnboundedSender<PeerRequest>,
) -> Result<()> {
    loop {
        let Some(parts) = read_multipart(&mut stream).await? else {
            return Err(Error::Channel("publisher closed the connection".to_string()));
        };

        let Some(first) = parts.first() else {
            continue;
        };
        let Ok(message) = std::str::from_utf8(first) else {
            tracing::warn!("dropping non-UTF-8 mute message");
            continue;
        };

        match PeerRequest::parse(message) {
            Ok(Some(request)) => {
                if sink.send(request).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => tracing::trace!(message, "message outside mute topic"),
            Err(e) => tracing::warn!(error = %e, "dropping malformed mute message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_requests() {
        let r = PeerRequest {
            action: MuteAction::Mute,
            peer: "kitchen".to_string(),
        };
        assert_eq!(r.to_message(), "request mute kitchen");
        assert_eq!(PeerRequest::parse(&r.to_message()).unwrap(), Some(r));
    }

    #[test]
    fn parses_unmute() {
        let r = PeerRequest::parse("request unmute b8:27:eb:01:02:03").unwrap().unwrap();
        assert_eq!(r.action, MuteAction::Unmute);
        assert_eq!(r.peer, "b8:27:eb:01:02:03");
    }

    #[test]
    fn other_topics_are_filtered() {
        assert_eq!(PeerRequest::parse("status mute kitchen").unwrap(), None);
        assert_eq!(PeerRequest::parse("").unwrap(), None);
    }

    #[test]
    fn malformed_bodies_rejected() {
        for msg in ["request", "request mute", "request mute a b", "request pause kitchen"] {
            assert!(matches!(PeerRequest::parse(msg), Err(Error::Protocol(_))), "{msg}");
        }
    }
}
