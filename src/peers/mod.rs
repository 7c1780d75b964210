//! Peer mute coordination
//!
//! Colocated nodes find each other through UDP announcements and exchange
//! mute requests over a publish/subscribe channel, so that while one node
//! listens or speaks its siblings stop listening.

mod broadcast;
mod discovery;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

pub use broadcast::{MuteAction, MutePublisher, PeerRequest, TOPIC, spawn_subscription};
pub use discovery::{
    ANNOUNCE_PREFIX, Announcer, BROADCAST_ADDR, DiscoveryListener, PeerRegistry, announcement,
    own_ip, parse_announcement,
};

use crate::config::PeersConfig;
use crate::router::RetryPolicy;
use crate::{Error, Result};

/// Subscriptions to discovered peers, one per address
pub struct Subscriptions {
    port: u16,
    sink: mpsc::UnboundedSender<PeerRequest>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    active: HashMap<Ipv4Addr, JoinHandle<()>>,
}

impl Subscriptions {
    /// Subscriptions that connect to each peer's publisher on `port`
    #[must_use]
    pub fn new(
        port: u16,
        sink: mpsc::UnboundedSender<PeerRequest>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            sink,
            policy,
            cancel,
            active: HashMap::new(),
        }
    }

    /// Subscribe to `ip` unless already subscribed
    ///
    /// Returns whether a new subscription was started.
    pub fn subscribe(&mut self, ip: Ipv4Addr) -> bool {
        if self.active.contains_key(&ip) {
            return false;
        }

        let addr = SocketAddr::V4(SocketAddrV4::new(ip, self.port));
        tracing::debug!(peer = %addr, "subscribing to peer");
        let handle = spawn_subscription(addr, self.sink.clone(), self.policy.clone(), self.cancel.clone());
        self.active.insert(ip, handle);
        true
    }

    #[must_use]
    pub fn is_subscribed(&self, ip: Ipv4Addr) -> bool {
        self.active.contains_key(&ip)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for handle in self.active.values() {
            handle.abort();
        }
    }
}

/// Running peer coordination
pub struct PeerLinks {
    /// Publishes this node's mute requests
    pub publisher: MutePublisher,
    /// Requests received from peers
    pub requests: mpsc::UnboundedReceiver<PeerRequest>,
    /// Resolves with an error if discovery or publishing fails
    pub task: JoinHandle<Result<()>>,
}

/// Start discovery, announcing, publishing and subscribing
///
/// # Errors
///
/// Returns error if the node has no IPv4 address or a port cannot be bound
pub async fn start(
    config: &PeersConfig,
    identity: &str,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> Result<PeerLinks> {
    let own = own_ip()?;

    let (publisher, publish_task) = MutePublisher::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
        identity.to_string(),
        cancel.clone(),
    )
    .await?;

    let listener =
        DiscoveryListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.discovery_port)), own)
            .await?;
    let announcer = Announcer::bind(
        own,
        SocketAddr::from((BROADCAST_ADDR, config.discovery_port)),
        config.discovery_interval,
    )
    .await?;

    let (request_tx, requests) = mpsc::unbounded_channel();
    let subscriptions = Subscriptions::new(config.port, request_tx, policy, cancel.clone());

    tracing::info!(
        own_ip = %own,
        port = config.port,
        discovery_port = config.discovery_port,
        "peer coordination started"
    );

    let task = tokio::spawn(supervise(listener, announcer, publish_task, subscriptions, cancel));

    Ok(PeerLinks {
        publisher,
        requests,
        task,
    })
}

/// Own the discovery tasks and subscribe to every new peer
async fn supervise(
    listener: DiscoveryListener,
    announcer: Announcer,
    mut publish_task: JoinHandle<Result<()>>,
    mut subscriptions: Subscriptions,
    cancel: CancellationToken,
) -> Result<()> {
    let (peer_tx, mut new_peers) = mpsc::unbounded_channel();
    let mut listen_task = tokio::spawn(listener.run(peer_tx, cancel.clone()));
    let mut announce_task = tokio::spawn(announcer.run(cancel.clone()));

    let result = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            Some(ip) = new_peers.recv() => {
                subscriptions.subscribe(ip);
            }
            r = &mut listen_task => break joined("discovery listener", r),
            r = &mut announce_task => break joined("announcer", r),
            r = &mut publish_task => break joined("mute publisher", r),
        }
    };

    listen_task.abort();
    announce_task.abort();
    publish_task.abort();
    result
}

fn joined(name: &str, r: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match r {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(Error::Channel(format!("{name} task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribes_once_per_peer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut subs = Subscriptions::new(1, tx, RetryPolicy::default(), cancel.clone());
        let ip = Ipv4Addr::new(127, 0, 0, 1);

        assert!(subs.subscribe(ip));
        assert!(!subs.subscribe(ip));
        assert!(subs.is_subscribed(ip));
        assert_eq!(subs.len(), 1);

        cancel.cancel();
    }
}
