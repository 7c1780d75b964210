//! UDP presence gossip
//!
//! Every node broadcasts `hello;<ipv4>` on the discovery port at a fixed
//! interval and listens on the same port. Announcements from new addresses
//! are handed upward once; self-announcements and repeats are ignored.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Prefix of every announcement
pub const ANNOUNCE_PREFIX: &str = "hello;";

/// Limited broadcast address announcements are sent to
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Format the announcement for `ip`
#[must_use]
pub fn announcement(ip: Ipv4Addr) -> String {
    format!("{ANNOUNCE_PREFIX}{ip}")
}

/// Parse an announcement datagram
///
/// # Errors
///
/// Returns error if the datagram is not `hello;<ipv4>`
pub fn parse_announcement(data: &[u8]) -> Result<Ipv4Addr> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::Discovery("announcement is not UTF-8".to_string()))?;

    let addr = text
        .trim()
        .strip_prefix(ANNOUNCE_PREFIX)
        .ok_or_else(|| Error::Discovery(format!("unexpected announcement: {text:?}")))?;

    addr.parse()
        .map_err(|_| Error::Discovery(format!("bad peer address: {addr:?}")))
}

/// Set of known peer addresses
#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    peers: HashSet<Ipv4Addr>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer; returns `true` the first time it is seen
    pub fn observe(&mut self, ip: Ipv4Addr) -> bool {
        self.peers.insert(ip)
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.peers.contains(&ip)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Determine the address this host uses for outbound traffic
///
/// Connecting a UDP socket sends nothing; it only selects a route.
///
/// # Errors
///
/// Returns error if the host has no usable IPv4 route
pub fn own_ip() -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 80))
        .map_err(|e| Error::Discovery(format!("no IPv4 route: {e}")))?;

    match socket.local_addr()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => Err(Error::Discovery(format!("no usable IPv4 address ({other})"))),
    }
}

/// Receives announcements and reports new peers
pub struct DiscoveryListener {
    socket: UdpSocket,
    own_ip: Ipv4Addr,
    registry: PeerRegistry,
}

impl DiscoveryListener {
    /// Bind the discovery port
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn bind(addr: SocketAddr, own_ip: Ipv4Addr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Discovery(format!("cannot bind discovery port {addr}: {e}")))?;

        tracing::debug!(%addr, %own_ip, "discovery listener bound");

        Ok(Self {
            socket,
            own_ip,
            registry: PeerRegistry::new(),
        })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns error if the socket address is unavailable
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Peers seen so far
    #[must_use]
    pub const fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Process one datagram; returns the peer if it is new
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<Ipv4Addr> {
        let ip = match parse_announcement(data) {
            Ok(ip) => ip,
            Err(e) => {
                tracing::debug!(%from, error = %e, "ignoring datagram");
                return None;
            }
        };

        if ip == self.own_ip || !self.registry.observe(ip) {
            return None;
        }

        tracing::info!(peer = %ip, "discovered peer");
        Some(ip)
    }

    /// Receive until cancelled, sending each new peer to `new_peers`
    ///
    /// # Errors
    ///
    /// Returns error if the socket fails
    pub async fn run(
        mut self,
        new_peers: mpsc::UnboundedSender<Ipv4Addr>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut buf = [0u8; 512];

        loop {
            let (len, from) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                r = self.socket.recv_from(&mut buf) => {
                    r.map_err(|e| Error::Discovery(format!("discovery receive failed: {e}")))?
                }
            };

            if let Some(ip) = self.handle_datagram(&buf[..len], from) {
                if new_peers.send(ip).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Periodically broadcasts this node's presence
pub struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
    message: String,
    interval: Duration,
}

impl Announcer {
    /// Prepare a broadcast socket
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be created
    pub async fn bind(own_ip: Ipv4Addr, target: SocketAddr, interval: Duration) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| Error::Discovery(format!("cannot open announce socket: {e}")))?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket,
            target,
            message: announcement(own_ip),
            interval,
        })
    }

    /// Announce until cancelled
    ///
    /// Send failures are logged and retried on the next tick.
    ///
    /// # Errors
    ///
    /// Does not fail; send errors are only logged
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(dest = %self.target, message = %self.message, "announcing presence");

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.socket.send_to(self.message.as_bytes(), self.target).await {
                        tracing::warn!(dest = %self.target, error = %e, "announcement failed");
                    }
                }
            }
        }
    }
}
