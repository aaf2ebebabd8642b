//! The RakNet-facing seam.
//!
//! The pipeline neither owns sockets nor re-implements reliability; it
//! exchanges opaque "encapsulated game payload" datagrams with whatever
//! drives the wire. That contract is expressed as a pair of channels per
//! connection: a real RakNet worker speaks the same
//! `{connect, send, disconnect}` / `{packet, connected}` protocol, and the
//! in-memory link below implements it for loopback use.
//!
//! Ordered delivery on the game channel is the transport's responsibility;
//! the channels preserve send order, matching what RakNet guarantees.

use crate::error::TransportError;
use bytes::Bytes;
use std::net::SocketAddr;

/// Outbound half of a connection. The session holds this (a handle, not
/// the socket); dropping it closes the connection.
#[derive(Debug, Clone)]
pub struct DatagramSender {
    peer: SocketAddr,
    tx: flume::Sender<Bytes>,
}

impl DatagramSender {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Hands one encapsulated game payload to the transport.
    pub fn send(&self, datagram: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(datagram)
            .map_err(|_| TransportError::Closed)
    }
}

/// Inbound half of a connection, held by the session's driver.
#[derive(Debug)]
pub struct DatagramReceiver {
    peer: SocketAddr,
    rx: flume::Receiver<Bytes>,
}

impl DatagramReceiver {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Waits for the next datagram. `None` once the peer is gone and the
    /// channel has drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive, for drivers polling between selects.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Datagrams queued but not yet received.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// One side of an established connection.
#[derive(Debug)]
pub struct Endpoint {
    pub sender: DatagramSender,
    pub receiver: DatagramReceiver,
}

impl Endpoint {
    pub fn peer(&self) -> SocketAddr {
        self.sender.peer()
    }

    pub fn split(self) -> (DatagramSender, DatagramReceiver) {
        (self.sender, self.receiver)
    }
}

/// Anything able to originate a connection toward a fixed destination.
/// The bridge uses this to reach the real server.
pub trait Connector: Send + Sync {
    fn destination(&self) -> SocketAddr;
    fn connect(&self, from: SocketAddr) -> Result<Endpoint, TransportError>;
}

/// Builds a connected pair of endpoints joined by in-memory channels.
pub fn link(a: SocketAddr, b: SocketAddr) -> (Endpoint, Endpoint) {
    let (a_to_b_tx, a_to_b_rx) = flume::unbounded();
    let (b_to_a_tx, b_to_a_rx) = flume::unbounded();
    (
        Endpoint {
            sender: DatagramSender { peer: b, tx: a_to_b_tx },
            receiver: DatagramReceiver { peer: b, rx: b_to_a_rx },
        },
        Endpoint {
            sender: DatagramSender { peer: a, tx: b_to_a_tx },
            receiver: DatagramReceiver { peer: a, rx: a_to_b_rx },
        },
    )
}

/// Accept side of an in-memory listener.
#[derive(Debug)]
pub struct MemoryListener {
    address: SocketAddr,
    incoming: flume::Receiver<Endpoint>,
}

impl MemoryListener {
    /// Creates a listener and the connector handle clients use to reach
    /// it.
    pub fn bind(address: SocketAddr) -> (Self, MemoryConnector) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                address,
                incoming: rx,
            },
            MemoryConnector { address, tx },
        )
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Waits for the next inbound connection. `None` once every connector
    /// handle is gone.
    pub async fn accept(&self) -> Option<Endpoint> {
        self.incoming.recv_async().await.ok()
    }
}

/// Client-side handle for reaching a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    address: SocketAddr,
    tx: flume::Sender<Endpoint>,
}

impl Connector for MemoryConnector {
    fn destination(&self) -> SocketAddr {
        self.address
    }

    fn connect(&self, from: SocketAddr) -> Result<Endpoint, TransportError> {
        let (local, remote) = link(from, self.address);
        self.tx
            .send(remote)
            .map_err(|_| TransportError::NoRoute(self.address))?;
        Ok(local)
    }
}
