//! Per-session typed event routing.
//!
//! Listeners subscribe to one packet name or to every packet. The
//! `has_listeners` predicate is part of the contract, not an optimization:
//! the session and the bridge skip deserialization entirely when nobody is
//! listening, which is what keeps unobserved packets byte-identical on the
//! bridge path.

use crate::protocol::packet::{GamePacket, PacketName};
use ahash::AHashMap;

/// Interception outcome flags handed to each listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct Signal {
    /// Drop the packet instead of handling/forwarding it.
    pub cancelled: bool,
    /// The packet was edited and must be re-serialized.
    pub modified: bool,
}

/// A listener receives a mutable handle to the deserialized packet. An
/// `Err` is logged and does not stop dispatch.
pub type Listener = Box<dyn FnMut(&mut GamePacket, &mut Signal) -> anyhow::Result<()> + Send>;

#[derive(Default)]
pub struct Dispatcher {
    by_name: AHashMap<PacketName, Vec<Listener>>,
    all_packets: Vec<Listener>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to one packet name. Listeners on the same name fire in
    /// registration order.
    pub fn on(&mut self, name: PacketName, listener: Listener) {
        self.by_name.entry(name).or_default().push(listener);
    }

    /// Subscribes to every packet. Fires after the name-specific
    /// listeners.
    pub fn on_all(&mut self, listener: Listener) {
        self.all_packets.push(listener);
    }

    /// Fast-path check: is anyone interested in this name at all?
    pub fn has_listeners(&self, name: Option<PacketName>) -> bool {
        if !self.all_packets.is_empty() {
            return true;
        }
        name.is_some_and(|name| {
            self.by_name
                .get(&name)
                .is_some_and(|listeners| !listeners.is_empty())
        })
    }

    /// Runs all matching listeners. Specific-name listeners fire before
    /// the generic ones; a cancelled signal stops neither (later listeners
    /// may observe and undo it).
    pub fn emit(&mut self, packet: &mut GamePacket) -> Signal {
        let mut signal = Signal::default();
        if let Some(name) = packet.name() {
            if let Some(listeners) = self.by_name.get_mut(&name) {
                for listener in listeners {
                    if let Err(e) = listener(packet, &mut signal) {
                        tracing::warn!("Listener for {} failed: {e:#}", name.as_ref());
                    }
                }
            }
        }
        for listener in &mut self.all_packets {
            if let Err(e) = listener(packet, &mut signal) {
                tracing::warn!("Generic packet listener failed: {e:#}");
            }
        }
        signal
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .field("all_packets", &self.all_packets.len())
            .finish()
    }
}
