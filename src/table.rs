//! The session table: demultiplexes inbound datagrams onto transfers.
//!
//! Keys are client endpoints in a canonical form -- IPv4 addresses are
//! stored as their IPv4-mapped-IPv6 equivalent so clients of both families
//! share one table. A peer may hold several concurrent sessions; the
//! receiving socket disambiguates them.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::session::Session;
use crate::transport::SocketId;

/// Maps a peer address to the canonical (IPv6-mapped) form used as a table
/// key.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

/// Maps a canonical address back to the form the wire wants: IPv4-mapped
/// addresses become plain IPv4 so replies leave an IPv4 socket.
pub fn wire_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    entries: HashMap<SocketAddr, Vec<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the session for `peer` whose reply channel is `socket`.
    pub fn get_mut(&mut self, peer: SocketAddr, socket: SocketId) -> Option<&mut Session> {
        self.entries
            .get_mut(&peer)?
            .iter_mut()
            .find(|s| s.socket == socket)
    }

    /// Whether `peer` has any live session, regardless of socket. Used to
    /// spot retransmitted requests arriving on the listening socket.
    pub fn contains_peer(&self, peer: SocketAddr) -> bool {
        self.entries.contains_key(&peer)
    }

    pub fn insert(&mut self, session: Session) {
        self.entries.entry(session.peer).or_default().push(session);
    }

    pub fn remove(&mut self, peer: SocketAddr, socket: SocketId) -> Option<Session> {
        let sessions = self.entries.get_mut(&peer)?;
        let index = sessions.iter().position(|s| s.socket == socket)?;
        let session = sessions.swap_remove(index);
        if sessions.is_empty() {
            self.entries.remove(&peer);
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RttClamps;

    fn session(peer: SocketAddr, socket: SocketId) -> Session {
        Session::new(peer, wire_addr(peer), socket, RttClamps::default())
    }

    #[test]
    fn ipv4_peers_share_the_ipv6_keyspace() {
        let v4: SocketAddr = "192.0.2.7:2048".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:2048".parse().unwrap();
        assert_eq!(canonical(v4), mapped);
        assert_eq!(canonical(mapped), mapped);
        assert_eq!(wire_addr(mapped), v4);
    }

    #[test]
    fn plain_ipv6_addresses_are_already_canonical() {
        let v6: SocketAddr = "[2001:db8::1]:69".parse().unwrap();
        assert_eq!(canonical(v6), v6);
        assert_eq!(wire_addr(v6), v6);
    }

    #[test]
    fn lookup_is_disambiguated_by_socket() {
        let peer = canonical("192.0.2.7:2048".parse().unwrap());
        let mut table = SessionTable::new();
        table.insert(session(peer, 10));
        table.insert(session(peer, 11));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get_mut(peer, 10).unwrap().socket, 10);
        assert_eq!(table.get_mut(peer, 11).unwrap().socket, 11);
        assert!(table.get_mut(peer, 12).is_none());
    }

    #[test]
    fn remove_drops_the_peer_entry_with_its_last_session() {
        let peer = canonical("[2001:db8::2]:1069".parse().unwrap());
        let mut table = SessionTable::new();
        table.insert(session(peer, 3));

        assert!(table.remove(peer, 99).is_none());
        assert!(table.contains_peer(peer));
        assert!(table.remove(peer, 3).is_some());
        assert!(!table.contains_peer(peer));
        assert!(table.is_empty());
        // Removal is idempotent.
        assert!(table.remove(peer, 3).is_none());
    }
}
