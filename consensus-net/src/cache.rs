//! Sliding-window event counters used for rate limiting.
//!
//! Each counter map is keyed by insertion instant; inserting drops every
//! bucket older than the window and returns how often the key was seen
//! within it, including the insertion itself.

use {
    parking_lot::RwLock,
    solana_hash::Hash,
    std::{
        collections::{BTreeMap, HashMap},
        hash::Hash as StdHash,
        net::{IpAddr, SocketAddr},
        time::{Duration, Instant},
    },
};

type Window<K> = RwLock<BTreeMap<Instant, HashMap<K, u32>>>;

#[derive(Debug, Default)]
pub struct Cache {
    seen_inbound_connections: Window<IpAddr>,
    seen_inbound_events: Window<SocketAddr>,
    /// Certificate digests received, to spot peers replaying the same one.
    seen_inbound_certificates: Window<Hash>,
    seen_outbound_events: Window<SocketAddr>,
    seen_outbound_sync_requests: Window<SocketAddr>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection from `peer_ip`; returns connections within the window.
    pub fn insert_inbound_connection(&self, peer_ip: IpAddr, interval_secs: u64) -> usize {
        Self::retain_and_insert(&self.seen_inbound_connections, peer_ip, interval_secs)
    }

    /// Record an envelope from `peer_addr`; returns events within the window.
    pub fn insert_inbound_event(&self, peer_addr: SocketAddr, interval_secs: u64) -> usize {
        Self::retain_and_insert(&self.seen_inbound_events, peer_addr, interval_secs)
    }

    pub fn insert_inbound_certificate(&self, digest: Hash, interval_secs: u64) -> usize {
        Self::retain_and_insert(&self.seen_inbound_certificates, digest, interval_secs)
    }

    pub fn insert_outbound_event(&self, peer_addr: SocketAddr, interval_secs: u64) -> usize {
        Self::retain_and_insert(&self.seen_outbound_events, peer_addr, interval_secs)
    }

    pub fn insert_outbound_sync_request(&self, peer_addr: SocketAddr, interval_secs: u64) -> usize {
        Self::retain_and_insert(&self.seen_outbound_sync_requests, peer_addr, interval_secs)
    }

    fn retain_and_insert<K: Copy + Eq + StdHash>(map: &Window<K>, key: K, interval_secs: u64) -> usize {
        let now = Instant::now();
        let mut map = map.write();
        let entry = map.entry(now).or_default().entry(key).or_default();
        *entry = entry.saturating_add(1);

        // A window reaching back past the clock origin keeps everything.
        if let Some(cutoff) = now.checked_sub(Duration::from_secs(interval_secs)) {
            let retained = map.split_off(&cutoff);
            *map = retained;
        }
        map.values()
            .filter_map(|keys| keys.get(&key))
            .fold(0usize, |hits, n| hits.saturating_add(*n as usize))
    }
}
