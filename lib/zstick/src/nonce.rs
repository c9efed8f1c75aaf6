use hashbrown::HashMap;
use std::time::{Duration, Instant};
use zcore::crypto::{self, NONCE_SIZE};
use zcore::logging::{debug, error, Trace};
use zcore::NodeId;

// A misbehaving peer could otherwise grow the cache without bound
const HARD_CAP: usize = 32;

#[derive(Clone)]
struct NonceRecord {
    nonce: [u8; NONCE_SIZE],
    valid_until: Instant,
}

impl NonceRecord {
    #[inline]
    fn id(&self) -> u8 {
        self.nonce[0]
    }

    #[inline]
    fn expired(&self, now: Instant) -> bool {
        self.valid_until <= now
    }
}

/// The nonce caches of the secure class. Incoming nonces are ones we issued
/// and expect back in a secure frame from the node we gave them to;
/// outgoing nonces are ones a remote node pre-sent us so we may encrypt
/// toward it. Single threaded, owned by the I/O thread.
pub struct NonceCache {
    incoming: HashMap<NodeId, Vec<NonceRecord>>,
    outgoing: HashMap<NodeId, Vec<NonceRecord>>,
    next_id: u8,
    incoming_ttl: Duration,
    outgoing_ttl: Duration,
    trace: Trace,
}

impl NonceCache {
    pub fn new(incoming_ttl: Duration, outgoing_ttl: Duration, trace: Trace) -> NonceCache {
        // Pick a random starting id; zero and 0xFF are reserved
        let mut seed = [0u8; 1];
        crypto::random_bytes(&mut seed);
        let mut next_id = seed[0] & 0xFE;
        if next_id == 0 {
            next_id = 132;
        }

        NonceCache {
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            next_id,
            incoming_ttl,
            outgoing_ttl,
            trace,
        }
    }

    /// Creates a fresh nonce for the node, stores it on the incoming side
    /// and returns a copy for emission on the wire.
    pub fn issue(&mut self, node: NodeId) -> [u8; NONCE_SIZE] {
        let now = Instant::now();
        Self::prune_entry(self.incoming.entry(node).or_insert_with(Vec::new), now);

        if self.total_incoming() >= HARD_CAP {
            // Peer pathology: flush and start over rather than grow
            error!(self.trace.log(), "incoming nonce cache overflowed, flushing";
                   "count" => self.total_incoming());
            self.incoming.clear();
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = self.next_id;
        crypto::random_bytes(&mut nonce[1..]);

        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0xFF {
            self.next_id = 1;
        }

        let record = NonceRecord {
            nonce,
            valid_until: now + self.incoming_ttl,
        };
        self.incoming.entry(node).or_insert_with(Vec::new).push(record);

        if self.trace.medium() {
            debug!(self.trace.log(), "issued nonce";
                   "node" => node,
                   "nonce_id" => nonce[0]);
        }

        nonce
    }

    /// Removes and returns the matching incoming nonce, if we issued one to
    /// this node and it has not expired. Each nonce is consumed at most
    /// once.
    pub fn consume_incoming(&mut self, nonce_id: u8, node: NodeId) -> Option<[u8; NONCE_SIZE]> {
        let now = Instant::now();
        let records = self.incoming.get_mut(&node)?;
        Self::prune_entry(records, now);

        let index = records.iter().position(|record| record.id() == nonce_id)?;
        let record = records.remove(index);

        if self.trace.medium() {
            debug!(self.trace.log(), "using stored in nonce";
                   "node" => node,
                   "nonce_id" => nonce_id,
                   "remaining" => records.len());
        }

        Some(record.nonce)
    }

    /// Removes and returns the soonest expiring valid outgoing nonce for
    /// the node.
    pub fn consume_outgoing(&mut self, node: NodeId) -> Option<[u8; NONCE_SIZE]> {
        let now = Instant::now();
        let records = self.outgoing.get_mut(&node)?;
        Self::prune_entry(records, now);

        let best = records
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| record.valid_until)
            .map(|(index, _)| index)?;
        let record = records.remove(best);

        if self.trace.medium() {
            debug!(self.trace.log(), "using stored out nonce";
                   "node" => node,
                   "nonce_id" => record.id(),
                   "remaining" => records.len());
        }

        Some(record.nonce)
    }

    /// Stores a nonce a remote node pre-sent us. Deduplicated by node and
    /// nonce id; a repeat refreshes the deadline.
    pub fn store_outgoing(&mut self, node: NodeId, nonce: [u8; NONCE_SIZE]) {
        let now = Instant::now();
        let valid_until = now + self.outgoing_ttl;

        if self.total_outgoing() >= HARD_CAP {
            error!(self.trace.log(), "outgoing nonce cache overflowed, flushing";
                   "count" => self.total_outgoing());
            self.outgoing.clear();
        }

        let records = self.outgoing.entry(node).or_insert_with(Vec::new);
        Self::prune_entry(records, now);

        if let Some(existing) = records.iter_mut().find(|record| record.id() == nonce[0]) {
            existing.nonce = nonce;
            existing.valid_until = valid_until;
            return;
        }

        if self.trace.medium() {
            debug!(self.trace.log(), "storing out nonce for later use";
                   "node" => node,
                   "nonce_id" => nonce[0]);
        }

        records.push(NonceRecord { nonce, valid_until });
    }

    /// Invalidates everything. Called when replication starts, because the
    /// network key may be about to change.
    pub fn flush_all(&mut self) {
        if self.trace.low() {
            debug!(self.trace.log(), "flushing both nonce caches";
                   "incoming" => self.total_incoming(),
                   "outgoing" => self.total_outgoing());
        }
        self.incoming.clear();
        self.outgoing.clear();
    }

    #[inline]
    pub fn total_incoming(&self) -> usize {
        self.incoming.values().map(Vec::len).sum()
    }

    #[inline]
    pub fn total_outgoing(&self) -> usize {
        self.outgoing.values().map(Vec::len).sum()
    }

    fn prune_entry(records: &mut Vec<NonceRecord>, now: Instant) {
        records.retain(|record| !record.expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zcore::logging::{discard, TraceLevel};

    fn cache() -> NonceCache {
        NonceCache::new(
            Duration::from_secs(10),
            Duration::from_secs(5),
            Trace::new(discard(), TraceLevel::Off),
        )
    }

    fn cache_with_ttl(ttl: Duration) -> NonceCache {
        NonceCache::new(ttl, ttl, Trace::new(discard(), TraceLevel::Off))
    }

    #[test]
    fn test_issue_and_consume_incoming() {
        let mut cache = cache();

        let nonce = cache.issue(7);
        assert_ne!(nonce[0], 0);
        assert_ne!(nonce[0], 0xFF);
        assert_eq!(cache.total_incoming(), 1);

        let found = cache.consume_incoming(nonce[0], 7);
        assert_eq!(found, Some(nonce));

        // Consumed at most once
        assert_eq!(cache.consume_incoming(nonce[0], 7), None);
        assert_eq!(cache.total_incoming(), 0);
    }

    #[test]
    fn test_consume_incoming_checks_node() {
        let mut cache = cache();
        let nonce = cache.issue(7);

        assert_eq!(cache.consume_incoming(nonce[0], 8), None);
        assert_eq!(cache.consume_incoming(nonce[0], 7), Some(nonce));
    }

    #[test]
    fn test_ids_skip_reserved_values() {
        let mut cache = cache();
        for _ in 0..600 {
            let nonce = cache.issue(3);
            assert_ne!(nonce[0], 0);
            assert_ne!(nonce[0], 0xFF);
        }
    }

    #[test]
    fn test_outgoing_soonest_expiring_wins() {
        let mut cache = cache();

        let mut first = [0u8; NONCE_SIZE];
        first[0] = 0x10;
        let mut second = [0u8; NONCE_SIZE];
        second[0] = 0x20;

        cache.store_outgoing(9, first);
        std::thread::sleep(Duration::from_millis(10));
        cache.store_outgoing(9, second);

        // The older record expires sooner and must be picked first
        assert_eq!(cache.consume_outgoing(9).unwrap()[0], 0x10);
        assert_eq!(cache.consume_outgoing(9).unwrap()[0], 0x20);
        assert_eq!(cache.consume_outgoing(9), None);
    }

    #[test]
    fn test_store_outgoing_dedups_by_id() {
        let mut cache = cache();

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = 0x33;
        cache.store_outgoing(4, nonce);

        nonce[1] = 0xAB;
        cache.store_outgoing(4, nonce);

        assert_eq!(cache.total_outgoing(), 1);
        let stored = cache.consume_outgoing(4).unwrap();
        assert_eq!(stored[1], 0xAB);
    }

    #[test]
    fn test_expiry() {
        let mut cache = cache_with_ttl(Duration::from_millis(20));

        let nonce = cache.issue(5);
        let mut out = [0u8; NONCE_SIZE];
        out[0] = 0x44;
        cache.store_outgoing(5, out);

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.consume_incoming(nonce[0], 5), None);
        assert_eq!(cache.consume_outgoing(5), None);
    }

    #[test]
    fn test_hard_cap_flushes() {
        let mut cache = cache();

        for index in 0..40u8 {
            let mut nonce = [0u8; NONCE_SIZE];
            nonce[0] = index + 1;
            cache.store_outgoing(index, nonce);
        }

        // The cap flushed the cache on the way; it never exceeds it
        assert!(cache.total_outgoing() <= HARD_CAP);
    }

    #[test]
    fn test_flush_all() {
        let mut cache = cache();
        cache.issue(1);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = 9;
        cache.store_outgoing(2, nonce);

        cache.flush_all();
        assert_eq!(cache.total_incoming(), 0);
        assert_eq!(cache.total_outgoing(), 0);
    }
}
