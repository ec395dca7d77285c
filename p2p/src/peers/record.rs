//! Per-peer bookkeeping: the address itself, where we heard about it, and
//! the history of our attempts to reach it.

use std::net::SocketAddr;

use super::{buckets, HORIZON_DAYS, MAX_FAILURES, MAX_RETRIES, MIN_FAIL_DAYS};

/// Everything the address manager knows about a single candidate peer.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// The advertised endpoint
    pub address: SocketAddr,
    /// The peer that told us about `address`
    pub source: SocketAddr,
    /// Last time the peer was reported alive, as gossiped (seconds since
    /// Unix epoch)
    pub timestamp: i64,
    /// Last successful connection
    pub last_success: i64,
    /// Last connection attempt
    pub last_try: i64,
    /// Last attempt that was counted as a failure
    pub last_count_attempt: i64,
    /// Connection attempts since the last success
    pub num_attempts: u32,
    /// Number of new table cells referencing this record; zero while tried
    pub(crate) ref_count: u32,
    /// Whether the record occupies a tried table cell
    pub(crate) is_tried: bool,
    /// Index of this record in the random selection order
    pub(crate) random_pos: usize,
}

impl PeerRecord {
    /// Create a record for a freshly heard address. A record with no source
    /// is its own source, so manually added addresses bucket as if the peer
    /// had announced itself.
    pub(crate) fn new(address: SocketAddr, timestamp: i64, source: Option<SocketAddr>) -> Self {
        PeerRecord {
            address,
            source: source.unwrap_or(address),
            timestamp,
            last_success: 0,
            last_try: 0,
            last_count_attempt: 0,
            num_attempts: 0,
            ref_count: 0,
            is_tried: false,
            random_pos: 0,
        }
    }

    /// Whether the record occupies a tried table cell
    pub fn is_tried(&self) -> bool {
        self.is_tried
    }

    /// Number of new table cells referencing this record
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Tried table bucket of this record
    pub fn tried_bucket(&self, key: &[u8; 32]) -> usize {
        buckets::tried_bucket(key, &self.address)
    }

    /// New table bucket of this record with regards to a source address,
    /// defaulting to the source it was first heard from
    pub fn new_bucket(&self, key: &[u8; 32], source: Option<&SocketAddr>) -> usize {
        buckets::new_bucket(key, &self.address, source.unwrap_or(&self.source))
    }

    /// Position of this record inside a bucket of the new (`is_new`) or
    /// tried table
    pub fn bucket_position(&self, key: &[u8; 32], is_new: bool, bucket: usize) -> usize {
        buckets::bucket_position(key, is_new, bucket, &self.address)
    }

    /// Whether this record is safe to evict: stale, from the future, or
    /// failing for long enough that keeping it only wastes table space.
    pub fn is_terrible(&self, now: i64) -> bool {
        // never remove things tried in the last minute
        if self.last_try > 0 && self.last_try >= now - 60 {
            return false;
        }

        // came in a flying DeLorean
        if self.timestamp > now + 10 * 60 {
            return true;
        }

        // not seen in recent history
        if self.timestamp == 0 || now - self.timestamp > HORIZON_DAYS * 24 * 60 * 60 {
            return true;
        }

        // tried several times and never a success
        if self.last_success == 0 && self.num_attempts >= MAX_RETRIES {
            return true;
        }

        // several successive failures in the last week
        if now - self.last_success > MIN_FAIL_DAYS * 24 * 60 * 60
            && self.num_attempts >= MAX_FAILURES
        {
            return true;
        }

        false
    }

    /// Relative chance of this record being picked by peer selection
    pub fn selection_chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;
        let since_last_try = (now - self.last_try).max(0);

        // deprioritize very recent attempts
        if since_last_try < 60 * 10 {
            chance *= 0.01;
        }

        // deprioritize 66% after each failed attempt, but at most 1/28th to
        // avoid the search taking forever or overly penalizing outages
        chance *= 0.66_f64.powi(self.num_attempts.min(8) as i32);

        chance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str) -> PeerRecord {
        PeerRecord::new(address.parse().unwrap(), 10_000, None)
    }

    #[test]
    fn fresh_record_is_its_own_source() {
        let info = record("1.2.3.4:8444");

        assert_eq!(info.source, info.address);
        assert_eq!(info.ref_count(), 0);
        assert!(!info.is_tried());
    }

    #[test]
    fn record_from_the_future_is_terrible() {
        let mut info = record("1.2.3.4:8444");
        info.timestamp = 20_000;

        assert!(info.is_terrible(10_000));
    }

    #[test]
    fn recently_tried_record_is_never_terrible() {
        let mut info = record("1.2.3.4:8444");
        info.timestamp = 0;
        info.last_try = 9_990;

        assert!(!info.is_terrible(10_000));
    }

    #[test]
    fn record_without_recent_sighting_is_terrible() {
        let mut info = record("1.2.3.4:8444");
        let now = 40 * 24 * 60 * 60;

        assert!(info.is_terrible(now));

        info.timestamp = now - HORIZON_DAYS * 24 * 60 * 60 + 10;
        assert!(!info.is_terrible(now));
    }

    #[test]
    fn record_that_never_connected_is_terrible_after_retries() {
        let mut info = record("1.2.3.4:8444");
        info.num_attempts = MAX_RETRIES;

        assert!(info.is_terrible(10_100));
    }

    #[test]
    fn selection_chance_decays_with_attempts() {
        let mut info = record("1.2.3.4:8444");
        let now = 11_000;

        let fresh = info.selection_chance(now);
        info.num_attempts = 2;
        let failing = info.selection_chance(now);

        assert!(fresh > failing);
        assert!((failing / fresh - 0.66 * 0.66).abs() < 1e-9);
    }

    #[test]
    fn selection_chance_penalizes_recent_attempts() {
        let mut info = record("1.2.3.4:8444");
        info.last_try = 10_900;

        assert!((info.selection_chance(11_000) - 0.01).abs() < 1e-9);
    }
}
