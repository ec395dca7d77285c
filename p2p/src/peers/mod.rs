//! Library for managing the pool of candidate peer addresses: every address
//! this node has heard of, ranked and bucketed so that peer selection is
//! biased towards addresses that recently worked, while no network group and
//! no gossiping peer can crowd the tables.
//!
//! Addresses live in one of two tables. The *new* table holds addresses we
//! have only heard about; a single address may occupy up to
//! [`NEW_BUCKETS_PER_ADDRESS`] cells there, one per source group. The *tried*
//! table holds addresses we connected to at least once; an address occupies
//! exactly one cell there. Bucket coordinates are derived from a secret key
//! (see [`buckets`]), so remote peers cannot aim addresses at a chosen cell.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
};

use rand::{seq::SliceRandom, thread_rng, Rng};

pub mod buckets;
pub mod error;
pub mod record;
pub mod store;

mod legacy;

pub use self::error::PeersFileError;
pub use self::record::PeerRecord;

use self::buckets::is_valid_address;

/// Number of tried table buckets a single network group may use
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;
/// Number of new table buckets a single source group may use
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;
/// Number of buckets in the tried table
pub const TRIED_BUCKET_COUNT: usize = 256;
/// Number of buckets in the new table
pub const NEW_BUCKET_COUNT: usize = 1024;
/// Number of cells per bucket, in both tables
pub const BUCKET_SIZE: usize = 64;
/// Maximum number of pending tried table collisions kept for later resolution
pub const TRIED_COLLISION_SIZE: usize = 10;
/// Maximum number of new table cells a single address may occupy
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 8;
/// Days after which an unseen address counts as stale
pub const HORIZON_DAYS: i64 = 30;
/// Failed attempts after which a never-connected address counts as hopeless
pub const MAX_RETRIES: u32 = 3;
/// Days without a success before repeated failures count against an address
pub const MIN_FAIL_DAYS: i64 = 7;
/// Failed attempts after which a previously working address counts as gone
pub const MAX_FAILURES: u32 = 10;

/// Random walk step widths for dense-table selection, in bits
const LOG_TRIED_BUCKET_COUNT: u32 = 8;
const LOG_NEW_BUCKET_COUNT: u32 = 10;
const LOG_BUCKET_SIZE: u32 = 6;

/// Identifier of a record inside the manager. Dense, assigned monotonically.
type NodeId = u64;

/// A peer address together with the time it was last reported alive, as
/// exchanged with other nodes and with the discovery loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimestampedAddress {
    /// The advertised endpoint
    pub address: SocketAddr,
    /// When the peer was last reported alive, seconds since Unix epoch
    pub timestamp: i64,
}

impl TimestampedAddress {
    /// Create a timestamped address
    pub fn new(address: SocketAddr, timestamp: i64) -> Self {
        TimestampedAddress { address, timestamp }
    }
}

/// The address manager: both bucket tables, the records they reference, and
/// the bookkeeping that keeps selection O(1).
///
/// The manager is a plain single-threaded structure; concurrent access is
/// provided by the node layer, which owns it behind a lock. Every operation
/// that depends on the current time takes it as an argument, so behavior is
/// reproducible under test.
pub struct AddressManager {
    /// Secret key all bucket coordinates are derived from
    key: [u8; 32],
    /// Last id handed out
    id_count: NodeId,
    /// Ids of all live records, in the order used for random sampling
    random_order: Vec<NodeId>,
    /// The tried table; `None` marks an empty cell
    tried_matrix: Vec<Vec<Option<NodeId>>>,
    /// The new table; `None` marks an empty cell
    new_matrix: Vec<Vec<Option<NodeId>>>,
    tried_count: usize,
    new_count: usize,
    /// Host part of every known address to the id of its record
    map_addr: HashMap<IpAddr, NodeId>,
    /// Record id to the record itself
    map_info: HashMap<NodeId, PeerRecord>,
    /// Time of the last successful connection to any peer
    last_good: i64,
    /// Records whose promotion into tried would evict an incumbent, waiting
    /// for the incumbent to prove liveness
    tried_collisions: Vec<NodeId>,
    /// Occupied cells of the new table
    used_new_positions: HashSet<(usize, usize)>,
    /// Occupied cells of the tried table
    used_tried_positions: HashSet<(usize, usize)>,
    allow_private_subnets: bool,
}

impl AddressManager {
    /// Create an empty manager with a freshly drawn secret key.
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        thread_rng().fill(&mut key[..]);

        Self::with_key(key)
    }

    /// Create an empty manager with the given secret key. Used when loading
    /// persisted state, where bucket placements must match the run that
    /// wrote them.
    pub fn with_key(key: [u8; 32]) -> Self {
        AddressManager {
            key,
            id_count: 0,
            random_order: Vec::new(),
            tried_matrix: vec![vec![None; BUCKET_SIZE]; TRIED_BUCKET_COUNT],
            new_matrix: vec![vec![None; BUCKET_SIZE]; NEW_BUCKET_COUNT],
            tried_count: 0,
            new_count: 0,
            map_addr: HashMap::new(),
            map_info: HashMap::new(),
            last_good: 1,
            tried_collisions: Vec::new(),
            used_new_positions: HashSet::new(),
            used_tried_positions: HashSet::new(),
            allow_private_subnets: false,
        }
    }

    /// The secret key bucket coordinates are derived from
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Accept peers in private, loopback and link-local ranges (test
    /// networks)
    pub fn set_allow_private_subnets(&mut self, allow: bool) {
        self.allow_private_subnets = allow;
    }

    /// Number of known addresses, over both tables
    pub fn size(&self) -> usize {
        self.random_order.len()
    }

    /// Number of addresses in the new table
    pub fn new_count(&self) -> usize {
        self.new_count
    }

    /// Number of addresses in the tried table
    pub fn tried_count(&self) -> usize {
        self.tried_count
    }

    /// Number of promotions waiting on the tried collision queue
    pub fn tried_collision_count(&self) -> usize {
        self.tried_collisions.len()
    }

    /// The record a host currently maps to, if any
    pub fn find(&self, address: &SocketAddr) -> Option<&PeerRecord> {
        let node_id = self.map_addr.get(&address.ip())?;

        self.map_info.get(node_id)
    }

    /// Iterate over every known record, in no particular order
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.map_info.values()
    }

    /// Add a batch of gossiped addresses into the new table. Returns true if
    /// at least one address was not known before.
    ///
    /// `source` is the peer the batch was heard from; `penalty` devalues the
    /// gossiped timestamps by that many seconds.
    pub fn add_to_new_table(
        &mut self,
        addresses: &[TimestampedAddress],
        source: Option<SocketAddr>,
        penalty: i64,
        now: i64,
    ) -> bool {
        let mut added = false;
        for addr in addresses {
            added |= self.add_single(addr, source, penalty, now);
        }

        log::trace!(
            "Processed {} gossiped addresses, {} new / {} tried known afterwards",
            addresses.len(),
            self.new_count,
            self.tried_count
        );

        added
    }

    /// Mark an address as reachable: we just finished a successful handshake
    /// with it. Promotes the record into the tried table, unless
    /// `test_before_evict` defers the promotion because it would evict an
    /// incumbent (see [`Self::resolve_tried_collisions`]).
    pub fn mark_good(&mut self, address: &SocketAddr, test_before_evict: bool, now: i64) {
        self.last_good = now;

        if !is_valid_address(address, self.allow_private_subnets) {
            return;
        }
        let Some(node_id) = self.find_id(address) else {
            return;
        };

        {
            let Some(info) = self.map_info.get_mut(&node_id) else {
                return;
            };
            // check whether we are talking about the exact same peer
            if info.address != *address {
                return;
            }

            info.last_success = now;
            info.last_try = now;
            info.num_attempts = 0;
            // `timestamp` is deliberately not updated, to avoid leaking
            // which peers we are currently connected to

            if info.is_tried {
                return;
            }
        }

        // find a new table cell it currently sits in
        let start = thread_rng().gen_range(0, NEW_BUCKET_COUNT);
        let mut in_new_table = false;
        for n in 0..NEW_BUCKET_COUNT {
            let bucket = (start + n) % NEW_BUCKET_COUNT;
            let pos = buckets::bucket_position(&self.key, true, bucket, address);
            if self.new_matrix[bucket][pos] == Some(node_id) {
                in_new_table = true;
                break;
            }
        }
        if !in_new_table {
            log::warn!("Address {address} is known but not present in any of its new buckets");
            return;
        }

        let tried_bucket = buckets::tried_bucket(&self.key, address);
        let tried_pos = buckets::bucket_position(&self.key, false, tried_bucket, address);

        // would moving this address into tried evict another entry?
        if test_before_evict && self.tried_matrix[tried_bucket][tried_pos].is_some() {
            if self.tried_collisions.len() < TRIED_COLLISION_SIZE
                && !self.tried_collisions.contains(&node_id)
            {
                self.tried_collisions.push(node_id);
            }
        } else {
            self.make_tried(node_id);
        }
    }

    /// Record a connection attempt to an address. When `count_failures` is
    /// set the attempt counts against the address, at most once per global
    /// success, so a full outage on our side does not mark every peer bad.
    pub fn attempt(&mut self, address: &SocketAddr, count_failures: bool, now: i64) {
        let Some(node_id) = self.find_id(address) else {
            return;
        };
        let Some(info) = self.map_info.get_mut(&node_id) else {
            return;
        };
        if info.address != *address {
            return;
        }

        info.last_try = now;
        if count_failures && info.last_count_attempt < self.last_good {
            info.last_count_attempt = now;
            info.num_attempts += 1;
        }
    }

    /// Note that we are talking to an address, refreshing its gossip
    /// timestamp at most every 20 minutes. Counters are untouched.
    pub fn connect(&mut self, address: &SocketAddr, now: i64) {
        let Some(node_id) = self.find_id(address) else {
            return;
        };
        let Some(info) = self.map_info.get_mut(&node_id) else {
            return;
        };
        if info.address != *address {
            return;
        }

        let update_interval = 20 * 60;
        if now - info.timestamp > update_interval {
            info.timestamp = now;
        }
    }

    /// Choose an address to connect to, biased towards recently working
    /// ones. With `new_only` the tried table is skipped.
    pub fn select_peer(&self, new_only: bool, now: i64) -> Option<PeerRecord> {
        if self.random_order.is_empty() {
            return None;
        }
        if new_only && self.new_count == 0 {
            return None;
        }

        let mut rng = thread_rng();
        // use a 50% chance for choosing between tried and new table entries
        if !new_only && self.tried_count > 0 && (self.new_count == 0 || rng.gen_range(0, 2) == 0) {
            self.select_from(
                &self.tried_matrix,
                &self.used_tried_positions,
                TRIED_BUCKET_COUNT,
                LOG_TRIED_BUCKET_COUNT,
                now,
                &mut rng,
            )
        } else {
            self.select_from(
                &self.new_matrix,
                &self.used_new_positions,
                NEW_BUCKET_COUNT,
                LOG_NEW_BUCKET_COUNT,
                now,
                &mut rng,
            )
        }
    }

    /// Rejection-sample one table: pick a random occupied cell, accept its
    /// record with a probability proportional to its selection chance, and
    /// retry with a growing acceptance factor so the loop terminates.
    fn select_from(
        &self,
        matrix: &[Vec<Option<NodeId>>],
        used_positions: &HashSet<(usize, usize)>,
        bucket_count: usize,
        log_bucket_count: u32,
        now: i64,
        rng: &mut impl Rng,
    ) -> Option<PeerRecord> {
        let sparse = (used_positions.len() as f64) < ((bucket_count * BUCKET_SIZE) as f64).sqrt();
        // for a sparse table, sampling the occupied positions directly beats
        // randomly probing a mostly empty matrix
        let cached_positions: Vec<(usize, usize)> = if sparse {
            used_positions.iter().copied().collect()
        } else {
            Vec::new()
        };

        let mut chance_factor = 1.0_f64;
        loop {
            let (bucket, pos) = if sparse {
                if cached_positions.is_empty() {
                    log::error!("Empty table, but its counter claims otherwise");
                    return None;
                }
                cached_positions[rng.gen_range(0, cached_positions.len())]
            } else {
                let mut bucket = rng.gen_range(0, bucket_count);
                let mut pos = rng.gen_range(0, BUCKET_SIZE);
                while matrix[bucket][pos].is_none() {
                    bucket = (bucket + random_bits(rng, log_bucket_count)) % bucket_count;
                    pos = (pos + random_bits(rng, LOG_BUCKET_SIZE)) % BUCKET_SIZE;
                }
                (bucket, pos)
            };

            let Some(node_id) = matrix[bucket][pos] else {
                continue;
            };
            let Some(info) = self.map_info.get(&node_id) else {
                log::error!("Table cell references a record that no longer exists");
                return None;
            };

            let threshold = chance_factor * info.selection_chance(now) * f64::from(1u32 << 30);
            if f64::from(rng.gen_range(0, 1u32 << 30)) < threshold {
                return Some(info.clone());
            }
            chance_factor *= 1.2;
        }
    }

    /// Work through the pending tried collisions: keep incumbents that
    /// recently proved alive, and promote challengers over incumbents that
    /// had their chance.
    pub fn resolve_tried_collisions(&mut self, now: i64) {
        let pending: Vec<NodeId> = self.tried_collisions.clone();
        for node_id in pending {
            let mut resolved = false;
            let mut promote: Option<SocketAddr> = None;

            match self.map_info.get(&node_id) {
                None => {
                    resolved = true;
                }
                Some(info) => {
                    let peer = info.address;
                    let tried_bucket = buckets::tried_bucket(&self.key, &peer);
                    let tried_pos = buckets::bucket_position(&self.key, false, tried_bucket, &peer);
                    let incumbent = self.tried_matrix[tried_bucket][tried_pos]
                        .and_then(|old_id| self.map_info.get(&old_id));

                    match incumbent {
                        Some(old_info) => {
                            if now - old_info.last_success < 4 * 60 * 60 {
                                // the incumbent proved itself recently
                                resolved = true;
                            } else if now - old_info.last_try < 4 * 60 * 60 {
                                if now - old_info.last_try > 60 {
                                    // the incumbent was given a chance and
                                    // did not come back
                                    promote = Some(peer);
                                    resolved = true;
                                }
                            } else if now - info.last_success > 40 * 60 {
                                promote = Some(peer);
                                resolved = true;
                            }
                        }
                        None => {
                            // the contested cell freed up in the meantime
                            promote = Some(peer);
                            resolved = true;
                        }
                    }
                }
            }

            if let Some(peer) = promote {
                self.mark_good(&peer, false, now);
            }
            if resolved {
                self.tried_collisions.retain(|id| *id != node_id);
            }
        }
    }

    /// The incumbent a randomly chosen pending collision wants to evict, so
    /// the discovery loop can test whether it is still alive.
    pub fn select_tried_collision(&mut self) -> Option<PeerRecord> {
        let node_id = *self.tried_collisions.as_slice().choose(&mut thread_rng())?;

        let Some(info) = self.map_info.get(&node_id) else {
            self.tried_collisions.retain(|id| *id != node_id);
            return None;
        };

        let tried_bucket = buckets::tried_bucket(&self.key, &info.address);
        let tried_pos = buckets::bucket_position(&self.key, false, tried_bucket, &info.address);

        self.tried_matrix[tried_bucket][tried_pos]
            .and_then(|old_id| self.map_info.get(&old_id))
            .cloned()
    }

    /// A random sample of known good addresses, to be relayed to other
    /// nodes. At most 23% of the pool and never more than 1000 addresses.
    pub fn get_peers(&mut self, now: i64) -> Vec<TimestampedAddress> {
        let total = self.random_order.len();
        // ceil(23% of the pool), capped
        let num_nodes = ((23 * total + 99) / 100).min(1000);

        let mut rng = thread_rng();
        let mut addresses = Vec::with_capacity(num_nodes);
        for n in 0..total {
            if addresses.len() >= num_nodes {
                break;
            }

            // partial Fisher-Yates over the random order
            let pick = rng.gen_range(0, total - n) + n;
            self.swap_random(n, pick);

            let Some(info) = self.map_info.get(&self.random_order[n]) else {
                continue;
            };
            if !is_valid_address(&info.address, self.allow_private_subnets) {
                continue;
            }
            if !info.is_terrible(now) {
                addresses.push(TimestampedAddress::new(info.address, info.timestamp));
            }
        }

        addresses
    }

    /// Drop every new table reference to addresses that went stale and kept
    /// failing. Tried entries are never touched here.
    pub fn cleanup(
        &mut self,
        max_timestamp_difference: i64,
        max_consecutive_failures: u32,
        now: i64,
    ) {
        let mut stale_cells = Vec::new();
        for bucket in 0..NEW_BUCKET_COUNT {
            for pos in 0..BUCKET_SIZE {
                if let Some(info) = self.new_matrix[bucket][pos].and_then(|id| self.map_info.get(&id))
                {
                    if info.timestamp < now - max_timestamp_difference
                        && info.num_attempts >= max_consecutive_failures
                    {
                        stale_cells.push((bucket, pos));
                    }
                }
            }
        }

        if !stale_cells.is_empty() {
            log::debug!("Dropping {} stale new table cells", stale_cells.len());
        }
        for (bucket, pos) in stale_cells {
            self.clear_new(bucket, pos);
        }
    }

    /// Verify the internal bookkeeping against the tables, panicking on any
    /// mismatch. Meant for tests; all operations keep these properties.
    pub fn check_consistency(&self) {
        let mut new_records = 0;
        let mut tried_records = 0;
        let mut total_refs: u64 = 0;

        for (node_id, info) in &self.map_info {
            if info.is_tried {
                tried_records += 1;
                assert_eq!(info.ref_count, 0, "tried record holds new table references");
            } else {
                new_records += 1;
                assert!(info.ref_count >= 1, "new record referenced by no cell");
                assert!(
                    info.ref_count <= NEW_BUCKETS_PER_ADDRESS,
                    "record exceeds the per-address cell limit"
                );
            }
            total_refs += u64::from(info.ref_count);
            assert_eq!(
                self.random_order.get(info.random_pos),
                Some(node_id),
                "random order out of sync with record positions"
            );
        }

        assert_eq!(self.new_count, new_records);
        assert_eq!(self.tried_count, tried_records);
        assert_eq!(self.random_order.len(), self.map_info.len());

        let mut new_cells: u64 = 0;
        for bucket in 0..NEW_BUCKET_COUNT {
            for pos in 0..BUCKET_SIZE {
                match self.new_matrix[bucket][pos] {
                    Some(node_id) => {
                        new_cells += 1;
                        assert!(
                            self.used_new_positions.contains(&(bucket, pos)),
                            "occupied new cell missing from the position index"
                        );
                        let info = self.map_info.get(&node_id);
                        assert!(
                            info.map(|i| !i.is_tried).unwrap_or(false),
                            "new cell references a missing or tried record"
                        );
                    }
                    None => {
                        assert!(!self.used_new_positions.contains(&(bucket, pos)));
                    }
                }
            }
        }
        assert_eq!(new_cells, total_refs, "reference counts disagree with the new table");
        assert_eq!(self.used_new_positions.len() as u64, new_cells);

        let mut tried_cells = 0;
        for bucket in 0..TRIED_BUCKET_COUNT {
            for pos in 0..BUCKET_SIZE {
                match self.tried_matrix[bucket][pos] {
                    Some(node_id) => {
                        tried_cells += 1;
                        assert!(
                            self.used_tried_positions.contains(&(bucket, pos)),
                            "occupied tried cell missing from the position index"
                        );
                        let info = self.map_info.get(&node_id);
                        assert!(
                            info.map(|i| i.is_tried).unwrap_or(false),
                            "tried cell references a missing or new record"
                        );
                    }
                    None => {
                        assert!(!self.used_tried_positions.contains(&(bucket, pos)));
                    }
                }
            }
        }
        assert_eq!(tried_cells, self.tried_count, "tried count disagrees with the table");
        assert_eq!(self.used_tried_positions.len(), tried_cells);
    }

    /// Add one gossiped address. Returns true iff a record was created.
    fn add_single(
        &mut self,
        addr: &TimestampedAddress,
        source: Option<SocketAddr>,
        penalty: i64,
        now: i64,
    ) -> bool {
        if !is_valid_address(&addr.address, self.allow_private_subnets) {
            return false;
        }

        let mut penalty = penalty;
        let existing_id = self.find_id(&addr.address);
        if let Some(node_id) = existing_id {
            if self.map_info.get(&node_id).map(|info| info.address) == Some(addr.address) {
                // the peer is reporting itself, no reason to devalue it
                penalty = 0;
            }
        }

        let is_unique;
        let node_id = match existing_id {
            Some(node_id) => {
                let Some(info) = self.map_info.get_mut(&node_id) else {
                    return false;
                };

                // periodically update the gossip timestamp, never backwards
                let currently_online = now - addr.timestamp < 24 * 60 * 60;
                let update_interval = if currently_online { 60 * 60 } else { 24 * 60 * 60 };
                if addr.timestamp > 0
                    && (info.timestamp == 0
                        || info.timestamp < addr.timestamp - update_interval - penalty)
                {
                    info.timestamp = (addr.timestamp - penalty).max(0);
                }

                // do not update if no new information is present
                if addr.timestamp == 0
                    || (info.timestamp > 0 && addr.timestamp <= info.timestamp)
                {
                    return false;
                }

                // do not update if the entry was already in the tried table
                if info.is_tried {
                    return false;
                }

                // do not update if the maximum reference count is reached
                if info.ref_count == NEW_BUCKETS_PER_ADDRESS {
                    return false;
                }

                // stochastic test: previous ref_count == N makes it 2^N
                // times harder to take yet another cell
                let factor = 1u32 << info.ref_count;
                if factor > 1 && thread_rng().gen_range(0, factor) != 0 {
                    return false;
                }

                is_unique = false;
                node_id
            }
            None => {
                let mut info = PeerRecord::new(addr.address, addr.timestamp, source);
                info.timestamp = (info.timestamp - penalty).max(0);
                let node_id = self.create_record(info);
                self.new_count += 1;
                is_unique = true;
                node_id
            }
        };

        let (bucket, pos, own_refs) = {
            let Some(info) = self.map_info.get(&node_id) else {
                return false;
            };
            let bucket = info.new_bucket(&self.key, source.as_ref());
            (
                bucket,
                info.bucket_position(&self.key, true, bucket),
                info.ref_count,
            )
        };

        if self.new_matrix[bucket][pos] != Some(node_id) {
            let mut insert = self.new_matrix[bucket][pos].is_none();
            if !insert {
                // the cell is contested: only displace occupants that are
                // terrible, or that are plentiful while the newcomer has no
                // cell at all yet
                if let Some(occupant) = self.new_matrix[bucket][pos]
                    .and_then(|occupant_id| self.map_info.get(&occupant_id))
                {
                    if occupant.is_terrible(now) || (occupant.ref_count > 1 && own_refs == 0) {
                        insert = true;
                    }
                }
            }

            if insert {
                self.clear_new(bucket, pos);
                if let Some(info) = self.map_info.get_mut(&node_id) {
                    info.ref_count += 1;
                }
                self.set_new_matrix(bucket, pos, Some(node_id));
            } else if own_refs == 0 {
                // freshly created and nowhere to put it
                self.delete_new_entry(node_id);
            }
        }

        is_unique
    }

    /// Move a record from the new table into its tried cell, evicting any
    /// incumbent back into the new table.
    fn make_tried(&mut self, node_id: NodeId) {
        let Some(address) = self.map_info.get(&node_id).map(|info| info.address) else {
            return;
        };

        // remove the entry from all new table cells referencing it
        for bucket in 0..NEW_BUCKET_COUNT {
            let pos = buckets::bucket_position(&self.key, true, bucket, &address);
            if self.new_matrix[bucket][pos] == Some(node_id) {
                self.set_new_matrix(bucket, pos, None);
                if let Some(info) = self.map_info.get_mut(&node_id) {
                    info.ref_count -= 1;
                }
            }
        }
        self.new_count -= 1;
        debug_assert_eq!(
            self.map_info.get(&node_id).map(|info| info.ref_count),
            Some(0)
        );

        let tried_bucket = buckets::tried_bucket(&self.key, &address);
        let tried_pos = buckets::bucket_position(&self.key, false, tried_bucket, &address);

        if let Some(evicted_id) = self.tried_matrix[tried_bucket][tried_pos] {
            // evict the incumbent back into the new table
            let Some((evicted_addr, evicted_source)) = self
                .map_info
                .get_mut(&evicted_id)
                .map(|old| {
                    old.is_tried = false;
                    (old.address, old.source)
                })
            else {
                return;
            };
            self.set_tried_matrix(tried_bucket, tried_pos, None);
            self.tried_count -= 1;

            let new_bucket = buckets::new_bucket(&self.key, &evicted_addr, &evicted_source);
            let new_pos = buckets::bucket_position(&self.key, true, new_bucket, &evicted_addr);
            self.clear_new(new_bucket, new_pos);
            if let Some(old) = self.map_info.get_mut(&evicted_id) {
                old.ref_count = 1;
            }
            self.set_new_matrix(new_bucket, new_pos, Some(evicted_id));
            self.new_count += 1;

            log::debug!("Evicted {evicted_addr} from the tried table in favour of {address}");
        }

        self.set_tried_matrix(tried_bucket, tried_pos, Some(node_id));
        self.tried_count += 1;
        if let Some(info) = self.map_info.get_mut(&node_id) {
            info.is_tried = true;
        }
    }

    /// Empty a new table cell, deleting the referenced record if this was
    /// its last cell.
    fn clear_new(&mut self, bucket: usize, pos: usize) {
        if let Some(delete_id) = self.new_matrix[bucket][pos] {
            let mut remaining = 0;
            if let Some(info) = self.map_info.get_mut(&delete_id) {
                debug_assert!(info.ref_count > 0);
                info.ref_count = info.ref_count.saturating_sub(1);
                remaining = info.ref_count;
            }
            self.set_new_matrix(bucket, pos, None);
            if remaining == 0 {
                self.delete_new_entry(delete_id);
            }
        }
    }

    /// Remove a record that no new table cell references anymore.
    fn delete_new_entry(&mut self, node_id: NodeId) {
        let Some(random_pos) = self.map_info.get(&node_id).map(|info| info.random_pos) else {
            return;
        };

        let last = self.random_order.len() - 1;
        self.swap_random(random_pos, last);
        self.random_order.pop();

        if let Some(info) = self.map_info.remove(&node_id) {
            self.map_addr.remove(&info.address.ip());
        }
        self.new_count -= 1;
    }

    /// Register a record and hand it an id and a sampling slot.
    fn create_record(&mut self, mut info: PeerRecord) -> NodeId {
        self.id_count += 1;
        let node_id = self.id_count;

        info.random_pos = self.random_order.len();
        self.map_addr.insert(info.address.ip(), node_id);
        self.map_info.insert(node_id, info);
        self.random_order.push(node_id);

        node_id
    }

    /// Swap two slots of the sampling order, keeping records' back-pointers
    /// in sync. Supports O(1) delete-by-swap and partial shuffles.
    fn swap_random(&mut self, pos_1: usize, pos_2: usize) {
        if pos_1 == pos_2 {
            return;
        }
        debug_assert!(pos_1 < self.random_order.len() && pos_2 < self.random_order.len());

        let node_id_1 = self.random_order[pos_1];
        let node_id_2 = self.random_order[pos_2];
        if let Some(info) = self.map_info.get_mut(&node_id_1) {
            info.random_pos = pos_2;
        }
        if let Some(info) = self.map_info.get_mut(&node_id_2) {
            info.random_pos = pos_1;
        }
        self.random_order.swap(pos_1, pos_2);
    }

    fn find_id(&self, address: &SocketAddr) -> Option<NodeId> {
        self.map_addr.get(&address.ip()).copied()
    }

    /// Use only this method for modifying the new matrix, so the occupied
    /// position index stays exact.
    fn set_new_matrix(&mut self, bucket: usize, pos: usize, value: Option<NodeId>) {
        self.new_matrix[bucket][pos] = value;
        match value {
            Some(_) => {
                self.used_new_positions.insert((bucket, pos));
            }
            None => {
                self.used_new_positions.remove(&(bucket, pos));
            }
        }
    }

    /// Use only this method for modifying the tried matrix, so the occupied
    /// position index stays exact.
    fn set_tried_matrix(&mut self, bucket: usize, pos: usize, value: Option<NodeId>) {
        self.tried_matrix[bucket][pos] = value;
        match value {
            Some(_) => {
                self.used_tried_positions.insert((bucket, pos));
            }
            None => {
                self.used_tried_positions.remove(&(bucket, pos));
            }
        }
    }

    /// Rebuild the occupied position indexes from the matrices, after a
    /// load wrote cells directly.
    fn load_used_positions(&mut self) {
        self.used_new_positions.clear();
        self.used_tried_positions.clear();
        for bucket in 0..NEW_BUCKET_COUNT {
            for pos in 0..BUCKET_SIZE {
                if self.new_matrix[bucket][pos].is_some() {
                    self.used_new_positions.insert((bucket, pos));
                }
            }
        }
        for bucket in 0..TRIED_BUCKET_COUNT {
            for pos in 0..BUCKET_SIZE {
                if self.tried_matrix[bucket][pos].is_some() {
                    self.used_tried_positions.insert((bucket, pos));
                }
            }
        }
    }
}

impl Default for AddressManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A uniform random integer of the given bit width.
fn random_bits(rng: &mut impl Rng, bits: u32) -> usize {
    rng.gen_range(0, 1usize << bits)
}
