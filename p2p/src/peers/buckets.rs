//! Deterministic bucket derivation for the new/tried address tables.
//!
//! Every coordinate is derived from the manager's secret key through
//! domain-separated SHA256 hashing, so that an attacker who does not know the
//! key cannot choose addresses that land in a victim cell, while two runs of
//! the same node (same key) always place the same address in the same cell.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use kelp_crypto::hash::{calculate_sha256, Sha256};

use super::{
    BUCKET_SIZE, NEW_BUCKET_COUNT, NEW_BUCKETS_PER_SOURCE_GROUP, TRIED_BUCKET_COUNT,
    TRIED_BUCKETS_PER_GROUP,
};

/// Family tag prepended to IPv4 key and group bytes
const FAMILY_IPV4: u8 = 4;
/// Family tag prepended to IPv6 key and group bytes
const FAMILY_IPV6: u8 = 6;

/// Domain separation tag for new table positions
const NEW_TABLE_TAG: u8 = b'N';
/// Domain separation tag for tried table positions
const TRIED_TABLE_TAG: u8 = b'K';

/// Whether an address is accepted into the tables at all.
///
/// Multicast, reserved and otherwise unroutable addresses are always
/// rejected; private, loopback and link-local ranges are rejected unless
/// `allow_private_subnets` is set (test networks).
pub fn is_valid_address(addr: &SocketAddr, allow_private_subnets: bool) -> bool {
    match canonical_ip(&addr.ip()) {
        IpAddr::V4(ip) => {
            if ip.is_unspecified()
                || ip.is_multicast()
                || ip.is_broadcast()
                || ip.is_documentation()
                // 240.0.0.0/4 is reserved for future use
                || ip.octets()[0] >= 240
            {
                return false;
            }
            allow_private_subnets || !(ip.is_private() || ip.is_loopback() || ip.is_link_local())
        }
        IpAddr::V6(ip) => {
            if ip.is_unspecified() || ip.is_multicast() {
                return false;
            }
            let segments = ip.segments();
            // fc00::/7
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // fe80::/10
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            allow_private_subnets || !(ip.is_loopback() || is_unique_local || is_link_local)
        }
    }
}

/// Canonical bytes identifying a single endpoint: family tag, packed IP
/// octets and the port in big endian.
pub fn address_key(addr: &SocketAddr) -> Vec<u8> {
    let mut key = match canonical_ip(&addr.ip()) {
        IpAddr::V4(ip) => {
            let mut key = Vec::with_capacity(7);
            key.push(FAMILY_IPV4);
            key.extend_from_slice(&ip.octets());
            key
        }
        IpAddr::V6(ip) => {
            let mut key = Vec::with_capacity(19);
            key.push(FAMILY_IPV6);
            key.extend_from_slice(&ip.octets());
            key
        }
    };
    key.extend_from_slice(&addr.port().to_be_bytes());

    key
}

/// The network group of an address: the family tag followed by the /16
/// prefix for IPv4 or the /32 prefix for IPv6. Addresses of well-known IPv6
/// transition mechanisms are grouped by the network they stand for: 6to4 and
/// Teredo addresses unwrap to the embedded IPv4 network, and Hurricane
/// Electric tunnels (2001:470::/32) narrow to /36 since the /32 is shared by
/// unrelated tunnel users.
pub fn address_group(ip: &IpAddr) -> Vec<u8> {
    match canonical_ip(ip) {
        IpAddr::V4(ip) => ipv4_group(ip),
        IpAddr::V6(ip) => {
            if let Some(embedded) = embedded_ipv4(&ip) {
                return ipv4_group(embedded);
            }
            let octets = ip.octets();
            let segments = ip.segments();
            if segments[0] == 0x2001 && segments[1] == 0x0470 {
                vec![
                    FAMILY_IPV6,
                    octets[0],
                    octets[1],
                    octets[2],
                    octets[3],
                    octets[4] & 0xf0,
                ]
            } else {
                vec![FAMILY_IPV6, octets[0], octets[1], octets[2], octets[3]]
            }
        }
    }
}

/// Tried table bucket for an address.
///
/// The first hash confines an address to one of a few buckets per network
/// group, the second one picks the bucket, so a single group can never take
/// over the whole table.
pub fn tried_bucket(key: &[u8; 32], addr: &SocketAddr) -> usize {
    let hash1 = hash_prefix(&[key, &address_key(addr)]) % TRIED_BUCKETS_PER_GROUP as u64;
    let hash2 = hash_prefix(&[key, &address_group(&addr.ip()), &[hash1 as u8]]);

    (hash2 % TRIED_BUCKET_COUNT as u64) as usize
}

/// New table bucket for an address heard from `source`.
///
/// Buckets depend on the source group, so a single gossiping peer can only
/// fill a bounded slice of the new table.
pub fn new_bucket(key: &[u8; 32], addr: &SocketAddr, source: &SocketAddr) -> usize {
    let group = address_group(&addr.ip());
    let source_group = address_group(&source.ip());
    let hash1 = hash_prefix(&[key, &group, &source_group]) % NEW_BUCKETS_PER_SOURCE_GROUP as u64;
    let hash2 = hash_prefix(&[key, &source_group, &[hash1 as u8]]);

    (hash2 % NEW_BUCKET_COUNT as u64) as usize
}

/// Position of an address inside a bucket of the new (`is_new`) or tried
/// table.
pub fn bucket_position(key: &[u8; 32], is_new: bool, bucket: usize, addr: &SocketAddr) -> usize {
    let tag = if is_new { NEW_TABLE_TAG } else { TRIED_TABLE_TAG };
    let bucket_bytes = (bucket as u32).to_be_bytes();
    let hash = hash_prefix(&[key, &[tag], &bucket_bytes[1..], &address_key(addr)]);

    (hash % BUCKET_SIZE as u64) as usize
}

/// First 8 bytes of the SHA256 of the concatenated parts, as a big-endian
/// integer.
fn hash_prefix(parts: &[&[u8]]) -> u64 {
    let data = parts.concat();
    let Sha256(hash) = calculate_sha256(&data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);

    u64::from_be_bytes(prefix)
}

/// Unwrap IPv4-mapped IPv6 addresses so both notations of the same endpoint
/// derive the same coordinates.
fn canonical_ip(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => *ip,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => *ip,
        },
    }
}

fn ipv4_group(ip: Ipv4Addr) -> Vec<u8> {
    let octets = ip.octets();

    vec![FAMILY_IPV4, octets[0], octets[1]]
}

/// The IPv4 address wrapped inside a 6to4 (2002::/16) or Teredo (2001::/32)
/// address, if any. Teredo stores the client address bit-inverted in the last
/// four octets.
fn embedded_ipv4(ip: &std::net::Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = ip.segments();
    let octets = ip.octets();
    if segments[0] == 0x2002 {
        Some(Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5]))
    } else if segments[0] == 0x2001 && segments[1] == 0 {
        Some(Ipv4Addr::new(
            !octets[12],
            !octets[13],
            !octets[14],
            !octets[15],
        ))
    } else {
        None
    }
}
