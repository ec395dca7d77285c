//! Read the peer stores written by older releases.
//!
//! Two layouts exist: a flat file holding three length-prefixed tables
//! (metadata key/value pairs, node records, new table cell assignments), and
//! a SQLite database with the equivalent `peer_metadata`, `peer_nodes` and
//! `peer_new_table` tables. Both store records as space-separated
//! `host port timestamp source_host source_port` strings and the secret key
//! as a decimal 256-bit integer. Only reading is supported; saving always
//! produces the current format.

use std::{collections::HashMap, net::SocketAddr, path::Path};

use byteorder::{BigEndian, ReadBytesExt};
use num::BigUint;
use rusqlite::{Connection, OpenFlags};

use super::{
    buckets, store, AddressManager, NodeId, PeerRecord, PeersFileError, NEW_BUCKETS_PER_ADDRESS,
    NEW_BUCKET_COUNT,
};

/// Decode a legacy three-table peers file.
pub(super) fn from_table_bytes(data: &[u8]) -> Result<AddressManager, PeersFileError> {
    let mut input: &[u8] = data;

    let metadata = read_metadata(&mut input)?;
    let nodes = read_nodes(&mut input)?;
    let new_table = read_new_table(&mut input)?;
    if !input.is_empty() {
        return Err(PeersFileError::LegacyDecode(
            "trailing bytes after the new table".to_string(),
        ));
    }

    build(&metadata, nodes, new_table)
}

/// Decode a legacy SQLite peer database.
pub(super) fn from_sqlite(path: &Path) -> Result<AddressManager, PeersFileError> {
    let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let mut metadata: HashMap<String, String> = HashMap::new();
    {
        let mut statement = connection.prepare("SELECT key, value FROM peer_metadata")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            metadata.insert(key, value);
        }
    }

    if is_empty_store(&metadata) {
        return Err(PeersFileError::LegacyDecode(
            "legacy peer database holds no peers".to_string(),
        ));
    }

    let mut nodes: Vec<(u64, String)> = Vec::new();
    {
        let mut statement = connection.prepare("SELECT node_id, value FROM peer_nodes")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (node_id, value) = row?;
            nodes.push((node_id as u64, value));
        }
    }

    let mut new_table: Vec<(u64, u64)> = Vec::new();
    {
        let mut statement = connection.prepare("SELECT node_id, bucket FROM peer_new_table")?;
        let rows =
            statement.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (node_id, bucket) = row?;
            new_table.push((node_id as u64, bucket as u64));
        }
    }

    build(&metadata, nodes, new_table)
}

/// Rebuild a manager out of the three decoded tables, following the same
/// steps for both legacy layouts.
fn build(
    metadata: &HashMap<String, String>,
    nodes: Vec<(u64, String)>,
    new_table: Vec<(u64, u64)>,
) -> Result<AddressManager, PeersFileError> {
    let key = parse_legacy_key(
        metadata
            .get("key")
            .ok_or_else(|| PeersFileError::LegacyDecode("metadata holds no key".to_string()))?,
    )?;
    let new_count: u64 = parse_metadata_count(metadata, "new_count")?;
    // the stored tried_count is not trusted; the value is rebuilt from the
    // insertions that actually succeed below

    let mut manager = AddressManager::with_key(key);

    let mut tried_nodes: Vec<PeerRecord> = Vec::new();
    let mut next_id: NodeId = new_count;
    let mut inserted_new: usize = 0;
    for (node_id, value) in &nodes {
        let Some(info) = parse_record_line(value) else {
            log::debug!("Skipping an unparseable legacy peer record");
            continue;
        };
        if *node_id < new_count {
            store::insert_new_record(&mut manager, *node_id, info);
            inserted_new += 1;
            next_id = next_id.max(*node_id + 1);
        } else {
            tried_nodes.push(info);
        }
    }
    manager.new_count = inserted_new;

    for info in tried_nodes {
        if store::insert_tried_record(&mut manager, next_id, info) {
            next_id += 1;
        }
    }
    manager.id_count = next_id;

    for (node_id, bucket) in new_table {
        if node_id >= new_count || bucket >= NEW_BUCKET_COUNT as u64 {
            continue;
        }
        let bucket = bucket as usize;
        let Some(info) = manager.map_info.get_mut(&node_id) else {
            continue;
        };
        let pos = buckets::bucket_position(&manager.key, true, bucket, &info.address);
        if manager.new_matrix[bucket][pos].is_none() && info.ref_count < NEW_BUCKETS_PER_ADDRESS {
            info.ref_count += 1;
            manager.new_matrix[bucket][pos] = Some(node_id);
        }
    }

    store::remove_unreferenced_new_records(&mut manager);
    manager.load_used_positions();

    Ok(manager)
}

fn read_metadata(input: &mut &[u8]) -> Result<HashMap<String, String>, PeersFileError> {
    let count = input.read_u32::<BigEndian>()?;
    let mut metadata = HashMap::new();
    for _ in 0..count {
        let key = store::read_string(input)?;
        let value = store::read_string(input)?;
        metadata.insert(key, value);
    }

    Ok(metadata)
}

fn read_nodes(input: &mut &[u8]) -> Result<Vec<(u64, String)>, PeersFileError> {
    let count = input.read_u32::<BigEndian>()?;
    let mut nodes = Vec::new();
    for _ in 0..count {
        let node_id = input.read_u64::<BigEndian>()?;
        let value = store::read_string(input)?;
        nodes.push((node_id, value));
    }

    Ok(nodes)
}

fn read_new_table(input: &mut &[u8]) -> Result<Vec<(u64, u64)>, PeersFileError> {
    let count = input.read_u32::<BigEndian>()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let node_id = input.read_u64::<BigEndian>()?;
        let bucket = input.read_u64::<BigEndian>()?;
        entries.push((node_id, bucket));
    }

    Ok(entries)
}

/// A legacy store without a key, or with nothing in either table, counts as
/// holding no peers.
fn is_empty_store(metadata: &HashMap<String, String>) -> bool {
    if !metadata.contains_key("key") {
        return true;
    }
    let count = |name: &str| {
        metadata
            .get(name)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    };

    count("new_count") == 0 && count("tried_count") == 0
}

/// The legacy formats store the key as a decimal 256-bit integer.
fn parse_legacy_key(value: &str) -> Result<[u8; 32], PeersFileError> {
    let number = BigUint::parse_bytes(value.as_bytes(), 10).ok_or_else(|| {
        PeersFileError::LegacyDecode("key is not a decimal integer".to_string())
    })?;
    let bytes = number.to_bytes_be();
    if bytes.len() > 32 {
        return Err(PeersFileError::LegacyDecode(
            "key does not fit in 256 bits".to_string(),
        ));
    }

    let mut key = [0u8; 32];
    key[32 - bytes.len()..].copy_from_slice(&bytes);

    Ok(key)
}

fn parse_metadata_count(
    metadata: &HashMap<String, String>,
    name: &str,
) -> Result<u64, PeersFileError> {
    match metadata.get(name) {
        Some(value) => value.parse::<u64>().map_err(|_| {
            PeersFileError::LegacyDecode(format!("metadata `{name}` is not a number"))
        }),
        None => Ok(0),
    }
}

/// Records are stored as `host port timestamp source_host source_port`.
/// Records that do not parse are dropped rather than failing the whole file.
fn parse_record_line(value: &str) -> Option<PeerRecord> {
    let mut parts = value.split(' ');
    let host = parts.next()?;
    let port = parts.next()?.parse::<u16>().ok()?;
    let timestamp = parts.next()?.parse::<u64>().ok()? as i64;
    let source_host = parts.next()?;
    let source_port = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let address = SocketAddr::new(host.parse().ok()?, port);
    let source = SocketAddr::new(source_host.parse().ok()?, source_port);

    Some(PeerRecord::new(address, timestamp, Some(source)))
}
