//! Save and load the full address manager state as a single peers file.
//!
//! The file holds the secret key, the flat list of records (new records
//! first, then tried ones; readers tell them apart by position, not by a
//! flag), and the new table cell assignments. Everything else — the tried
//! matrix, the host index, the sampling order — is rebuilt on load from the
//! key. All integers are big endian.

use std::{collections::HashMap, fs, io::Read, path::Path};

use byteorder::{BigEndian, ReadBytesExt};

use kelp_util::files::write_file_atomic;

use super::{
    buckets, legacy, AddressManager, NodeId, PeerRecord, PeersFileError, BUCKET_SIZE,
    NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT,
};

/// Longest host string accepted while decoding
const MAX_HOST_LEN: u32 = 256;

/// Serialize the manager and write it to `path` through the atomic write
/// protocol, so a crash mid-write cannot destroy the previous snapshot.
pub fn save_to_file(manager: &AddressManager, path: &Path) -> Result<(), PeersFileError> {
    let data = serialize(manager);
    write_file_atomic(path, &data)?;

    log::debug!(
        "Persisted {} peer records to {}",
        manager.size(),
        path.display()
    );

    Ok(())
}

/// Load a manager from the peers file, trying the current format first and
/// falling back to the stores written by older releases. When every format
/// fails (or no file exists) a fresh manager is returned.
pub fn load_or_create(peers_file_path: &Path, legacy_db_path: Option<&Path>) -> AddressManager {
    if peers_file_path.exists() {
        log::info!("Loading peers from {}", peers_file_path.display());
        match fs::read(peers_file_path) {
            Ok(data) => {
                match deserialize(&data) {
                    Ok(manager) => {
                        log::info!("Loaded {} peer records", manager.size());
                        return manager;
                    }
                    Err(e) => log::debug!("Peers file is not in the current format: {e}"),
                }
                match legacy::from_table_bytes(&data) {
                    Ok(manager) => {
                        log::info!(
                            "Migrated {} peer records from a legacy peers file",
                            manager.size()
                        );
                        return manager;
                    }
                    Err(e) => log::debug!("Peers file is not a legacy table file: {e}"),
                }
                match legacy::from_sqlite(peers_file_path) {
                    Ok(manager) => {
                        log::info!(
                            "Migrated {} peer records from a legacy peer database",
                            manager.size()
                        );
                        return manager;
                    }
                    Err(e) => log::debug!("Peers file is not a legacy peer database: {e}"),
                }
                log::warn!(
                    "Could not make sense of {} in any known format, starting afresh",
                    peers_file_path.display()
                );
            }
            Err(e) => log::warn!("Unable to read {}: {e}", peers_file_path.display()),
        }
    }

    if let Some(db_path) = legacy_db_path {
        if db_path.exists() {
            match legacy::from_sqlite(db_path) {
                Ok(manager) => {
                    log::info!(
                        "Migrated {} peer records from the legacy peer database at {}",
                        manager.size(),
                        db_path.display()
                    );
                    return manager;
                }
                Err(e) => log::debug!("Unable to read the legacy peer database: {e}"),
            }
        }
    }

    log::info!("Creating a new address manager");
    AddressManager::new()
}

/// Encode the full manager state.
pub fn serialize(manager: &AddressManager) -> Vec<u8> {
    let mut unique_ids: HashMap<NodeId, u64> = HashMap::new();
    let mut new_records = Vec::new();
    let mut tried_records = Vec::new();
    let mut new_record_count: u64 = 0;

    for (node_id, info) in &manager.map_info {
        if info.ref_count > 0 {
            unique_ids.insert(*node_id, new_record_count);
            new_record_count += 1;
            encode_record(&mut new_records, info);
        }
        if info.is_tried {
            encode_record(&mut tried_records, info);
        }
    }

    let mut new_table = Vec::new();
    let mut entry_count: u32 = 0;
    for bucket in 0..NEW_BUCKET_COUNT {
        for pos in 0..BUCKET_SIZE {
            if let Some(node_id) = manager.new_matrix[bucket][pos] {
                if let Some(unique_id) = unique_ids.get(&node_id) {
                    new_table.extend_from_slice(&unique_id.to_be_bytes());
                    new_table.extend_from_slice(&(bucket as u64).to_be_bytes());
                    entry_count += 1;
                }
            }
        }
    }

    let mut out =
        Vec::with_capacity(44 + new_table.len() + new_records.len() + tried_records.len());
    out.extend_from_slice(&manager.key);
    out.extend_from_slice(&new_record_count.to_be_bytes());
    out.extend_from_slice(&entry_count.to_be_bytes());
    out.extend_from_slice(&new_table);
    out.extend_from_slice(&new_records);
    out.extend_from_slice(&tried_records);

    out
}

/// Rebuild a manager from bytes written by [`serialize`].
pub fn deserialize(data: &[u8]) -> Result<AddressManager, PeersFileError> {
    let mut input: &[u8] = data;

    let mut key = [0u8; 32];
    input.read_exact(&mut key)?;
    let new_count = input.read_u64::<BigEndian>()?;
    let entry_count = input.read_u32::<BigEndian>()?;

    let mut entries = Vec::new();
    for _ in 0..entry_count {
        let unique_id = input.read_u64::<BigEndian>()?;
        let bucket = input.read_u64::<BigEndian>()?;
        if bucket >= NEW_BUCKET_COUNT as u64 {
            return Err(PeersFileError::Decode(format!(
                "new table bucket {bucket} out of range"
            )));
        }
        entries.push((unique_id, bucket as usize));
    }

    let mut manager = AddressManager::with_key(key);
    let mut next_id: NodeId = 0;
    let mut inserted_new: u64 = 0;
    while !input.is_empty() {
        let info = decode_record(&mut input)?;
        if inserted_new < new_count {
            insert_new_record(&mut manager, next_id, info);
            next_id += 1;
            inserted_new += 1;
        } else if insert_tried_record(&mut manager, next_id, info) {
            next_id += 1;
        }
    }
    manager.id_count = next_id;
    manager.new_count = inserted_new as usize;

    // replay the cell assignments; positions within each bucket re-derive
    // from the key
    for (unique_id, bucket) in entries {
        if unique_id >= inserted_new {
            continue;
        }
        let node_id = unique_id as NodeId;
        let Some(info) = manager.map_info.get_mut(&node_id) else {
            continue;
        };
        let pos = buckets::bucket_position(&manager.key, true, bucket, &info.address);
        if manager.new_matrix[bucket][pos].is_none() && info.ref_count < NEW_BUCKETS_PER_ADDRESS {
            info.ref_count += 1;
            manager.new_matrix[bucket][pos] = Some(node_id);
        }
    }

    remove_unreferenced_new_records(&mut manager);
    manager.load_used_positions();

    Ok(manager)
}

/// Register a record as a new table entry; cell assignments follow later.
pub(super) fn insert_new_record(manager: &mut AddressManager, node_id: NodeId, mut info: PeerRecord) {
    info.random_pos = manager.random_order.len();
    manager.map_addr.insert(info.address.ip(), node_id);
    manager.map_info.insert(node_id, info);
    manager.random_order.push(node_id);
}

/// Place a record straight into its tried cell. Returns false if the cell is
/// already taken: with a rehashed key two old records can collide, and the
/// loser is silently dropped.
pub(super) fn insert_tried_record(
    manager: &mut AddressManager,
    node_id: NodeId,
    mut info: PeerRecord,
) -> bool {
    let tried_bucket = buckets::tried_bucket(&manager.key, &info.address);
    let tried_pos = buckets::bucket_position(&manager.key, false, tried_bucket, &info.address);
    if manager.tried_matrix[tried_bucket][tried_pos].is_some() {
        return false;
    }

    info.random_pos = manager.random_order.len();
    info.is_tried = true;
    manager.random_order.push(node_id);
    manager.map_addr.insert(info.address.ip(), node_id);
    manager.map_info.insert(node_id, info);
    manager.tried_matrix[tried_bucket][tried_pos] = Some(node_id);
    manager.tried_count += 1;

    true
}

/// Drop new records that ended up with no cell after the replay.
pub(super) fn remove_unreferenced_new_records(manager: &mut AddressManager) {
    let dead: Vec<NodeId> = manager
        .map_info
        .iter()
        .filter(|(_, info)| !info.is_tried && info.ref_count == 0)
        .map(|(node_id, _)| *node_id)
        .collect();
    for node_id in dead {
        manager.delete_new_entry(node_id);
    }
}

fn encode_record(out: &mut Vec<u8>, info: &PeerRecord) {
    write_string(out, &info.address.ip().to_string());
    out.extend_from_slice(&info.address.port().to_be_bytes());
    out.extend_from_slice(&clamp_time(info.timestamp).to_be_bytes());
    write_string(out, &info.source.ip().to_string());
    out.extend_from_slice(&info.source.port().to_be_bytes());
    out.extend_from_slice(&clamp_time(info.last_success).to_be_bytes());
    out.extend_from_slice(&clamp_time(info.last_try).to_be_bytes());
    out.extend_from_slice(&info.num_attempts.to_be_bytes());
    out.extend_from_slice(&clamp_time(info.last_count_attempt).to_be_bytes());
}

fn decode_record(input: &mut &[u8]) -> Result<PeerRecord, PeersFileError> {
    let host = read_string(input)?;
    let port = input.read_u16::<BigEndian>()?;
    let timestamp = input.read_u64::<BigEndian>()? as i64;
    let source_host = read_string(input)?;
    let source_port = input.read_u16::<BigEndian>()?;

    let address = parse_host(&host, port)?;
    let source = parse_host(&source_host, source_port)?;
    let mut info = PeerRecord::new(address, timestamp, Some(source));

    info.last_success = input.read_u64::<BigEndian>()? as i64;
    info.last_try = input.read_u64::<BigEndian>()? as i64;
    info.num_attempts = input.read_u32::<BigEndian>()?;
    info.last_count_attempt = input.read_u64::<BigEndian>()? as i64;

    Ok(info)
}

fn parse_host(host: &str, port: u16) -> Result<std::net::SocketAddr, PeersFileError> {
    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|_| PeersFileError::Decode(format!("`{host}` is not an IP address")))?;

    Ok(std::net::SocketAddr::new(ip, port))
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

pub(super) fn read_string(input: &mut &[u8]) -> Result<String, PeersFileError> {
    let len = input.read_u32::<BigEndian>()?;
    if len > MAX_HOST_LEN {
        return Err(PeersFileError::Decode(format!(
            "string length {len} exceeds the limit"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes)?;

    String::from_utf8(bytes)
        .map_err(|_| PeersFileError::Decode("string is not valid UTF-8".to_string()))
}

fn clamp_time(timestamp: i64) -> u64 {
    timestamp.max(0) as u64
}
