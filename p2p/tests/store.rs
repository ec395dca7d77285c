use std::net::SocketAddr;

use num::BigUint;

use kelp_p2p::peers::{store, AddressManager, TimestampedAddress};

const KEY: [u8; 32] = [7u8; 32];

fn ip(string: &str) -> SocketAddr {
    string.parse().unwrap()
}

/// Build a manager holding several hundred records, a third of them tried.
fn populated_manager() -> AddressManager {
    let mut manager = AddressManager::with_key(KEY);
    let now = 1_700_000_000;
    let source = ip("9.9.9.9:8444");

    let mut addresses = Vec::new();
    for i in 0..700u32 {
        let address = ip(&format!("6.{}.{}.23:8444", i % 200, i / 200));
        addresses.push(address);
        manager.add_to_new_table(
            &[TimestampedAddress::new(address, now - 1000 - i64::from(i))],
            Some(source),
            0,
            now,
        );
    }
    for address in addresses.iter().step_by(3) {
        manager.mark_good(address, false, now + 10);
    }
    manager.check_consistency();

    manager
}

fn snapshot(manager: &AddressManager) -> Vec<(SocketAddr, bool, u32, i64, i64, i64, u32)> {
    let mut records: Vec<_> = manager
        .records()
        .map(|info| {
            (
                info.address,
                info.is_tried(),
                info.ref_count(),
                info.timestamp,
                info.last_success,
                info.last_try,
                info.num_attempts,
            )
        })
        .collect();
    records.sort();

    records
}

#[test]
fn serialized_state_round_trips() {
    let manager = populated_manager();
    assert!(manager.new_count() > 0);
    assert!(manager.tried_count() > 0);

    let data = store::serialize(&manager);
    let reloaded = store::deserialize(&data).unwrap();
    reloaded.check_consistency();

    assert_eq!(reloaded.key(), manager.key());
    assert_eq!(reloaded.new_count(), manager.new_count());
    assert_eq!(reloaded.tried_count(), manager.tried_count());
    assert_eq!(reloaded.size(), manager.size());
    assert_eq!(snapshot(&reloaded), snapshot(&manager));
}

#[test]
fn save_and_reload_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.dat");
    let manager = populated_manager();

    store::save_to_file(&manager, &path).unwrap();
    assert!(path.exists());

    let reloaded = store::load_or_create(&path, None);
    reloaded.check_consistency();
    assert_eq!(reloaded.key(), manager.key());
    assert_eq!(snapshot(&reloaded), snapshot(&manager));
}

#[test]
fn missing_file_creates_an_empty_manager() {
    let dir = tempfile::tempdir().unwrap();

    let manager = store::load_or_create(&dir.path().join("peers.dat"), None);

    assert_eq!(manager.size(), 0);
    manager.check_consistency();
}

#[test]
fn garbage_file_creates_an_empty_manager() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.dat");
    std::fs::write(&path, b"definitely not a peers file").unwrap();

    let manager = store::load_or_create(&path, None);

    assert_eq!(manager.size(), 0);
}

#[test]
fn out_of_range_bucket_is_rejected() {
    let mut data = Vec::new();
    data.extend_from_slice(&KEY);
    data.extend_from_slice(&1u64.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(&0u64.to_be_bytes());
    // bucket way past the table
    data.extend_from_slice(&5000u64.to_be_bytes());

    assert!(store::deserialize(&data).is_err());
}

mod legacy_tables {
    use super::*;

    fn push_string(out: &mut Vec<u8>, value: &str) {
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }

    /// Encode the three legacy tables: metadata pairs, node rows, new table
    /// rows.
    fn legacy_file(
        metadata: &[(&str, &str)],
        nodes: &[(u64, &str)],
        new_table: &[(u64, u64)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
        for (key, value) in metadata {
            push_string(&mut out, key);
            push_string(&mut out, value);
        }
        out.extend_from_slice(&(nodes.len() as u32).to_be_bytes());
        for (node_id, value) in nodes {
            out.extend_from_slice(&node_id.to_be_bytes());
            push_string(&mut out, value);
        }
        out.extend_from_slice(&(new_table.len() as u32).to_be_bytes());
        for (node_id, bucket) in new_table {
            out.extend_from_slice(&node_id.to_be_bytes());
            out.extend_from_slice(&bucket.to_be_bytes());
        }

        out
    }

    fn decimal_key() -> String {
        BigUint::from_bytes_be(&KEY).to_str_radix(10)
    }

    #[test]
    fn legacy_table_file_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let key = decimal_key();
        let data = legacy_file(
            // the stored tried_count is wrong on purpose: it is rebuilt
            &[("key", &key), ("new_count", "3"), ("tried_count", "7")],
            &[
                (0, "6.1.2.3 8444 1600000000 9.9.9.9 8444"),
                (1, "6.2.2.3 8444 1600000100 9.9.9.9 8444"),
                // no new table entry: this record must be dropped on load
                (2, "6.3.2.3 8444 1600000200 9.9.9.9 8444"),
                (3, "7.1.2.3 8444 1600000300 7.1.2.3 8444"),
                (4, "7.2.2.3 8444 1600000400 7.2.2.3 8444"),
            ],
            &[(0, 11), (1, 12)],
        );
        std::fs::write(&path, &data).unwrap();

        let manager = store::load_or_create(&path, None);
        manager.check_consistency();

        assert_eq!(manager.key(), &KEY);
        assert_eq!(manager.new_count(), 2);
        assert_eq!(manager.tried_count(), 2);
        assert!(manager.find(&ip("6.1.2.3:8444")).is_some());
        assert!(manager.find(&ip("6.2.2.3:8444")).is_some());
        assert!(manager.find(&ip("6.3.2.3:8444")).is_none());
        assert!(manager.find(&ip("7.1.2.3:8444")).unwrap().is_tried());
        assert!(manager.find(&ip("7.2.2.3:8444")).unwrap().is_tried());
    }

    #[test]
    fn unparseable_legacy_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let key = decimal_key();
        let data = legacy_file(
            &[("key", &key), ("new_count", "2"), ("tried_count", "0")],
            &[
                (0, "6.1.2.3 8444 1600000000 9.9.9.9 8444"),
                (1, "not an address at all"),
            ],
            &[(0, 11), (1, 12)],
        );
        std::fs::write(&path, &data).unwrap();

        let manager = store::load_or_create(&path, None);
        manager.check_consistency();

        assert_eq!(manager.size(), 1);
        assert!(manager.find(&ip("6.1.2.3:8444")).is_some());
    }

    #[test]
    fn legacy_file_without_key_falls_through_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let data = legacy_file(&[("new_count", "0")], &[], &[]);
        std::fs::write(&path, &data).unwrap();

        let manager = store::load_or_create(&path, None);

        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn migrated_state_is_saved_in_the_current_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let key = decimal_key();
        let data = legacy_file(
            &[("key", &key), ("new_count", "1"), ("tried_count", "0")],
            &[(0, "6.1.2.3 8444 1600000000 9.9.9.9 8444")],
            &[(0, 11)],
        );
        std::fs::write(&path, &data).unwrap();
        let manager = store::load_or_create(&path, None);

        store::save_to_file(&manager, &path).unwrap();
        let reloaded = store::load_or_create(&path, None);

        reloaded.check_consistency();
        assert_eq!(reloaded.key(), &KEY);
        assert_eq!(reloaded.size(), 1);
        assert!(reloaded.find(&ip("6.1.2.3:8444")).is_some());
    }
}

mod legacy_sqlite {
    use super::*;
    use std::path::Path;

    fn write_peer_db(path: &Path, metadata: &[(&str, &str)], nodes: &[(i64, &str)], new_table: &[(i64, i64)]) {
        let connection = rusqlite::Connection::open(path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE peer_metadata(key TEXT PRIMARY KEY, value TEXT);
                 CREATE TABLE peer_nodes(node_id INTEGER PRIMARY KEY, value TEXT);
                 CREATE TABLE peer_new_table(node_id INTEGER, bucket INTEGER);",
            )
            .unwrap();
        for (key, value) in metadata {
            connection
                .execute("INSERT INTO peer_metadata VALUES (?1, ?2)", (key, value))
                .unwrap();
        }
        for (node_id, value) in nodes {
            connection
                .execute("INSERT INTO peer_nodes VALUES (?1, ?2)", (node_id, value))
                .unwrap();
        }
        for (node_id, bucket) in new_table {
            connection
                .execute("INSERT INTO peer_new_table VALUES (?1, ?2)", (node_id, bucket))
                .unwrap();
        }
    }

    fn decimal_key() -> String {
        BigUint::from_bytes_be(&KEY).to_str_radix(10)
    }

    #[test]
    fn legacy_peer_database_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("peer_table_node.sqlite");
        let key = decimal_key();
        write_peer_db(
            &db_path,
            &[("key", &key), ("new_count", "1"), ("tried_count", "1")],
            &[
                (0, "6.1.2.3 8444 1600000000 9.9.9.9 8444"),
                (1, "7.1.2.3 8444 1600000100 7.1.2.3 8444"),
            ],
            &[(0, 5)],
        );

        // the peers file does not exist yet; the legacy db is picked up
        let manager = store::load_or_create(&dir.path().join("peers.dat"), Some(&db_path));
        manager.check_consistency();

        assert_eq!(manager.key(), &KEY);
        assert_eq!(manager.new_count(), 1);
        assert_eq!(manager.tried_count(), 1);
        assert!(!manager.find(&ip("6.1.2.3:8444")).unwrap().is_tried());
        assert!(manager.find(&ip("7.1.2.3:8444")).unwrap().is_tried());

        // the legacy database is left in place
        assert!(db_path.exists());
    }

    #[test]
    fn empty_legacy_database_counts_as_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("peer_table_node.sqlite");
        write_peer_db(&db_path, &[("new_count", "0")], &[], &[]);

        let manager = store::load_or_create(&dir.path().join("peers.dat"), Some(&db_path));

        assert_eq!(manager.size(), 0);
    }
}
