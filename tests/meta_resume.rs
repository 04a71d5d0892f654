//! Durability properties of the relay checkpoint across process restarts.

use std::fs;

use binlog_relay::{Flavor, GtidSet, LocalMeta, Position};

const UUID_1: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
const UUID_2: &str = "5c9a4f17-8d1e-42c3-b0a5-0c5e11d2a0f1";

#[test]
fn test_flush_then_reload_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let meta = LocalMeta::new(Flavor::MySql, dir.path());
    meta.load().unwrap();
    meta.add_dir(UUID_1, None, None).unwrap();

    let pos = Position::new("mysql-bin.000017", 4242);
    let gtid = GtidSet::parse(Flavor::MySql, &format!("{UUID_1}:1-100:200-250")).unwrap();
    meta.save(&pos, Some(&gtid));
    meta.flush().unwrap();

    let reloaded = LocalMeta::new(Flavor::MySql, dir.path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.pos(), (UUID_1.to_string(), pos));
    let (_, loaded_gtid) = reloaded.gtid();
    assert_eq!(loaded_gtid.to_string(), gtid.to_string());
    assert!(!reloaded.dirty());
}

#[test]
fn test_promotion_order_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let meta = LocalMeta::new(Flavor::MySql, dir.path());
    meta.load().unwrap();
    meta.add_dir(UUID_1, None, None).unwrap();
    meta.add_dir(UUID_2, None, None).unwrap();

    let reloaded = LocalMeta::new(Flavor::MySql, dir.path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.uuids(), vec![UUID_1.to_string(), UUID_2.to_string()]);
    assert_eq!(reloaded.uuid(), UUID_2);
    assert_eq!(reloaded.dir(), dir.path().join(UUID_2));
}

#[test]
fn test_unflushed_save_is_lost_but_add_dir_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let meta = LocalMeta::new(Flavor::MySql, dir.path());
    meta.load().unwrap();
    meta.add_dir(UUID_1, None, None).unwrap();
    meta.save(&Position::new("mysql-bin.000001", 120), Some(&GtidSet::parse(
        Flavor::MySql,
        &format!("{UUID_1}:1-3"),
    ).unwrap()));
    meta.flush().unwrap();

    // A save without a flush stays in memory only.
    meta.save(&Position::new("mysql-bin.000001", 999), None);
    assert!(meta.dirty());

    let reloaded = LocalMeta::new(Flavor::MySql, dir.path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.pos().1, Position::new("mysql-bin.000001", 120));

    // add_dir persists on its own, carrying the provided GTID set.
    let merged = GtidSet::parse(Flavor::MySql, &format!("{UUID_2}:1-7")).unwrap();
    meta.add_dir(UUID_2, None, Some(merged.clone())).unwrap();

    let reloaded = LocalMeta::new(Flavor::MySql, dir.path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.uuid(), UUID_2);
    assert_eq!(reloaded.pos().1, Position::default());
    assert_eq!(reloaded.gtid().1.to_string(), merged.to_string());
}

#[test]
fn test_meta_file_is_human_inspectable_json() {
    let dir = tempfile::tempdir().unwrap();
    let meta = LocalMeta::new(Flavor::MySql, dir.path());
    meta.load().unwrap();
    meta.add_dir(UUID_1, None, None).unwrap();
    meta.save(&Position::new("mysql-bin.000002", 200), None);
    meta.flush().unwrap();

    let content = fs::read_to_string(dir.path().join(UUID_1).join("relay.meta")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["binlog_name"], "mysql-bin.000002");
    assert_eq!(value["binlog_pos"], 200);

    let index = fs::read_to_string(dir.path().join("server-uuid.index")).unwrap();
    assert_eq!(index.trim(), UUID_1);
}

#[test]
fn test_no_temp_files_left_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let meta = LocalMeta::new(Flavor::MySql, dir.path());
    meta.load().unwrap();
    meta.add_dir(UUID_1, None, None).unwrap();
    meta.save(&Position::new("mysql-bin.000001", 154), None);
    meta.flush().unwrap();

    for entry in fs::read_dir(dir.path()).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().to_string();
        assert!(!name.ends_with(".tmp"), "leftover temp file {name}");
    }
    for entry in fs::read_dir(dir.path().join(UUID_1)).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().to_string();
        assert!(!name.ends_with(".tmp"), "leftover temp file {name}");
    }
}
