use super::{count_files, open, put, roomy_opts, small_opts, value_of};
use crate::*;
use anyhow::Result;
use config::Options;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::tempdir;

// --------------------- WAL replay ---------------------

#[test]
fn recovery_from_wal() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(roomy_opts(dir.path()))?;
        put(&engine, "a", "1")?;
        put(&engine, "b", "2")?;
        engine.del(b"a")?;
        assert_eq!(engine.table_counts()[0], 0);
    }
    assert_eq!(count_files(dir.path(), "wal"), 1);

    let engine = open(roomy_opts(dir.path()))?;
    assert!(engine.get(b"a")?.is_none());
    assert_eq!(value_of(&engine, "b")?, Some(b"2".to_vec()));
    assert_eq!(engine.next_version(), 4);
    // The recovered WAL went to L0; only the fresh WAL is left.
    assert_eq!(engine.table_counts()[0], 1);
    assert_eq!(count_files(dir.path(), "wal"), 1);
    Ok(())
}

#[test]
fn recovery_from_tables() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(small_opts(dir.path()))?;
        for i in 0..300 {
            put(&engine, &format!("k{i:03}"), &format!("v{i}"))?;
        }
        assert!(engine.table_counts()[0] > 0);
    }

    let engine = open(small_opts(dir.path()))?;
    for i in 0..300 {
        assert_eq!(
            value_of(&engine, &format!("k{i:03}"))?,
            Some(format!("v{i}").into_bytes())
        );
    }
    assert_eq!(engine.next_version(), 301);
    Ok(())
}

#[test]
fn versions_keep_increasing_across_reopens() -> Result<()> {
    let dir = tempdir()?;
    for round in 0..3u64 {
        let engine = open(roomy_opts(dir.path()))?;
        put(&engine, "k", &format!("round{round}"))?;
        let e = engine.get(b"k")?.unwrap();
        assert_eq!(e.version, round + 1);
    }
    let engine = open(roomy_opts(dir.path()))?;
    assert_eq!(value_of(&engine, "k")?, Some(b"round2".to_vec()));
    Ok(())
}

#[test]
fn empty_wal_is_discarded() -> Result<()> {
    let dir = tempdir()?;
    {
        let _engine = open(roomy_opts(dir.path()))?;
    }
    let engine = open(roomy_opts(dir.path()))?;
    assert_eq!(engine.table_counts()[0], 0);
    assert_eq!(count_files(dir.path(), "wal"), 1);
    assert_eq!(count_files(dir.path(), "sst"), 0);
    Ok(())
}

#[test]
fn torn_wal_tail_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    let wal_path = {
        let engine = open(roomy_opts(dir.path()))?;
        put(&engine, "a", "1")?;
        put(&engine, "b", "2")?;
        put(&engine, "c", "3")?;
        let fid = engine.mem.read().fid();
        wal::wal_file_path(dir.path(), fid)
    };

    // A half-written record after the last good one.
    let mut f = OpenOptions::new().append(true).open(&wal_path)?;
    f.write_all(&[0x01, 0x05, 0x00, 0x00, b'd'])?;
    drop(f);

    let engine = open(roomy_opts(dir.path()))?;
    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
        assert_eq!(value_of(&engine, k)?, Some(v.as_bytes().to_vec()));
    }
    assert!(engine.get(b"d")?.is_none());
    assert_eq!(engine.next_version(), 4);
    put(&engine, "d", "4")?;
    assert_eq!(value_of(&engine, "d")?, Some(b"4".to_vec()));
    Ok(())
}

#[test]
fn several_wals_are_replayed_in_order() -> Result<()> {
    let dir = tempdir()?;
    let opts = roomy_opts(dir.path());
    {
        let engine = open(opts.clone())?;
        put(&engine, "k", "old")?;
    }
    // A newer WAL left behind next to the first one.
    {
        let mut wal = wal::WalFile::open(wal::wal_file_path(dir.path(), 2), 2, 4096, false)?;
        let mut e = Entry::new(memtable::key_with_ts(b"k", 2), "new");
        e.version = 2;
        wal.write(&e)?;
        wal.close()?;
    }

    let engine = open(opts)?;
    let e = engine.get(b"k")?.unwrap();
    assert_eq!(e.value, b"new".to_vec());
    assert_eq!(e.version, 2);
    assert_eq!(engine.next_version(), 3);
    assert_eq!(engine.table_counts()[0], 2);
    Ok(())
}

// --------------------- Directory hygiene ---------------------

#[test]
fn leftover_temp_tables_are_removed() -> Result<()> {
    let dir = tempdir()?;
    let tmp = dir.path().join("00042.sst.tmp");
    fs::write(&tmp, b"partial")?;
    let _engine = open(roomy_opts(dir.path()))?;
    assert!(!tmp.exists());
    Ok(())
}

#[test]
fn orphan_tables_are_removed() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(roomy_opts(dir.path()))?;
        put(&engine, "a", "1")?;
        engine.force_flush()?;
    }
    let orphan = sstable::table_file_path(dir.path(), 999);
    fs::write(&orphan, b"not a table")?;

    let engine = open(roomy_opts(dir.path()))?;
    assert!(!orphan.exists());
    assert_eq!(value_of(&engine, "a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn missing_table_fails_open() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(roomy_opts(dir.path()))?;
        put(&engine, "a", "1")?;
        engine.force_flush()?;
    }
    for entry in fs::read_dir(dir.path())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sst") {
            fs::remove_file(path)?;
        }
    }
    assert!(open(roomy_opts(dir.path())).is_err());
    Ok(())
}

#[test]
fn invalid_options_fail_open() {
    let dir = tempdir().unwrap();
    let opts = Options {
        memtable_size: 0,
        ..Options::with_dir(dir.path())
    };
    assert!(open(opts).is_err());
}

#[test]
fn file_ids_continue_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let max_fid = {
        let engine = open(roomy_opts(dir.path()))?;
        put(&engine, "a", "1")?;
        engine.force_flush()?;
        engine.stats().max_fid
    };
    let engine = open(roomy_opts(dir.path()))?;
    assert!(engine.stats().max_fid > max_fid);
    put(&engine, "b", "2")?;
    engine.force_flush()?;
    assert_eq!(engine.table_counts()[0], 2);
    Ok(())
}
