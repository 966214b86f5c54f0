use super::small_opts;
use crate::levels::*;
use crate::manifest::ManifestChange;
use crate::mem::MemTable;
use anyhow::Result;
use config::Options;
use memtable::{key_with_ts, parse_key, Entry};
use std::sync::Arc;
use tempfile::tempdir;

fn memtable_with(lm: &LevelManager, opts: &Options, rows: &[(&str, u64, &str)]) -> Result<MemTable> {
    let mem = MemTable::create(&opts.work_dir, lm.next_fid(), opts.memtable_size, false)?;
    for &(key, version, value) in rows {
        let mut e = Entry::new(key_with_ts(key.as_bytes(), version), value);
        e.version = version;
        mem.set(&e)?;
    }
    Ok(mem)
}

fn get_value(lm: &LevelManager, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(lm
        .get(&key_with_ts(key.as_bytes(), u64::MAX))?
        .map(|e| e.value))
}

// --------------------- Flush ---------------------

#[test]
fn flush_adds_table_to_level_zero_and_manifest() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let lm = LevelManager::open(&opts)?;

    let mem = memtable_with(&lm, &opts, &[("a", 1, "1"), ("b", 2, "2")])?;
    let fid = lm.flush(&mem)?.expect("table written");

    assert_eq!(lm.stats()[0].tables, 1);
    assert_eq!(lm.manifest().manifest().tables[&fid].level, 0);
    assert_eq!(lm.max_version(), 2);
    assert_eq!(get_value(&lm, "a")?, Some(b"1".to_vec()));
    assert_eq!(get_value(&lm, "zz")?, None);
    Ok(())
}

#[test]
fn flush_of_empty_memtable_writes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let lm = LevelManager::open(&opts)?;
    let mem = memtable_with(&lm, &opts, &[])?;
    assert_eq!(lm.flush(&mem)?, None);
    assert_eq!(lm.stats()[0].tables, 0);
    Ok(())
}

#[test]
fn flush_counts_older_versions_as_stale() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let lm = LevelManager::open(&opts)?;
    let mem = memtable_with(&lm, &opts, &[("k", 1, "old"), ("k", 2, "new"), ("j", 3, "x")])?;
    lm.flush(&mem)?;

    let stats = &lm.stats()[0];
    assert!(stats.stale_size > 0);
    assert!(stats.stale_size < stats.total_size);
    assert_eq!(get_value(&lm, "k")?, Some(b"new".to_vec()));
    Ok(())
}

#[test]
fn newest_level_zero_table_wins() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let lm = LevelManager::open(&opts)?;
    lm.flush(&memtable_with(&lm, &opts, &[("k", 1, "first")])?)?;
    lm.flush(&memtable_with(&lm, &opts, &[("k", 2, "second")])?)?;
    assert_eq!(get_value(&lm, "k")?, Some(b"second".to_vec()));
    Ok(())
}

// --------------------- Deeper levels ---------------------

#[test]
fn replace_tables_moves_data_to_level_one() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let lm = LevelManager::open(&opts)?;
    lm.flush(&memtable_with(&lm, &opts, &[("a", 1, "1"), ("c", 2, "3")])?)?;
    lm.flush(&memtable_with(&lm, &opts, &[("m", 3, "m"), ("p", 4, "p")])?)?;

    let l0 = lm.tables(0);
    // Hand the tables to L1 as-is: new references for L1, L0 drops its own.
    for t in &l0 {
        t.incr_ref();
    }
    lm.delete_tables(0, &l0)?;
    lm.replace_tables(1, &[], l0.clone())?;

    assert_eq!(lm.stats()[0].tables, 0);
    assert_eq!(lm.stats()[1].tables, 2);
    let manifest = lm.manifest().manifest();
    assert!(manifest.tables.values().all(|tm| tm.level == 1));
    assert!(l0.iter().all(|t| t.ref_count() == 1));

    assert_eq!(get_value(&lm, "a")?, Some(b"1".to_vec()));
    assert_eq!(get_value(&lm, "p")?, Some(b"p".to_vec()));
    // Falls between the two tables.
    assert_eq!(get_value(&lm, "f")?, None);

    let l1 = lm.level(1).expect("level 1");
    let range = KeyRange {
        left: b"b".to_vec(),
        right: b"n".to_vec(),
    };
    assert_eq!(l1.overlapping_tables(&range), (0, 2));
    let range = KeyRange {
        left: b"d".to_vec(),
        right: b"e".to_vec(),
    };
    let (left, right) = l1.overlapping_tables(&range);
    assert_eq!(left, right);
    Ok(())
}

#[test]
fn key_range_of_tables_uses_user_keys() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let lm = LevelManager::open(&opts)?;
    lm.flush(&memtable_with(&lm, &opts, &[("b", 1, "1"), ("d", 2, "3")])?)?;
    lm.flush(&memtable_with(&lm, &opts, &[("a", 3, "m"), ("c", 4, "p")])?)?;

    let range = KeyRange::of_tables(&lm.tables(0)).expect("range");
    assert_eq!(range.left, b"a".to_vec());
    assert_eq!(range.right, b"d".to_vec());
    assert!(range.overlaps_with(&KeyRange {
        left: b"d".to_vec(),
        right: b"z".to_vec(),
    }));
    assert!(!range.overlaps_with(&KeyRange {
        left: b"e".to_vec(),
        right: b"z".to_vec(),
    }));
    assert_eq!(KeyRange::of_tables(&[]), None);
    Ok(())
}

#[test]
fn compaction_candidate_after_enough_level_zero_tables() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        num_level_zero_tables: 3,
        ..small_opts(dir.path())
    };
    let lm = LevelManager::open(&opts)?;
    for (i, key) in ["a", "b"].into_iter().enumerate() {
        lm.flush(&memtable_with(&lm, &opts, &[(key, i as u64 + 1, "v")])?)?;
    }
    assert!(lm.compaction_candidate().is_none());

    lm.flush(&memtable_with(&lm, &opts, &[("c", 3, "v")])?)?;
    let candidate = lm.compaction_candidate().expect("candidate");
    assert_eq!(candidate.top.len(), 3);
    assert!(candidate.bottom.is_empty());
    assert_eq!(candidate.range.left, b"a".to_vec());
    assert_eq!(candidate.range.right, b"c".to_vec());
    Ok(())
}

// --------------------- Reopen ---------------------

#[test]
fn reopen_rebuilds_levels_from_manifest() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let max_fid = {
        let lm = LevelManager::open(&opts)?;
        lm.flush(&memtable_with(&lm, &opts, &[("x", 5, "1")])?)?;
        lm.flush(&memtable_with(&lm, &opts, &[("y", 9, "2")])?)?;
        lm.max_fid()
    };

    let lm = LevelManager::open(&opts)?;
    assert_eq!(lm.stats()[0].tables, 2);
    assert_eq!(lm.max_version(), 9);
    assert_eq!(lm.max_fid(), max_fid);
    assert_eq!(get_value(&lm, "y")?, Some(b"2".to_vec()));

    let tables = lm.tables(0);
    let fids: Vec<u64> = tables.iter().map(|t| t.fid()).collect();
    let mut sorted = fids.clone();
    sorted.sort_unstable();
    assert_eq!(fids, sorted);
    assert_eq!(parse_key(tables[0].min_key()), b"x");
    Ok(())
}

#[test]
fn missing_table_file_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    let fid = {
        let lm = LevelManager::open(&opts)?;
        lm.flush(&memtable_with(&lm, &opts, &[("x", 1, "1")])?)?
            .expect("table written")
    };
    std::fs::remove_file(sstable::table_file_path(dir.path(), fid))?;
    assert!(LevelManager::open(&opts).is_err());
    Ok(())
}

#[test]
fn table_beyond_max_level_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts(dir.path());
    {
        let lm = LevelManager::open(&opts)?;
        let fid = lm
            .flush(&memtable_with(&lm, &opts, &[("x", 1, "1")])?)?
            .expect("table written");
        let t: Arc<sstable::Table> = lm.tables(0)[0].clone();
        lm.manifest().add_changes(&[
            ManifestChange::delete(fid),
            ManifestChange::create(fid, 9, t.checksum_bytes()),
        ])?;
    }
    let err = LevelManager::open(&opts).unwrap_err();
    assert!(err.to_string().contains("beyond max_level_num"));
    Ok(())
}
