use memtable::{Entry, StorageIterator};
use std::sync::Arc;
use tempfile::tempdir;

use super::{build_table, collect, small_blocks, vkey};
use crate::{ConcatIterator, SstError, Table};

/// Three tables: a..c, g..i, m..o.
fn level(dir: &std::path::Path) -> Result<Vec<Arc<Table>>, SstError> {
    ["abc", "ghi", "mno"]
        .iter()
        .enumerate()
        .map(|(i, letters)| {
            let entries: Vec<_> = letters
                .chars()
                .map(|c| Entry::new(vkey(&c.to_string(), 1), c.to_string()))
                .collect();
            build_table(dir, i as u64 + 1, &entries, small_blocks())
        })
        .collect()
}

fn values(it: &mut ConcatIterator) -> String {
    collect(it)
        .into_iter()
        .map(|e| String::from_utf8(e.value).unwrap())
        .collect()
}

#[test]
fn walks_all_tables_in_order() -> Result<(), SstError> {
    let dir = tempdir()?;
    let tables = level(dir.path())?;

    let mut asc = ConcatIterator::new(tables.clone(), true);
    asc.rewind();
    assert_eq!(values(&mut asc), "abcghimno");

    let mut desc = ConcatIterator::new(tables, false);
    desc.rewind();
    assert_eq!(values(&mut desc), "onmihgcba");
    Ok(())
}

#[test]
fn seek_between_tables() -> Result<(), SstError> {
    let dir = tempdir()?;
    let tables = level(dir.path())?;

    let mut asc = ConcatIterator::new(tables.clone(), true);
    asc.seek(&vkey("d", u64::MAX));
    assert_eq!(values(&mut asc), "ghimno");
    asc.seek(&vkey("h", u64::MAX));
    assert_eq!(values(&mut asc), "himno");
    asc.seek(&vkey("p", u64::MAX));
    assert!(!asc.valid());

    let mut desc = ConcatIterator::new(tables, false);
    desc.seek(&vkey("k", 0));
    assert_eq!(values(&mut desc), "ihgcba");
    desc.seek(&vkey("b", 0));
    assert_eq!(values(&mut desc), "ba");
    desc.seek(&vkey("0", 0));
    assert!(!desc.valid());
    Ok(())
}

#[test]
fn empty_level() {
    let mut it = ConcatIterator::new(Vec::new(), true);
    it.rewind();
    assert!(!it.valid());
    it.seek(&vkey("a", 1));
    assert!(!it.valid());
}

#[test]
fn holds_references_until_dropped() -> Result<(), SstError> {
    let dir = tempdir()?;
    let tables = level(dir.path())?;

    let mut it = ConcatIterator::new(tables.clone(), true);
    it.rewind();
    assert_eq!(tables[0].ref_count(), 3); // level + concat + open table iterator
    assert_eq!(tables[2].ref_count(), 2);

    // Dropped from the level while the iterator is live.
    for t in &tables {
        t.decr_ref()?;
    }
    assert_eq!(values(&mut it), "abcghimno");
    drop(it);

    for t in &tables {
        assert!(!t.path().exists());
    }
    Ok(())
}
