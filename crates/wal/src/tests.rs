use super::*;
use std::fs;
use tempfile::tempdir;

// -------------------- Helpers --------------------

fn replay_all(wal: &WalFile) -> Result<(Vec<Entry>, usize), WalError> {
    let mut out = Vec::new();
    let end = wal.iterate(0, |e| {
        out.push(e);
        Ok(())
    })?;
    Ok((out, end))
}

fn keys(entries: &[Entry]) -> Vec<&[u8]> {
    entries.iter().map(|e| e.key.as_slice()).collect()
}

// -------------------- Basic write & replay --------------------

#[test]
fn write_and_replay() -> Result<(), WalError> {
    let dir = tempdir()?;
    let path = wal_file_path(dir.path(), 1);
    let mut wal = WalFile::open(&path, 1, 4096, true)?;

    let mut tomb = Entry::tombstone("b");
    tomb.expires_at = 1234;
    wal.write(&Entry::new("a", "1"))?;
    wal.write(&tomb)?;

    let (entries, end) = replay_all(&wal)?;
    assert_eq!(end, wal.size());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].value, b"1");
    assert!(entries[1].is_deleted());
    assert_eq!(entries[1].expires_at, 1234);
    Ok(())
}

#[test]
fn file_name_is_zero_padded() {
    let p = wal_file_path(Path::new("/tmp/db"), 42);
    assert_eq!(p, Path::new("/tmp/db/00042.wal"));
}

#[test]
fn empty_log_replays_nothing() -> Result<(), WalError> {
    let dir = tempdir()?;
    let wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 4096, false)?;
    let (entries, end) = replay_all(&wal)?;
    assert!(entries.is_empty());
    assert_eq!(end, 0);
    Ok(())
}

#[test]
fn grows_past_initial_capacity() -> Result<(), WalError> {
    let dir = tempdir()?;
    let mut wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 64, false)?;
    for i in 0..200u32 {
        wal.write(&Entry::new(format!("key{i}"), vec![b'x'; 100]))?;
    }
    let (entries, end) = replay_all(&wal)?;
    assert_eq!(entries.len(), 200);
    assert_eq!(end, wal.size());
    assert_eq!(entries[199].key, b"key199");
    Ok(())
}

#[test]
fn estimate_covers_actual_size() -> Result<(), WalError> {
    let dir = tempdir()?;
    let mut wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 4096, false)?;
    let e = Entry::new("key", "value").with_ttl(std::time::Duration::from_secs(60));
    wal.write(&e)?;
    assert!(wal.size() <= estimate_entry_size(&e));
    Ok(())
}

#[test]
fn oversized_key_is_rejected() -> Result<(), WalError> {
    let dir = tempdir()?;
    let mut wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 4096, false)?;
    let err = wal
        .write(&Entry::new(vec![b'k'; MAX_KEY_SIZE + 1], "v"))
        .unwrap_err();
    assert!(matches!(err, WalError::RecordTooLarge(_)));
    assert_eq!(wal.size(), 0);
    Ok(())
}

// -------------------- Close & reopen --------------------

#[test]
fn close_trims_and_reopen_replays() -> Result<(), WalError> {
    let dir = tempdir()?;
    let path = wal_file_path(dir.path(), 7);
    let size = {
        let mut wal = WalFile::open(&path, 7, 1 << 16, false)?;
        wal.write(&Entry::new("x", "1"))?;
        wal.write(&Entry::new("y", "2"))?;
        let size = wal.size();
        wal.close()?;
        size
    };
    assert_eq!(fs::metadata(&path)?.len(), size as u64);

    let mut wal = WalFile::open(&path, 7, 1 << 16, false)?;
    let (entries, end) = replay_all(&wal)?;
    assert_eq!(keys(&entries), vec![b"x".as_slice(), b"y".as_slice()]);
    wal.truncate(end)?;
    wal.write(&Entry::new("z", "3"))?;
    let (entries, _) = replay_all(&wal)?;
    assert_eq!(entries.len(), 3);
    Ok(())
}

// -------------------- Torn tail recovery --------------------

#[test]
fn corrupted_last_byte_truncates_tail() -> Result<(), WalError> {
    let dir = tempdir()?;
    let path = wal_file_path(dir.path(), 1);
    let valid_end = {
        let mut wal = WalFile::open(&path, 1, 4096, true)?;
        wal.write(&Entry::new("a", "1"))?;
        wal.write(&Entry::new("b", "2"))?;
        let valid_end = wal.size();
        wal.write(&Entry::new("c", "3"))?;
        wal.close()?;
        valid_end
    };

    let mut bytes = fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, &bytes)?;

    let mut wal = WalFile::open(&path, 1, 4096, true)?;
    let (entries, end) = replay_all(&wal)?;
    assert_eq!(keys(&entries), vec![b"a".as_slice(), b"b".as_slice()]);
    assert_eq!(end, valid_end);

    wal.truncate(end)?;
    assert_eq!(fs::metadata(&path)?.len(), valid_end as u64);

    wal.write(&Entry::new("d", "4"))?;
    let (entries, _) = replay_all(&wal)?;
    assert_eq!(
        keys(&entries),
        vec![b"a".as_slice(), b"b".as_slice(), b"d".as_slice()]
    );
    Ok(())
}

#[test]
fn partial_record_is_ignored() -> Result<(), WalError> {
    let dir = tempdir()?;
    let path = wal_file_path(dir.path(), 1);
    {
        let mut wal = WalFile::open(&path, 1, 4096, false)?;
        wal.write(&Entry::new("k1", "v1"))?;
        wal.close()?;
    }

    // A header announcing a 10-byte key with nothing behind it.
    let mut bytes = fs::read(&path)?;
    bytes.extend_from_slice(&[10, 2, 0, 0, b'k']);
    fs::write(&path, &bytes)?;

    let wal = WalFile::open(&path, 1, 4096, false)?;
    let (entries, end) = replay_all(&wal)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(end, bytes.len() - 5);
    Ok(())
}

#[test]
fn truncate_beyond_end_is_rejected() -> Result<(), WalError> {
    let dir = tempdir()?;
    let mut wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 128, false)?;
    let err = wal.truncate(1 << 20).unwrap_err();
    assert!(matches!(err, WalError::InvalidTruncate { .. }));
    Ok(())
}

#[test]
fn truncate_to_zero_resets_log() -> Result<(), WalError> {
    let dir = tempdir()?;
    let mut wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 128, false)?;
    wal.write(&Entry::new("a", "1"))?;
    wal.truncate(0)?;
    assert_eq!(wal.size(), 0);
    assert!(replay_all(&wal)?.0.is_empty());
    wal.write(&Entry::new("b", "2"))?;
    assert_eq!(keys(&replay_all(&wal)?.0), vec![b"b".as_slice()]);
    Ok(())
}

#[test]
fn apply_error_is_propagated() -> Result<(), WalError> {
    let dir = tempdir()?;
    let mut wal = WalFile::open(wal_file_path(dir.path(), 1), 1, 128, false)?;
    wal.write(&Entry::new("a", "1"))?;
    let res = wal.iterate(0, |_| Err(WalError::Io(io::Error::other("boom"))));
    assert!(res.is_err());
    Ok(())
}

#[test]
fn delete_removes_file() -> Result<(), WalError> {
    let dir = tempdir()?;
    let path = wal_file_path(dir.path(), 3);
    let wal = WalFile::open(&path, 3, 128, false)?;
    assert!(path.exists());
    wal.delete()?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn huge_value_length_in_tail_is_torn() {
    let mut buf = Vec::new();
    // Header is 13 bytes, so header + key + value lands one short of
    // u64::MAX and only the checksum overflows.
    put_uvarint(&mut buf, 3);
    put_uvarint(&mut buf, u64::MAX - 17);
    put_uvarint(&mut buf, 0);
    put_uvarint(&mut buf, 0);
    buf.extend_from_slice(b"key");
    buf.extend_from_slice(&[0xab; 16]);

    assert!(matches!(decode_record(&buf), Record::Torn("truncated body")));
}
