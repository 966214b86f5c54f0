use super::{open, put, small_opts};
use crate::closer::Closer;
use crate::*;
use anyhow::Result;
use config::Options;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

// --------------------- Merge worker ---------------------

#[test]
fn candidate_appears_once_level_zero_fills_up() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        num_level_zero_tables: 2,
        ..small_opts(dir.path())
    };
    let engine = open(opts)?;

    put(&engine, "a", "1")?;
    engine.force_flush()?;
    assert!(engine.compaction_candidate().is_none());

    put(&engine, "m", "2")?;
    engine.force_flush()?;
    let candidate = engine.compaction_candidate().expect("candidate");
    assert_eq!(candidate.top.len(), 2);
    assert!(candidate.bottom.is_empty());
    assert_eq!(candidate.range.left, b"a".to_vec());
    assert_eq!(candidate.range.right, b"m".to_vec());

    // Let the worker tick a few times; nothing is rewritten.
    thread::sleep(Duration::from_millis(80));
    assert_eq!(engine.table_counts()[0], 2);
    Ok(())
}

#[test]
fn close_stops_worker_promptly() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        merge_interval: Duration::from_secs(60),
        ..small_opts(dir.path())
    };
    let engine = open(opts)?;

    let start = Instant::now();
    engine.close()?;
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(engine.merge_worker.lock().is_none());
    Ok(())
}

// --------------------- Closer ---------------------

#[test]
fn closer_waits_for_every_worker() {
    let closer = Arc::new(Closer::new());
    let finished = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    closer.add_running(3);
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let closer = Arc::clone(&closer);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                while !closer.wait_timeout(Duration::from_millis(5)) {}
                finished.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                closer.done();
            })
        })
        .collect();

    closer.signal_and_wait();
    assert!(closer.is_closed());
    assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 3);
    for h in handles {
        h.join().unwrap();
    }

    // A second signal returns at once.
    closer.signal_and_wait();
}

#[test]
fn wait_timeout_returns_false_until_signalled() {
    let closer = Closer::new();
    assert!(!closer.wait_timeout(Duration::from_millis(1)));
    closer.signal_and_wait();
    assert!(closer.wait_timeout(Duration::from_secs(60)));
}

#[test]
fn merged_tables_can_be_committed_to_level_one() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(small_opts(dir.path()))?;
        put(&engine, "apple", "1")?;
        put(&engine, "banana", "2")?;
        engine.force_flush()?;
        put(&engine, "mango", "3")?;
        put(&engine, "peach", "4")?;
        engine.force_flush()?;
        assert_eq!(engine.table_counts()[..2], [2, 0]);

        let levels = engine.levels();
        let l0 = levels.tables(0);
        for t in &l0 {
            t.incr_ref();
        }
        levels.delete_tables(0, &l0)?;
        levels.replace_tables(1, &[], l0)?;

        assert_eq!(engine.table_counts()[..2], [0, 2]);
        assert_eq!(engine.get(b"banana")?.map(|e| e.value), Some(b"2".to_vec()));
        assert_eq!(engine.get(b"peach")?.map(|e| e.value), Some(b"4".to_vec()));
        engine.close()?;
    }

    let engine = open(small_opts(dir.path()))?;
    assert_eq!(engine.table_counts()[..2], [0, 2]);
    assert_eq!(engine.scan(b"", true)?.len(), 4);
    Ok(())
}
