mod compaction_tests;
mod levels_tests;
mod recovery_tests;

use std::fs;
use std::path::Path;
use std::time::Duration;

use config::Options;

use crate::{Engine, Entry};

/// Options with tiny memtables and blocks so tests hit rotation quickly.
pub(crate) fn small_opts(dir: &Path) -> Options {
    Options {
        memtable_size: 4 * 1024,
        block_size: 256,
        sstable_max_size: 1 << 20,
        merge_interval: Duration::from_millis(20),
        ..Options::with_dir(dir)
    }
}

/// Options large enough that nothing rotates during a test.
pub(crate) fn roomy_opts(dir: &Path) -> Options {
    Options {
        memtable_size: 1 << 20,
        ..Options::with_dir(dir)
    }
}

pub(crate) fn open(opts: Options) -> anyhow::Result<Engine> {
    Engine::open(opts)
}

pub(crate) fn put(engine: &Engine, key: &str, value: &str) -> anyhow::Result<()> {
    engine.set(Entry::new(key, value))
}

pub(crate) fn value_of(engine: &Engine, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
    Ok(engine.get(key.as_bytes())?.map(|e| e.value))
}

pub(crate) fn count_files(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|x| x == ext)
                .unwrap_or(false)
        })
        .count()
}

pub(crate) fn keys(entries: &[Entry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| String::from_utf8_lossy(&e.key).into_owned())
        .collect()
}
