use super::*;
use std::collections::HashMap;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_are_valid() {
    let opts = Options::default();
    assert!(opts.validate().is_ok());
    assert_eq!(opts.work_dir, PathBuf::from("./data"));
    assert_eq!(opts.memtable_size, 64 << 20);
    assert_eq!(opts.block_size, 4096);
    assert_eq!(opts.max_level_num, 7);
    assert_eq!(opts.num_level_zero_tables, 15);
    assert!(!opts.sync_writes);
}

#[test]
fn overrides_apply() {
    let opts = Options::from_lookup(lookup(&[
        ("HARDKV_DIR", "/tmp/hardkv"),
        ("HARDKV_MEMTABLE_KB", "16"),
        ("HARDKV_BLOCK_SIZE", "512"),
        ("HARDKV_BLOOM_FPR", "0.05"),
        ("HARDKV_SYNC", "true"),
        ("HARDKV_CACHE_BLOCKS", "32"),
        ("HARDKV_L0_TABLES", "3"),
    ]));
    assert_eq!(opts.work_dir, PathBuf::from("/tmp/hardkv"));
    assert_eq!(opts.memtable_size, 16 * 1024);
    assert_eq!(opts.block_size, 512);
    assert!((opts.bloom_false_positive - 0.05).abs() < f64::EPSILON);
    assert!(opts.sync_writes);
    assert_eq!(opts.block_cache_capacity, 32);
    assert_eq!(opts.num_level_zero_tables, 3);
    assert!(opts.validate().is_ok());
}

#[test]
fn unparsable_overrides_are_ignored() {
    let opts = Options::from_lookup(lookup(&[
        ("HARDKV_MEMTABLE_KB", "lots"),
        ("HARDKV_SYNC", "maybe"),
        ("HARDKV_DIR", "  "),
    ]));
    let defaults = Options::default();
    assert_eq!(opts.memtable_size, defaults.memtable_size);
    assert_eq!(opts.sync_writes, defaults.sync_writes);
    assert_eq!(opts.work_dir, defaults.work_dir);
}

#[test]
fn validate_rejects_bad_values() {
    let bad = [
        Options {
            memtable_size: 0,
            ..Options::default()
        },
        Options {
            block_size: 0,
            ..Options::default()
        },
        Options {
            bloom_false_positive: 1.0,
            ..Options::default()
        },
        Options {
            bloom_false_positive: -0.1,
            ..Options::default()
        },
        Options {
            max_level_num: 0,
            ..Options::default()
        },
        Options {
            work_dir: PathBuf::new(),
            ..Options::default()
        },
    ];
    for opts in bad {
        assert!(opts.validate().is_err(), "{opts:?} should be rejected");
    }
}

#[test]
fn zero_fpr_is_allowed() {
    let opts = Options {
        bloom_false_positive: 0.0,
        ..Options::with_dir("x")
    };
    assert!(opts.validate().is_ok());
    assert_eq!(opts.work_dir, PathBuf::from("x"));
}
