//! # CLI - HardKV Interactive Shell
//!
//! A REPL-style command-line interface for the HardKV storage engine.
//! Reads commands from stdin, executes them against the engine, and prints
//! results to stdout. Logs go to stderr, so piping commands through stdin
//! and reading stdout works for scripted use.
//!
//! ## Commands
//!
//! ```text
//! SET key value [ttl]  Insert or update a key, optionally expiring after ttl seconds
//! GET key              Look up a key (prints value or "(nil)")
//! DEL key              Delete a key (writes a tombstone)
//! SCAN [prefix]        Live keys in ascending order
//! RSCAN [prefix]       Live keys in descending order
//! STATS                Print level and memtable statistics
//! EXIT / QUIT          Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! Settings come from `HARDKV_*` environment variables, see
//! [`config::Options::from_env`]:
//!
//! ```text
//! HARDKV_DIR          work directory               (default: "./data")
//! HARDKV_MEMTABLE_KB  memtable budget in KiB       (default: 65536)
//! HARDKV_BLOCK_SIZE   table block size in bytes    (default: 4096)
//! HARDKV_BLOOM_FPR    bloom false positive rate    (default: 0.01)
//! HARDKV_SYNC         msync every WAL record       (default: false)
//! HARDKV_CACHE_BLOCKS decoded blocks kept in cache (default: 1024)
//! HARDKV_L0_TABLES    L0 tables before compaction  (default: 15)
//! RUST_LOG            log filter                   (default: info)
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! HardKV started (dir=./data, next_version=1)
//! > SET name Alice
//! OK
//! > GET name
//! Alice
//! > SCAN
//! name -> Alice
//! (1 entries)
//! > EXIT
//! bye
//! ```

use anyhow::Result;
use config::Options;
use engine::{Engine, Entry, IteratorOptions, StorageIterator};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// What the REPL does after a command.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let opts = Options::from_env();
    let engine = Engine::open(opts)?;

    println!(
        "HardKV started (dir={}, next_version={})",
        engine.options().work_dir.display(),
        engine.next_version()
    );
    println!("Commands: SET key value [ttl] | GET key | DEL key");
    println!("          SCAN [prefix] | RSCAN [prefix] | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if execute(&engine, &line, &mut stdout)? == Flow::Exit {
            break;
        }
        print!("> ");
        stdout.flush().ok();
    }

    engine.close()?;
    Ok(())
}

/// Runs one command line, writing its result to `out`.
///
/// Engine errors are reported as `ERR ...` lines; only failures to write
/// the output abort the REPL.
fn execute(engine: &Engine, line: &str, out: &mut impl Write) -> io::Result<Flow> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(Flow::Continue);
    };
    let args: Vec<&str> = parts.collect();

    match cmd.to_uppercase().as_str() {
        "SET" => match args.as_slice() {
            [k, v] | [k, v, _] => {
                let mut entry = Entry::new(k.as_bytes(), v.as_bytes());
                if let Some(ttl) = args.get(2) {
                    match ttl.parse::<u64>() {
                        Ok(secs) if secs > 0 => entry = entry.with_ttl(Duration::from_secs(secs)),
                        _ => {
                            writeln!(out, "ERR ttl must be a positive number of seconds")?;
                            return Ok(Flow::Continue);
                        }
                    }
                }
                match engine.set(entry) {
                    Ok(()) => writeln!(out, "OK")?,
                    Err(e) => writeln!(out, "ERR set failed: {e}")?,
                }
            }
            _ => writeln!(out, "ERR usage: SET key value [ttl]")?,
        },
        "GET" => match args.as_slice() {
            [k] => match engine.get(k.as_bytes()) {
                Ok(Some(e)) => writeln!(out, "{}", String::from_utf8_lossy(&e.value))?,
                Ok(None) => writeln!(out, "(nil)")?,
                Err(e) => writeln!(out, "ERR read failed: {e}")?,
            },
            _ => writeln!(out, "ERR usage: GET key")?,
        },
        "DEL" => match args.as_slice() {
            [k] => match engine.del(k.as_bytes()) {
                Ok(()) => writeln!(out, "OK")?,
                Err(e) => writeln!(out, "ERR del failed: {e}")?,
            },
            _ => writeln!(out, "ERR usage: DEL key")?,
        },
        "SCAN" | "RSCAN" => {
            let opts = IteratorOptions {
                prefix: args.first().map(|p| p.as_bytes().to_vec()).unwrap_or_default(),
                is_asc: cmd.eq_ignore_ascii_case("SCAN"),
            };
            scan(engine, opts, out)?;
        }
        "STATS" => write!(out, "{}", engine.stats())?,
        "EXIT" | "QUIT" => {
            writeln!(out, "bye")?;
            return Ok(Flow::Exit);
        }
        other => writeln!(out, "unknown command: {other}")?,
    }
    Ok(Flow::Continue)
}

fn scan(engine: &Engine, opts: IteratorOptions, out: &mut impl Write) -> io::Result<()> {
    let mut it = match engine.iter(opts) {
        Ok(it) => it,
        Err(e) => return writeln!(out, "ERR scan failed: {e}"),
    };
    it.rewind();
    let mut count = 0usize;
    while let Some(e) = it.item() {
        writeln!(
            out,
            "{} -> {}",
            String::from_utf8_lossy(&e.key),
            String::from_utf8_lossy(&e.value)
        )?;
        count += 1;
        it.next();
    }
    if count == 0 {
        writeln!(out, "(empty)")
    } else {
        writeln!(out, "({count} entries)")
    }
}
