//! Prints the entries of a txstore log file.
//!
//! ```bash
//! txstore-logdump ./data/txstore.log
//! txstore-logdump ./data/txstore.log --xid 7
//! txstore-logdump ./data/txstore.log --from 4096
//! ```

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use txstore::{
    log::{FileLogStorage, LogManager},
    Lsn, StorageResult, Xid,
};

#[derive(Parser, Debug)]
#[command(name = "txstore-logdump", version, about = "Dump the entries of a txstore log")]
struct Args {
    /// Log file to read
    path: PathBuf,

    /// Only print entries of this transaction
    #[arg(long)]
    xid: Option<Xid>,

    /// LSN to start from (defaults to the truncation point)
    #[arg(long)]
    from: Option<u64>,
}

fn dump(args: &Args) -> StorageResult<usize> {
    // Read-only: a torn tail is reported, never cut.
    let log = LogManager::open_read_only(Box::new(FileLogStorage::open_read_only(&args.path)?))?;
    let from = args
        .from
        .map_or(log.truncation_point(), Lsn::new)
        .max(log.truncation_point());
    println!(
        "# {} truncated at {} flushed to {}",
        args.path.display(),
        log.truncation_point(),
        log.flushed_lsn()
    );
    let mut printed = 0;
    for entry in log.scan(from) {
        let entry = entry?;
        if args.xid.is_some_and(|xid| xid != entry.xid) {
            continue;
        }
        println!("{entry}");
        printed += 1;
    }
    log.close()?;
    Ok(printed)
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match dump(&args) {
        Ok(printed) => {
            println!("# {printed} entries");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
