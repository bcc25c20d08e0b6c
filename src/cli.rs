//! Argument parsing and dispatch for the `jfsck` binary.

use std::path::PathBuf;

use clap::Parser;

use jio::{fsck, Error, FsckOptions};

/// Check a journaled file and roll forward its pending transactions.
#[derive(Parser, Debug)]
#[command(name = "jfsck", version, about)]
pub struct Cli {
    /// Path to the journaled data file
    pub datafile: PathBuf,

    /// Remove broken journal records after reporting them
    #[arg(long)]
    pub cleanup: bool,
}

/// Run the check and return the process exit code:
/// 0 on a clean or recovered journal, 1 when broken records remain and
/// cleanup was not requested, 2 on I/O or usage errors.
pub fn run(cli: &Cli) -> i32 {
    let options = FsckOptions {
        cleanup: cli.cleanup,
    };
    match fsck(&cli.datafile, &options) {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => {
                    eprintln!("jfsck: {e}");
                    return 2;
                }
            }
            if report.broken > 0 && !cli.cleanup {
                1
            } else {
                0
            }
        }
        Err(Error::NoJournal) => {
            println!("{}", serde_json::json!({ "status": "no-journal" }));
            0
        }
        Err(e) => {
            eprintln!("jfsck: {e}");
            2
        }
    }
}
