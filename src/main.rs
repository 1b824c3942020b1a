//! mc-region-merge: merges independently captured region cache snapshots.
//!
//! Each input archive covers one region and is tagged with the contributor
//! it came from. The merge picks, chunk by chunk, the most recently captured
//! contribution that actually recorded data there, and rebuilds a shared
//! key table for the output region.

mod archive;
mod batch;
mod key;
mod merge;
mod region;

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "mc-region-merge",
    about = "Merge tagged region cache snapshots, newest chunk wins"
)]
struct Args {
    /// Directory the merged cache is written to.
    output_dir: PathBuf,

    /// Directory of tagged contributions (`<x>,<z>,<tag>.zip`).
    input_dir: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = batch::run(&args.output_dir, &args.input_dir) {
        log::error!("merge failed: {:#}", e);
        std::process::exit(1);
    }
}
