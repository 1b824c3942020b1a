//! Batch driver: walks a directory of tagged contributions, merges region
//! by region, persists outputs and per-chunk timestamp records.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::archive;
use crate::merge::{merge_region, Contribution, MergedRegion};
use crate::region::{contrib_tag, RegionPos};

/// Seconds between progress reports.
pub const PROGRESS_INTERVAL_SECS: u64 = 3;

pub fn run(output_dir: &Path, input_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {:?}", output_dir))?;

    let groups = collect_contributions(input_dir)?;
    let total_files: usize = groups.values().map(Vec::len).sum();
    println!(
        "Merging {} contributions across {} regions into {:?}",
        total_files,
        groups.len(),
        output_dir
    );

    let mut progress = ProgressTracker::new(groups.len());
    let mut skipped_tags = HashSet::new();
    let mut written = 0usize;

    // BTreeMap iteration gives a fixed region order, so a rerun over the
    // same inputs behaves identically.
    for (pos, contribs) in groups {
        if let Some(merged) = merge_region(pos, contribs, &mut skipped_tags) {
            match write_region(output_dir, pos, &merged) {
                Ok(()) => written += 1,
                Err(e) => log::error!("failed writing region {}: {:#}", pos, e),
            }
        }
        progress.advance();
        if let Some(line) = progress.report() {
            println!("{}", line);
        }
    }

    let elapsed = progress.elapsed().as_secs();
    println!(
        "Done merging. Wrote {} regions in {}:{:02}",
        written,
        elapsed / 60,
        elapsed % 60
    );
    Ok(())
}

/// List `<x>,<z>[,<tag>].zip` files and group them by region position.
///
/// The listing is sorted by file name first, which fixes the tie order for
/// contributions with equal mtimes.
fn collect_contributions(
    input_dir: &Path,
) -> anyhow::Result<BTreeMap<RegionPos, Vec<Contribution>>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(input_dir)
        .with_context(|| format!("listing contribution directory {:?}", input_dir))?
    {
        let entry = entry?;
        match entry.file_name().into_string() {
            Ok(name) => names.push((name, entry.path())),
            Err(name) => log::debug!("ignoring non-unicode file name {:?}", name),
        }
    }
    names.sort();

    let mut groups: BTreeMap<RegionPos, Vec<Contribution>> = BTreeMap::new();
    for (name, path) in names {
        if name.ends_with("_chunk-times.gz") {
            // Leftover auxiliary output from a previous merge.
            continue;
        }
        match RegionPos::from_filename(&name) {
            Some(pos) => {
                let contribution = Contribution {
                    mtime: mtime_secs(&path),
                    tag: contrib_tag(&name).map(str::to_owned),
                    path,
                };
                groups.entry(pos).or_default().push(contribution);
            }
            None => log::debug!("ignoring non-contribution file {:?}", path),
        }
    }
    Ok(groups)
}

/// File mtime in unix seconds, 0 when unreadable.
fn mtime_secs(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn write_region(output_dir: &Path, pos: RegionPos, merged: &MergedRegion) -> anyhow::Result<()> {
    let key_bytes = merged.keys.serialize();
    archive::write_archive(
        &output_dir.join(format!("{}.zip", pos)),
        &[
            (archive::DATA_STREAM, merged.buffer.as_bytes()),
            (archive::KEY_STREAM, &key_bytes),
        ],
    )?;

    write_chunk_times(
        &output_dir.join(format!("{}_chunk-times.gz", pos)),
        &merged.chunk_times,
    )
}

/// Persist the per-chunk timestamp record: gzip over 256 comma-separated
/// decimal values, -1 for chunks no contribution supplied.
fn write_chunk_times(path: &Path, times: &[i64]) -> anyhow::Result<()> {
    let text = times
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let tmp_path = archive::temp_sibling(path);
    let file = File::create(&tmp_path)
        .with_context(|| format!("creating temp chunk-times file {:?}", tmp_path))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("moving chunk-times into place at {:?}", path))?;
    Ok(())
}

/// Plain counter-and-clock progress state, threaded through the driver.
pub struct ProgressTracker {
    total: usize,
    done: usize,
    started: Instant,
    next_report: u64,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            started: Instant::now(),
            next_report: PROGRESS_INTERVAL_SECS,
        }
    }

    pub fn advance(&mut self) {
        self.done += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Linear extrapolation from the work done so far; `None` until the
    /// first item completes.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        if self.done == 0 {
            return None;
        }
        Some(self.elapsed() / self.done as u32 * (self.total - self.done) as u32)
    }

    /// Progress line when a report is due, at most one per interval.
    pub fn report(&mut self) -> Option<String> {
        let elapsed = self.elapsed().as_secs();
        if elapsed < self.next_report {
            return None;
        }
        // Catch up after long stretches without completed work.
        if self.next_report < elapsed {
            self.next_report = elapsed;
        }
        self.next_report += PROGRESS_INTERVAL_SECS;

        let left = self.estimated_remaining()?.as_secs();
        Some(format!(
            "{}/{} regions merged, {}:{:02} left",
            self.done,
            self.total,
            left / 60,
            left % 60
        ))
    }
}
