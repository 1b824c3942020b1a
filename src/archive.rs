//! Zip container codec for region caches.
//!
//! A cache archive holds a raw `data` stream and, in the current schema, a
//! `key` stream with the id -> label table. Writes go through a temp file
//! and a rename so a partially written archive is never visible at the
//! final path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use thiserror::Error;

/// Stream name of the region cell data.
pub const DATA_STREAM: &str = "data";

/// Stream name of the key table.
pub const KEY_STREAM: &str = "key";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("unreadable archive: {0}")]
    Corrupt(String),
    #[error("archive has no `{0}` stream")]
    MissingStream(&'static str),
}

/// Read the raw `data` stream (required) and `key` stream (optional).
pub fn read_streams(path: &Path) -> Result<(Vec<u8>, Option<Vec<u8>>), ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
    let mut container =
        zip::ZipArchive::new(file).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

    let data = read_stream(&mut container, DATA_STREAM)?
        .ok_or(ArchiveError::MissingStream(DATA_STREAM))?;
    let key = read_stream(&mut container, KEY_STREAM)?;
    Ok((data, key))
}

fn read_stream(
    container: &mut zip::ZipArchive<File>,
    name: &'static str,
) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut entry = match container.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ArchiveError::Corrupt(e.to_string())),
    };

    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
    Ok(Some(bytes))
}

/// Write an archive atomically: all entries deflated into `<path>.tmp`,
/// then renamed into place.
pub fn write_archive(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    let tmp_path = temp_sibling(path);
    let file = File::create(&tmp_path)
        .with_context(|| format!("creating temp archive {:?}", tmp_path))?;

    let mut writer = zip::ZipWriter::new(file);
    for &(name, bytes) in entries {
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer.start_file(name, options)?;
        writer.write_all(bytes)?;
    }
    writer.finish()?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("moving archive into place at {:?}", path))?;
    Ok(())
}

/// Temp path next to `path`, on the same filesystem so the rename is atomic.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
