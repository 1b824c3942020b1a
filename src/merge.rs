//! Per-region recency merge.
//!
//! Contributions are consumed newest first; each chunk is taken wholesale
//! from the first contribution that recorded data for it. Key ids are
//! rewritten through a shared output table built up as contributions fold
//! their local tables in.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::key::GlobalKeys;
use crate::region::{RegionBuffer, RegionPos, RegionSource, REGION_CHUNKS};

/// One source archive for one region, tagged by contributor and mtime.
pub struct Contribution {
    pub path: PathBuf,
    /// File modification time in unix seconds. The capture time is never
    /// read from the archive itself.
    pub mtime: i64,
    pub tag: Option<String>,
}

impl Contribution {
    /// Tag to report diagnostics under; untagged files fall back to their
    /// parent directory.
    fn diagnostic_tag(&self) -> String {
        match &self.tag {
            Some(tag) => tag.clone(),
            None => self
                .path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untagged".to_string()),
        }
    }
}

/// Merged output for one region.
pub struct MergedRegion {
    pub buffer: RegionBuffer,
    pub keys: GlobalKeys,
    /// Per chunk, the mtime of the contribution that supplied it; -1 unset.
    pub chunk_times: Vec<i64>,
}

/// Merge all of one region's contributions, newest chunk data winning.
///
/// Returns `None` when no contribution supplied a single non-empty chunk;
/// such a region produces no output at all. `skipped_tags` dedupes the
/// legacy-schema diagnostic across the whole batch so one old contribution
/// set does not flood the log.
pub fn merge_region(
    pos: RegionPos,
    mut contribs: Vec<Contribution>,
    skipped_tags: &mut HashSet<String>,
) -> Option<MergedRegion> {
    // Most recent first. The sort is stable, so equal mtimes keep the
    // caller's (directory-listing) order.
    contribs.sort_by(|a, b| b.mtime.cmp(&a.mtime));

    let mut buffer = RegionBuffer::new();
    let mut keys = GlobalKeys::new();
    let mut chunk_times = vec![-1i64; REGION_CHUNKS];
    let mut filled = [false; REGION_CHUNKS];
    let mut unfilled = REGION_CHUNKS;

    for contrib in &contribs {
        if unfilled == 0 {
            // Everything is resolved; older contributions cannot matter.
            break;
        }

        let source = match RegionSource::open(&contrib.path) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("skipping contribution {:?}: {}", contrib.path, e);
                continue;
            }
        };

        let local_keys = match source.keys() {
            Some(keys) if !keys.is_empty() => keys,
            Some(_) => {
                log::warn!("skipping contribution {:?}: empty key table", contrib.path);
                continue;
            }
            None => {
                let tag = contrib.diagnostic_tag();
                if skipped_tags.insert(tag.clone()) {
                    log::warn!("skipping old unkeyed contributions tagged {:?}", tag);
                }
                continue;
            }
        };

        // The local table only enters the output once this contribution
        // actually supplies a chunk, so an untouched region ends up with an
        // empty table and no stray labels.
        let mut remap: Option<Vec<u16>> = None;
        for chunk_index in 0..REGION_CHUNKS {
            if filled[chunk_index] || source.is_chunk_empty(chunk_index) {
                continue;
            }
            let remap = remap.get_or_insert_with(|| keys.fold(local_keys));
            buffer.copy_chunk(chunk_index, source.data(), remap);
            filled[chunk_index] = true;
            unfilled -= 1;
            chunk_times[chunk_index] = contrib.mtime;
        }
    }

    if keys.is_empty() {
        log::debug!("region {} has no chunk data, writing nothing", pos);
        return None;
    }

    Some(MergedRegion {
        buffer,
        keys,
        chunk_times,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{write_archive, DATA_STREAM, KEY_STREAM};
    use crate::region::{
        cell_offset, chunk_corner_cell, CHUNK_WIDTH, REGION_BYTES, REGION_WIDTH,
    };
    use std::path::Path;

    fn set_cell(data: &mut [u8], cell: usize, height: u8, id: u16) {
        let off = cell_offset(cell);
        data[off] = height;
        data[off + 1..off + 3].copy_from_slice(&id.to_be_bytes());
    }

    /// Data stream with every chunk corner reading as air (id `air_id`).
    fn blank_data(air_id: u16) -> Vec<u8> {
        let mut data = vec![0u8; REGION_BYTES];
        for chunk_index in 0..REGION_CHUNKS {
            set_cell(&mut data, chunk_corner_cell(chunk_index), 0, air_id);
        }
        data
    }

    fn fill_chunk(data: &mut [u8], chunk_index: usize, height: u8, id: u16) {
        let corner = chunk_corner_cell(chunk_index);
        for row in 0..CHUNK_WIDTH {
            for col in 0..CHUNK_WIDTH {
                set_cell(data, corner + row * REGION_WIDTH + col, height, id);
            }
        }
    }

    fn write_contribution(dir: &Path, name: &str, data: &[u8], key: Option<&[u8]>) -> PathBuf {
        let path = dir.join(name);
        let mut entries = vec![(DATA_STREAM, data)];
        if let Some(key) = key {
            entries.push((KEY_STREAM, key));
        }
        write_archive(&path, &entries).unwrap();
        path
    }

    fn contribution(path: PathBuf, mtime: i64) -> Contribution {
        let tag = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(crate::region::contrib_tag)
            .map(str::to_owned);
        Contribution { path, mtime, tag }
    }

    fn corner_id(merged: &MergedRegion, chunk_index: usize) -> u16 {
        let off = cell_offset(chunk_corner_cell(chunk_index));
        let bytes = merged.buffer.as_bytes();
        u16::from_be_bytes([bytes[off + 1], bytes[off + 2]])
    }

    #[test]
    fn test_newer_contribution_wins() {
        let dir = tempfile::tempdir().unwrap();

        let mut old = blank_data(1);
        fill_chunk(&mut old, 5, 64, 2);
        let old_path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &old,
            Some(b"1 minecraft:air\r\n2 minecraft:stone\r\n"),
        );

        let mut new = blank_data(1);
        fill_chunk(&mut new, 5, 70, 2);
        let new_path = write_contribution(
            dir.path(),
            "0,0,bob.zip",
            &new,
            Some(b"1 minecraft:air\r\n2 minecraft:stone\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![contribution(old_path, 1_000), contribution(new_path, 2_000)],
            &mut HashSet::new(),
        )
        .unwrap();

        let off = cell_offset(chunk_corner_cell(5));
        assert_eq!(merged.buffer.as_bytes()[off], 70);
        assert_eq!(merged.chunk_times[5], 2_000);
        assert_eq!(merged.buffer.as_bytes().len(), REGION_BYTES);
    }

    #[test]
    fn test_empty_newest_falls_through_to_older() {
        let dir = tempfile::tempdir().unwrap();

        let mut old = blank_data(1);
        fill_chunk(&mut old, 5, 64, 2);
        let old_path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &old,
            Some(b"1 minecraft:air\r\n2 minecraft:stone\r\n"),
        );

        let new_path = write_contribution(
            dir.path(),
            "0,0,bob.zip",
            &blank_data(1),
            Some(b"1 minecraft:air\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![contribution(new_path, 2_000), contribution(old_path, 1_000)],
            &mut HashSet::new(),
        )
        .unwrap();

        let off = cell_offset(chunk_corner_cell(5));
        assert_eq!(merged.buffer.as_bytes()[off], 64);
        assert_eq!(merged.chunk_times[5], 1_000);
        // Chunks nobody supplied stay unset.
        assert_eq!(merged.chunk_times[6], -1);
    }

    #[test]
    fn test_newer_supplies_both_chunks_older_never_folds() {
        // A (older) supplies chunk 5 with "stone" under local id 3.
        // B (newer) supplies chunk 5 ("stone" as id 7) and chunk 9 ("dirt" as id 2).
        let dir = tempfile::tempdir().unwrap();

        let mut a = blank_data(1);
        fill_chunk(&mut a, 5, 60, 3);
        let a_path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &a,
            Some(b"1 minecraft:air\r\n3 minecraft:stone\r\n"),
        );

        let mut b = blank_data(1);
        fill_chunk(&mut b, 5, 70, 7);
        fill_chunk(&mut b, 9, 65, 2);
        let b_path = write_contribution(
            dir.path(),
            "0,0,bob.zip",
            &b,
            Some(b"1 minecraft:air\r\n7 minecraft:stone\r\n2 minecraft:dirt\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![contribution(a_path, 1_000), contribution(b_path, 2_000)],
            &mut HashSet::new(),
        )
        .unwrap();

        // Both chunks sourced from B.
        assert_eq!(merged.chunk_times[5], 2_000);
        assert_eq!(merged.chunk_times[9], 2_000);

        // One entry each for stone and dirt; A never folded its table
        // because every chunk it supplied was already resolved.
        let stone = merged.keys.id("minecraft:stone").unwrap();
        let dirt = merged.keys.id("minecraft:dirt").unwrap();
        assert_eq!(merged.keys.len(), 3); // air, stone, dirt
        assert_eq!(corner_id(&merged, 5), stone);
        assert_eq!(corner_id(&merged, 9), dirt);
    }

    #[test]
    fn test_label_stable_remap_across_contributions() {
        // Same label under different local ids in different contributions
        // resolves to one shared global id in the output cells.
        let dir = tempfile::tempdir().unwrap();

        let mut a = blank_data(1);
        fill_chunk(&mut a, 0, 60, 3);
        let a_path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &a,
            Some(b"1 minecraft:air\r\n3 minecraft:stone\r\n"),
        );

        let mut b = blank_data(1);
        fill_chunk(&mut b, 1, 62, 7);
        let b_path = write_contribution(
            dir.path(),
            "0,0,bob.zip",
            &b,
            Some(b"1 minecraft:air\r\n7 minecraft:stone\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![contribution(a_path, 2_000), contribution(b_path, 1_000)],
            &mut HashSet::new(),
        )
        .unwrap();

        let stone = merged.keys.id("minecraft:stone").unwrap();
        assert_eq!(corner_id(&merged, 0), stone);
        assert_eq!(corner_id(&merged, 1), stone);
        assert_eq!(merged.keys.len(), 2);
    }

    #[test]
    fn test_all_empty_region_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &blank_data(1),
            Some(b"1 minecraft:air\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![contribution(path, 1_000)],
            &mut HashSet::new(),
        );
        assert!(merged.is_none());
    }

    #[test]
    fn test_corrupt_contribution_is_skipped() {
        let dir = tempfile::tempdir().unwrap();

        let bad_path = dir.path().join("0,0,eve.zip");
        std::fs::write(&bad_path, b"garbage").unwrap();

        let mut good = blank_data(1);
        fill_chunk(&mut good, 0, 64, 2);
        let good_path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &good,
            Some(b"1 minecraft:air\r\n2 minecraft:stone\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![contribution(bad_path, 2_000), contribution(good_path, 1_000)],
            &mut HashSet::new(),
        )
        .unwrap();

        assert_eq!(merged.chunk_times[0], 1_000);
    }

    #[test]
    fn test_legacy_contributions_rejected_once_per_tag() {
        let dir = tempfile::tempdir().unwrap();

        let mut legacy = vec![0u8; REGION_BYTES];
        fill_chunk(&mut legacy, 0, 64, 2);
        let l1 = write_contribution(dir.path(), "0,0,old_dump.zip", &legacy, None);
        let l2 = write_contribution(dir.path(), "1,0,old_dump.zip", &legacy, None);

        let mut skipped_tags = HashSet::new();
        assert!(merge_region(
            RegionPos::new(0, 0),
            vec![contribution(l1, 1_000)],
            &mut skipped_tags
        )
        .is_none());
        assert!(merge_region(
            RegionPos::new(1, 0),
            vec![contribution(l2, 1_000)],
            &mut skipped_tags
        )
        .is_none());

        // Both files share one tag, so the batch reports it once.
        assert_eq!(skipped_tags.len(), 1);
        assert!(skipped_tags.contains("old_dump"));
    }

    #[test]
    fn test_equal_mtimes_keep_listing_order() {
        let dir = tempfile::tempdir().unwrap();

        let mut first = blank_data(1);
        fill_chunk(&mut first, 0, 10, 2);
        let first_path = write_contribution(
            dir.path(),
            "0,0,alice.zip",
            &first,
            Some(b"1 minecraft:air\r\n2 minecraft:stone\r\n"),
        );

        let mut second = blank_data(1);
        fill_chunk(&mut second, 0, 20, 2);
        let second_path = write_contribution(
            dir.path(),
            "0,0,bob.zip",
            &second,
            Some(b"1 minecraft:air\r\n2 minecraft:stone\r\n"),
        );

        let merged = merge_region(
            RegionPos::new(0, 0),
            vec![
                contribution(first_path, 1_000),
                contribution(second_path, 1_000),
            ],
            &mut HashSet::new(),
        )
        .unwrap();

        let off = cell_offset(chunk_corner_cell(0));
        assert_eq!(merged.buffer.as_bytes()[off], 10);
    }
}
