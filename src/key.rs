//! Key tables: the id -> material label mapping embedded in region caches.
//!
//! The wire form is one `<decimal id><space><label>` entry per CRLF line.
//! Ids are handed out from 1; id 0 is reserved for unmapped cells.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Label marking a cell with no recorded material.
pub const EMPTY_MATERIAL: &str = "minecraft:air";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key table is not valid UTF-8")]
    Encoding,
    #[error("malformed key line {0:?}")]
    BadLine(String),
}

/// One contribution's key table, as read from its `key` stream.
pub struct KeyTable {
    /// Entries in file order, duplicates preserved as written.
    entries: Vec<(u16, String)>,
    /// Lookup by id; for duplicate ids the last occurrence wins.
    labels: HashMap<u16, String>,
}

impl KeyTable {
    pub fn parse(bytes: &[u8]) -> Result<Self, KeyError> {
        let text = std::str::from_utf8(bytes).map_err(|_| KeyError::Encoding)?;

        let mut entries = Vec::new();
        let mut labels = HashMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (id, label) = line
                .split_once(' ')
                .filter(|(_, label)| !label.is_empty())
                .ok_or_else(|| KeyError::BadLine(line.to_string()))?;
            let id: u16 = id.parse().map_err(|_| KeyError::BadLine(line.to_string()))?;

            entries.push((id, label.to_string()));
            labels.insert(id, label.to_string());
        }

        Ok(Self { entries, labels })
    }

    pub fn label(&self, id: u16) -> Option<&str> {
        self.labels.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn max_id(&self) -> u16 {
        self.entries.iter().map(|&(id, _)| id).max().unwrap_or(0)
    }
}

/// The growing output key table of one region merge: label -> global id.
pub struct GlobalKeys {
    ids: HashMap<String, u16>,
    next_id: u16,
}

impl GlobalKeys {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
        }
    }

    /// Fold one contribution's table in and return the remap from local ids
    /// to global ids, indexed by local id. A label already known keeps its
    /// global id; a new label takes the next free one. Local ids the table
    /// never names stay mapped to the reserved 0.
    pub fn fold(&mut self, local: &KeyTable) -> Vec<u16> {
        let mut remap = vec![0u16; 1 + local.max_id() as usize];
        let mut seen = HashSet::new();
        for &(local_id, _) in &local.entries {
            if !seen.insert(local_id) {
                continue;
            }
            // Resolve through the lookup map so a duplicated id folds its
            // winning (last-written) label.
            let label = &local.labels[&local_id];
            let global = match self.ids.get(label) {
                Some(&id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.ids.insert(label.clone(), id);
                    id
                }
            };
            remap[local_id as usize] = global;
        }
        remap
    }

    pub fn id(&self, label: &str) -> Option<u16> {
        self.ids.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Serialize to the wire text form, ascending by id. Inverse of
    /// [`KeyTable::parse`].
    pub fn serialize(&self) -> Vec<u8> {
        let mut entries: Vec<(u16, &str)> = self
            .ids
            .iter()
            .map(|(label, &id)| (id, label.as_str()))
            .collect();
        entries.sort_unstable_by_key(|&(id, _)| id);

        let mut out = Vec::new();
        for (id, label) in entries {
            out.extend_from_slice(format!("{} {}\r\n", id, label).as_bytes());
        }
        out
    }
}

impl Default for GlobalKeys {
    fn default() -> Self {
        Self::new()
    }
}
