//! L4 — the in-memory file table (spec §3, §4.5).
//!
//! Ordered by entry id, with a secondary name index covering only
//! `Active` entries. Serialization is a length-prefixed record stream
//! (`postcard`, matching the teacher's on-disk encoding) sealed
//! separately by [`crate::volume`] under the master key.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{MyfsError, Result};

/// `(offset, length)` reference into the container's data region (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub offset: u64,
    pub length: u64,
}

impl Locator {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &Locator) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Whether a payload is sealed directly under the master key or under
/// a per-file key wrapped by the master key (spec §9: "a single entry
/// shape with an optional wrapped-file-key field").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Direct,
    Wrapped {
        #[serde(with = "serde_bytes")]
        wrapped_key: Vec<u8>,
        wrap_nonce: [u8; 12],
    },
}

impl Payload {
    pub fn is_protected(&self) -> bool {
        matches!(self, Payload::Wrapped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Active,
    SoftDeleted,
    PendingPurge,
}

/// A single file's metadata (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: u64,
    pub name: String,
    pub original_size: u64,
    pub ciphertext_size: u64,
    pub imported_at: u64,
    pub salt: [u8; 32],
    pub payload: Payload,
    pub content_digest: [u8; 32],
    pub locator: Locator,
    pub state: EntryState,
    pub deleted_at: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct TableOnDisk {
    version: u16,
    entries: Vec<FileEntry>,
}

const TABLE_FORMAT_VERSION: u16 = 1;

/// A single step of a purge/compaction rewrite plan (spec §4.5, §4.7).
#[derive(Debug, Clone, Copy)]
pub struct CompactionStep {
    pub id: u64,
    pub old_locator: Locator,
    pub new_locator: Locator,
}

#[derive(Debug, Default)]
pub struct FileTable {
    entries: BTreeMap<u64, FileEntry>,
    active_names: HashMap<String, u64>,
    next_id: u64,
}

impl FileTable {
    pub fn new() -> Self {
        FileTable { entries: BTreeMap::new(), active_names: HashMap::new(), next_id: 1 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate the next strictly-increasing, never-reused entry id (spec §3).
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: u64) -> Option<&FileEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut FileEntry> {
        self.entries.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    /// Insert a freshly-imported entry. Requires a unique name among
    /// `Active` entries (spec §4.5); colliding with a `SoftDeleted`
    /// entry of the same name is permitted.
    pub fn insert(&mut self, entry: FileEntry) -> Result<()> {
        if entry.state == EntryState::Active && self.active_names.contains_key(&entry.name) {
            return Err(MyfsError::NameTaken(entry.name));
        }
        for existing in self.entries.values() {
            if matches!(existing.state, EntryState::Active | EntryState::SoftDeleted)
                && existing.locator.overlaps(&entry.locator)
            {
                return Err(MyfsError::InvalidInput(format!(
                    "locator for entry {} overlaps existing entry {}",
                    entry.id, existing.id
                )));
            }
        }
        if entry.state == EntryState::Active {
            self.active_names.insert(entry.name.clone(), entry.id);
        }
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    /// Find an entry by display name. `include_deleted` also searches
    /// `SoftDeleted`/`PendingPurge` entries (spec §4.5, §7 `NotFound`).
    pub fn find_by_name(&self, name: &str, include_deleted: bool) -> Option<&FileEntry> {
        if let Some(&id) = self.active_names.get(name) {
            return self.entries.get(&id);
        }
        if include_deleted {
            return self.entries.values().find(|e| e.name == name && e.state != EntryState::Active);
        }
        None
    }

    /// Enforce the lifecycle of spec §3:
    /// `Active ⇄ SoftDeleted`, `{Active,SoftDeleted} → PendingPurge`.
    pub fn transition(&mut self, id: u64, new_state: EntryState, now: u64) -> Result<()> {
        let current = self.entries.get(&id).ok_or_else(|| MyfsError::NotFound(id.to_string()))?.state;
        let allowed = matches!(
            (current, new_state),
            (EntryState::Active, EntryState::SoftDeleted)
                | (EntryState::SoftDeleted, EntryState::Active)
                | (EntryState::Active, EntryState::PendingPurge)
                | (EntryState::SoftDeleted, EntryState::PendingPurge)
        );
        if !allowed {
            return Err(MyfsError::InvalidInput(format!(
                "illegal transition {current:?} -> {new_state:?}"
            )));
        }
        if new_state == EntryState::Active {
            let name = self.entries.get(&id).unwrap().name.clone();
            if self.active_names.contains_key(&name) {
                return Err(MyfsError::NameTaken(name));
            }
        }
        let entry = self.entries.get_mut(&id).unwrap();
        match (current, new_state) {
            (EntryState::Active, EntryState::SoftDeleted) | (EntryState::Active, EntryState::PendingPurge) => {
                self.active_names.remove(&entry.name);
            }
            (EntryState::SoftDeleted, EntryState::Active) => {
                self.active_names.insert(entry.name.clone(), entry.id);
            }
            _ => {}
        }
        entry.state = new_state;
        entry.deleted_at = if new_state == EntryState::Active { None } else { Some(now) };
        Ok(())
    }

    /// Drop a `PendingPurge` entry from the table entirely (spec §4.7, Purge).
    pub fn remove(&mut self, id: u64) -> Option<FileEntry> {
        self.entries.remove(&id)
    }

    /// Build a rewrite plan that packs every non-`PendingPurge` entry's
    /// payload contiguously, preserving id order (spec §4.5 `compact()`).
    pub fn compact_plan(&self) -> Vec<CompactionStep> {
        let mut plan = Vec::new();
        let mut cursor: u64 = 0;
        for entry in self.entries.values() {
            if entry.state == EntryState::PendingPurge {
                continue;
            }
            let new_locator = Locator { offset: cursor, length: entry.locator.length };
            if new_locator != entry.locator {
                plan.push(CompactionStep { id: entry.id, old_locator: entry.locator, new_locator });
            }
            cursor += entry.locator.length;
        }
        plan
    }

    /// Apply a previously computed compaction plan and drop every
    /// `PendingPurge` entry (spec §4.7 Purge).
    pub fn apply_compaction(&mut self, plan: &[CompactionStep]) {
        for step in plan {
            if let Some(entry) = self.entries.get_mut(&step.id) {
                entry.locator = step.new_locator;
            }
        }
        self.entries.retain(|_, e| e.state != EntryState::PendingPurge);
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let disk = TableOnDisk { version: TABLE_FORMAT_VERSION, entries: self.entries.values().cloned().collect() };
        postcard::to_allocvec(&disk).map_err(|e| MyfsError::InvalidInput(format!("table serialize failed: {e}")))
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        let disk: TableOnDisk = postcard::from_bytes(bytes).map_err(|_| MyfsError::TableCorrupt)?;
        let mut table = FileTable::new();
        let mut max_id = 0;
        for entry in disk.entries {
            max_id = max_id.max(entry.id);
            if entry.state == EntryState::Active {
                table.active_names.insert(entry.name.clone(), entry.id);
            }
            table.entries.insert(entry.id, entry);
        }
        table.next_id = max_id + 1;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, name: &str, state: EntryState) -> FileEntry {
        FileEntry {
            id,
            name: name.to_string(),
            original_size: 10,
            ciphertext_size: 26,
            imported_at: 0,
            salt: [0u8; 32],
            payload: Payload::Direct,
            content_digest: [0u8; 32],
            locator: Locator { offset: id * 100, length: 26 },
            state,
            deleted_at: None,
        }
    }

    #[test]
    fn duplicate_active_names_rejected() {
        let mut t = FileTable::new();
        t.insert(entry(1, "a.txt", EntryState::Active)).unwrap();
        assert!(matches!(t.insert(entry(2, "a.txt", EntryState::Active)), Err(MyfsError::NameTaken(_))));
    }

    #[test]
    fn soft_deleted_name_collision_allowed() {
        let mut t = FileTable::new();
        t.insert(entry(1, "a.txt", EntryState::SoftDeleted)).unwrap();
        assert!(t.insert(entry(2, "a.txt", EntryState::Active)).is_ok());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut t = FileTable::new();
        t.insert(entry(1, "a.txt", EntryState::Active)).unwrap();
        t.transition(1, EntryState::SoftDeleted, 100).unwrap();
        assert_eq!(t.find_by_name("a.txt", false), None);
        assert!(t.find_by_name("a.txt", true).is_some());
        t.transition(1, EntryState::Active, 200).unwrap();
        assert!(t.find_by_name("a.txt", false).is_some());
        t.transition(1, EntryState::PendingPurge, 300).unwrap();
        assert!(t.transition(1, EntryState::Active, 400).is_err());
    }

    #[test]
    fn recover_collision_fails() {
        let mut t = FileTable::new();
        t.insert(entry(1, "a.txt", EntryState::Active)).unwrap();
        t.insert(entry(2, "a.txt", EntryState::SoftDeleted)).unwrap();
        assert!(matches!(t.transition(2, EntryState::Active, 1), Err(MyfsError::NameTaken(_))));
    }

    #[test]
    fn save_load_round_trip() {
        let mut t = FileTable::new();
        t.insert(entry(1, "a.txt", EntryState::Active)).unwrap();
        t.insert(entry(2, "b.txt", EntryState::SoftDeleted)).unwrap();
        let bytes = t.save().unwrap();
        let back = FileTable::load(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.find_by_name("a.txt", false).is_some());
    }

    #[test]
    fn compact_drops_pending_purge_and_packs_locators() {
        let mut t = FileTable::new();
        t.insert(entry(1, "a.txt", EntryState::Active)).unwrap();
        t.insert(entry(2, "b.txt", EntryState::Active)).unwrap();
        t.transition(1, EntryState::PendingPurge, 1).unwrap();
        let plan = t.compact_plan();
        t.apply_compaction(&plan);
        assert_eq!(t.len(), 1);
        let remaining = t.get(2).unwrap();
        assert_eq!(remaining.locator.offset, 0);
    }
}
