use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

/// Entity kinds whose legacy → target id correspondences outlive a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MappingKind {
    Organisations,
    Users,
    Clients,
    Opportunities,
}

impl MappingKind {
    pub const ALL: [MappingKind; 4] = [
        MappingKind::Organisations,
        MappingKind::Users,
        MappingKind::Clients,
        MappingKind::Opportunities,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MappingKind::Organisations => "organisations",
            MappingKind::Users => "users",
            MappingKind::Clients => "clients",
            MappingKind::Opportunities => "opportunities",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}_mapping.json", self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub old_id: i64,
    pub new_id: String,
    /// Denormalised fields later steps read instead of re-parsing dumps.
    #[serde(flatten)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl MappingEntry {
    pub fn new(old_id: i64, new_id: impl Into<String>) -> Self {
        Self {
            old_id,
            new_id: new_id.into(),
            context: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.context.insert(key.to_string(), value);
        }
        self
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }

    pub fn context_f64(&self, key: &str) -> Option<f64> {
        self.context.get(key).and_then(|v| v.as_f64())
    }
}

pub trait MappingStore {
    /// Full list for `kind`; empty when nothing was ever saved.
    fn load(&self, kind: MappingKind) -> anyhow::Result<Vec<MappingEntry>>;
    /// Replaces the whole list for `kind`.
    fn save(&self, kind: MappingKind, entries: &[MappingEntry]) -> anyhow::Result<()>;
    fn exists(&self, kind: MappingKind) -> anyhow::Result<bool>;
    fn remove(&self, kind: MappingKind) -> anyhow::Result<()>;
}

pub struct FileMappingStore {
    dir: PathBuf,
}

impl FileMappingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: MappingKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }
}

impl MappingStore for FileMappingStore {
    fn load(&self, kind: MappingKind) -> anyhow::Result<Vec<MappingEntry>> {
        let path = self.path(kind);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read mapping file {}", path.to_string_lossy()))?;
        let entries: Vec<MappingEntry> = serde_json::from_str(&text)
            .with_context(|| format!("mapping file {} is invalid JSON", path.to_string_lossy()))?;
        Ok(entries)
    }

    fn save(&self, kind: MappingKind, entries: &[MappingEntry]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create directory {}", self.dir.to_string_lossy())
        })?;
        let dst = self.path(kind);
        let tmp = dst.with_extension("json.saving");

        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.to_string_lossy()))?;
        f.write_all(
            serde_json::to_string_pretty(entries)
                .context("failed to serialize mapping entries")?
                .as_bytes(),
        )
        .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
        f.flush().context("failed to flush mapping file")?;
        drop(f);

        std::fs::rename(&tmp, &dst).with_context(|| {
            format!("failed to move mapping file to {}", dst.to_string_lossy())
        })?;
        Ok(())
    }

    fn exists(&self, kind: MappingKind) -> anyhow::Result<bool> {
        Ok(self.path(kind).is_file())
    }

    fn remove(&self, kind: MappingKind) -> anyhow::Result<()> {
        let path = self.path(kind);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.to_string_lossy()))?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMappingStore {
    lists: RefCell<HashMap<MappingKind, Vec<MappingEntry>>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for MemoryMappingStore {
    fn load(&self, kind: MappingKind) -> anyhow::Result<Vec<MappingEntry>> {
        Ok(self.lists.borrow().get(&kind).cloned().unwrap_or_default())
    }

    fn save(&self, kind: MappingKind, entries: &[MappingEntry]) -> anyhow::Result<()> {
        self.lists.borrow_mut().insert(kind, entries.to_vec());
        Ok(())
    }

    fn exists(&self, kind: MappingKind) -> anyhow::Result<bool> {
        Ok(self.lists.borrow().contains_key(&kind))
    }

    fn remove(&self, kind: MappingKind) -> anyhow::Result<()> {
        self.lists.borrow_mut().remove(&kind);
        Ok(())
    }
}

/// In-memory accumulator for one kind during a step. Keeps the first entry
/// recorded for each `old_id`.
pub struct IdMapping {
    kind: MappingKind,
    entries: Vec<MappingEntry>,
    by_old_id: HashMap<i64, usize>,
}

impl IdMapping {
    pub fn new(kind: MappingKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            by_old_id: HashMap::new(),
        }
    }

    pub fn load(store: &(impl MappingStore + ?Sized), kind: MappingKind) -> anyhow::Result<Self> {
        let mut out = Self::new(kind);
        for e in store.load(kind)? {
            out.record(e);
        }
        Ok(out)
    }

    pub fn get(&self, old_id: i64) -> Option<&MappingEntry> {
        self.by_old_id.get(&old_id).map(|&i| &self.entries[i])
    }

    pub fn new_id(&self, old_id: i64) -> Option<&str> {
        self.get(old_id).map(|e| e.new_id.as_str())
    }

    /// Returns false when `old_id` already had an entry.
    pub fn record(&mut self, entry: MappingEntry) -> bool {
        if self.by_old_id.contains_key(&entry.old_id) {
            return false;
        }
        self.by_old_id.insert(entry.old_id, self.entries.len());
        self.entries.push(entry);
        true
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, store: &(impl MappingStore + ?Sized)) -> anyhow::Result<()> {
        store.save(self.kind, &self.entries)
    }
}
