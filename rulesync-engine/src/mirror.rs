//! Local mirror of rule intent
//!
//! The mirror is the synchronous, enumerable record of which rules the
//! caller intends to exist. The remote store cannot be read, so every
//! "what rules are there" question is answered from here.

use rulesync_api::{Rule, RuleKey, Setting, MIRROR_FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Error type for mirror operations
///
/// A mirror error means the local medium itself failed. The engine treats
/// it as fatal for the operation and never retries it.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Failed to access mirror file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse mirror file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported mirror format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Trait for the local rule mirror
///
/// Reads never fail: implementations keep the full rule set in memory.
/// Writes report failures of a durable medium, if there is one.
pub trait Mirror: Send + Sync {
    /// Insert or overwrite a rule
    fn put(&self, scope: &str, pattern: &str, setting: Setting) -> Result<(), MirrorError>;

    /// Remove a rule, returning its previous setting (no-op if absent)
    fn remove(&self, scope: &str, pattern: &str) -> Result<Option<Setting>, MirrorError>;

    /// Look up the setting for a rule
    fn get(&self, scope: &str, pattern: &str) -> Option<Setting>;

    /// All rules in a scope, in insertion order
    fn get_all(&self, scope: &str) -> Vec<Rule>;

    /// All rules across every scope, in insertion order
    fn get_all_scopes_and_rules(&self) -> Vec<Rule>;

    /// Scopes holding at least one rule, in first-insertion order
    fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = Vec::new();
        for rule in self.get_all_scopes_and_rules() {
            if !scopes.contains(&rule.scope) {
                scopes.push(rule.scope);
            }
        }
        scopes
    }
}

// ============================================================================
// Ordered rule table
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Slot {
    setting: Setting,
    seq: u64,
}

/// Keyed rule table that remembers insertion order.
///
/// Overwriting a key keeps its original position.
#[derive(Debug, Default)]
struct RuleTable {
    slots: HashMap<RuleKey, Slot>,
    next_seq: u64,
}

impl RuleTable {
    fn from_rules(rules: Vec<Rule>) -> Self {
        let mut table = Self::default();
        for rule in rules {
            table.put(RuleKey::new(rule.scope, rule.pattern), rule.setting);
        }
        table
    }

    fn put(&mut self, key: RuleKey, setting: Setting) {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.setting = setting;
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(key, Slot { setting, seq });
    }

    fn remove(&mut self, scope: &str, pattern: &str) -> Option<Setting> {
        self.slots
            .remove(&RuleKey::new(scope, pattern))
            .map(|slot| slot.setting)
    }

    fn get(&self, scope: &str, pattern: &str) -> Option<Setting> {
        self.slots
            .get(&RuleKey::new(scope, pattern))
            .map(|slot| slot.setting)
    }

    fn ordered(&self, scope: Option<&str>) -> Vec<Rule> {
        let mut entries: Vec<(&RuleKey, &Slot)> = self
            .slots
            .iter()
            .filter(|(key, _)| scope.map_or(true, |s| key.scope == s))
            .collect();
        entries.sort_by_key(|(_, slot)| slot.seq);
        entries
            .into_iter()
            .map(|(key, slot)| Rule::new(key.scope.clone(), key.pattern.clone(), slot.setting))
            .collect()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

fn read_table(lock: &RwLock<RuleTable>) -> RwLockReadGuard<'_, RuleTable> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_table(lock: &RwLock<RuleTable>) -> RwLockWriteGuard<'_, RuleTable> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-Memory Mirror
// ============================================================================

/// In-memory mirror for tests or session-only rules
pub struct MemoryMirror {
    table: RwLock<RuleTable>,
}

impl MemoryMirror {
    /// Create an empty mirror
    pub fn new() -> Self {
        Self {
            table: RwLock::new(RuleTable::default()),
        }
    }

    /// Create a mirror pre-populated with rules (later duplicates overwrite)
    pub fn with_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            table: RwLock::new(RuleTable::from_rules(rules.into_iter().collect())),
        }
    }

    /// Number of rules across all scopes
    pub fn len(&self) -> usize {
        read_table(&self.table).len()
    }

    /// Check if the mirror holds no rules
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl Mirror for MemoryMirror {
    fn put(&self, scope: &str, pattern: &str, setting: Setting) -> Result<(), MirrorError> {
        write_table(&self.table).put(RuleKey::new(scope, pattern), setting);
        Ok(())
    }

    fn remove(&self, scope: &str, pattern: &str) -> Result<Option<Setting>, MirrorError> {
        Ok(write_table(&self.table).remove(scope, pattern))
    }

    fn get(&self, scope: &str, pattern: &str) -> Option<Setting> {
        read_table(&self.table).get(scope, pattern)
    }

    fn get_all(&self, scope: &str) -> Vec<Rule> {
        read_table(&self.table).ordered(Some(scope))
    }

    fn get_all_scopes_and_rules(&self) -> Vec<Rule> {
        read_table(&self.table).ordered(None)
    }
}

impl std::fmt::Debug for MemoryMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMirror")
            .field("count", &self.len())
            .finish()
    }
}

// ============================================================================
// File-backed Mirror
// ============================================================================

/// Persistent file data structure
#[derive(Debug, Serialize, Deserialize)]
struct MirrorFileData {
    version: u32,
    rules: Vec<Rule>,
}

/// File-backed mirror
///
/// Keeps the rule table in memory and rewrites a JSON file after every
/// mutation. Rules are stored as an ordered list so insertion order
/// survives a reload.
/// Default: `~/.config/<app>/rules.json`
pub struct FileMirror {
    path: PathBuf,
    table: RwLock<RuleTable>,
}

impl FileMirror {
    /// Open the mirror at the given path, creating an empty one if missing
    pub fn new(path: impl AsRef<Path>) -> Result<Self, MirrorError> {
        let path = path.as_ref().to_path_buf();

        let table = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let data: MirrorFileData = serde_json::from_reader(reader)?;
            if data.version != MIRROR_FORMAT_VERSION {
                return Err(MirrorError::UnsupportedVersion {
                    found: data.version,
                    expected: MIRROR_FORMAT_VERSION,
                });
            }
            RuleTable::from_rules(data.rules)
        } else {
            RuleTable::default()
        };

        tracing::debug!(path = %path.display(), rules = table.len(), "Mirror opened");
        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    /// Open the mirror in the default location for an application
    pub fn default_for_app(app_name: &str) -> Result<Self, MirrorError> {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        Self::new(config_dir.join(app_name).join("rules.json"))
    }

    /// Get the mirror file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, table: &RuleTable) -> Result<(), MirrorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = MirrorFileData {
            version: MIRROR_FORMAT_VERSION,
            rules: table.ordered(None),
        };
        let mut writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(&mut writer, &data)?;
        writer.flush()?;
        Ok(())
    }
}

impl Mirror for FileMirror {
    fn put(&self, scope: &str, pattern: &str, setting: Setting) -> Result<(), MirrorError> {
        let mut table = write_table(&self.table);
        table.put(RuleKey::new(scope, pattern), setting);
        self.save(&table)
    }

    fn remove(&self, scope: &str, pattern: &str) -> Result<Option<Setting>, MirrorError> {
        let mut table = write_table(&self.table);
        let previous = table.remove(scope, pattern);
        if previous.is_some() {
            self.save(&table)?;
        }
        Ok(previous)
    }

    fn get(&self, scope: &str, pattern: &str) -> Option<Setting> {
        read_table(&self.table).get(scope, pattern)
    }

    fn get_all(&self, scope: &str) -> Vec<Rule> {
        read_table(&self.table).ordered(Some(scope))
    }

    fn get_all_scopes_and_rules(&self) -> Vec<Rule> {
        read_table(&self.table).ordered(None)
    }
}

impl std::fmt::Debug for FileMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMirror")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_mirror_reports_unwritten_save() {
        // Writes to /dev/full only fail once the buffer is flushed
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let mirror = FileMirror {
            path: full.to_path_buf(),
            table: RwLock::new(RuleTable::default()),
        };

        let err = mirror.put("flash", "p1", Setting::Allow).unwrap_err();
        assert!(matches!(err, MirrorError::Io(_)));
    }

    #[test]
    fn test_memory_mirror() {
        let mirror = MemoryMirror::new();
        mirror.put("flash", "*.example.com/*", Setting::Allow).unwrap();

        assert_eq!(mirror.get("flash", "*.example.com/*"), Some(Setting::Allow));
        assert_eq!(mirror.get("java", "*.example.com/*"), None);

        assert_eq!(
            mirror.remove("flash", "*.example.com/*").unwrap(),
            Some(Setting::Allow)
        );
        assert!(mirror.get("flash", "*.example.com/*").is_none());

        // Removing again is a no-op
        assert_eq!(mirror.remove("flash", "*.example.com/*").unwrap(), None);
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_insertion_order_is_stable() {
        let mirror = MemoryMirror::new();
        mirror.put("flash", "c", Setting::Allow).unwrap();
        mirror.put("java", "x", Setting::Block).unwrap();
        mirror.put("flash", "a", Setting::Block).unwrap();
        mirror.put("flash", "b", Setting::Ask).unwrap();

        // Overwrite keeps position
        mirror.put("flash", "c", Setting::Block).unwrap();

        let patterns: Vec<_> = mirror
            .get_all("flash")
            .into_iter()
            .map(|r| r.pattern)
            .collect();
        assert_eq!(patterns, vec!["c", "a", "b"]);
        assert_eq!(mirror.get("flash", "c"), Some(Setting::Block));

        let all = mirror.get_all_scopes_and_rules();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1], Rule::block("java", "x"));
        assert_eq!(mirror.scopes(), vec!["flash", "java"]);
    }

    #[test]
    fn test_with_rules() {
        let mirror = MemoryMirror::with_rules([Rule::allow("flash", "p1"), Rule::block("flash", "p2")]);
        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.get_all("flash")[0], Rule::allow("flash", "p1"));
    }

    #[test]
    fn test_file_mirror_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rules.json");

        let mirror = FileMirror::new(&path).unwrap();
        mirror.put("flash", "*.Example.COM/*", Setting::Allow).unwrap();
        mirror.put("flash", " spaced pattern ", Setting::Ask).unwrap();
        mirror.put("java", "[*.]exämple.org", Setting::Block).unwrap();
        mirror.put("flash", "z", Setting::Allow).unwrap();
        mirror.remove("flash", "z").unwrap();

        assert!(path.exists());

        let reopened = FileMirror::new(&path).unwrap();
        assert_eq!(
            reopened.get_all_scopes_and_rules(),
            vec![
                Rule::allow("flash", "*.Example.COM/*"),
                Rule::ask("flash", " spaced pattern "),
                Rule::block("java", "[*.]exämple.org"),
            ]
        );
    }

    #[test]
    fn test_file_mirror_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"version": 99, "rules": []}"#).unwrap();

        assert!(matches!(
            FileMirror::new(&path),
            Err(MirrorError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_file_mirror_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(FileMirror::new(&path), Err(MirrorError::Parse(_))));
    }
}
