//! On-disk skill store for stubbed tool descriptions.
//!
//! Layout (under the store dir, usually `~/.anyclaude/tool-skills/`):
//! `cc-tool-<Name>.md` holds the full description; `cc-tool-meta.json` maps
//! tool name → `{hash, last_seen, char_count, version}`. Files are written
//! atomically (write temp, then rename) on background tasks so the request
//! path never waits on disk; readers tolerate missing files.

use crate::fingerprint::short_hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Byte budget for skill text injected into the system prompt.
pub const SKILL_INJECTION_BUDGET: usize = 5 * 1024;

const META_FILE: &str = "cc-tool-meta.json";
const SKILL_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillMetaEntry {
    pub hash: String,
    pub last_seen: String,
    pub char_count: usize,
    pub version: u32,
}

/// The store. Meta is kept in memory and mirrored to disk on every put.
pub struct SkillStore {
    dir: PathBuf,
    meta: Mutex<HashMap<String, SkillMetaEntry>>,
}

impl SkillStore {
    /// Opens the store, loading existing metadata when present. Never fails:
    /// a missing or corrupt meta file starts an empty store.
    pub fn open(dir: PathBuf) -> Self {
        let meta = std::fs::read_to_string(dir.join(META_FILE))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            dir,
            meta: Mutex::new(meta),
        }
    }

    /// Default location: `~/.anyclaude/tool-skills`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".anyclaude").join("tool-skills"))
    }

    /// Persists one skill body off the request path. Falls back to an inline
    /// write when no tokio runtime is running (tests, shutdown paths).
    pub fn put_background(self: &Arc<Self>, name: String, body: String) {
        let store = Arc::clone(self);
        let write = move || {
            if let Err(e) = store.put_blocking(&name, &body) {
                warn!(tool = %name, error = %e, "failed to persist tool skill");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    /// Synchronous put: writes the skill file (if its hash changed) and the
    /// meta sidecar, both atomically.
    pub fn put_blocking(&self, name: &str, body: &str) -> std::io::Result<()> {
        let hash = short_hash(body);
        {
            let meta = self.lock_meta();
            if meta.get(name).map(|e| e.hash.as_str()) == Some(hash.as_str()) {
                // Unchanged body; refresh of last_seen is not worth a write.
                return Ok(());
            }
        }
        std::fs::create_dir_all(&self.dir)?;
        write_atomic(&self.skill_path(name), body.as_bytes())?;

        let snapshot = {
            let mut meta = self.lock_meta();
            meta.insert(
                name.to_string(),
                SkillMetaEntry {
                    hash,
                    last_seen: chrono::Utc::now().to_rfc3339(),
                    char_count: body.chars().count(),
                    version: SKILL_VERSION,
                },
            );
            serde_json::to_string_pretty(&*meta).unwrap_or_default()
        };
        write_atomic(&self.dir.join(META_FILE), snapshot.as_bytes())?;
        debug!(tool = %name, "persisted tool skill");
        Ok(())
    }

    /// Reads one skill body; missing files are simply `None`.
    pub fn get(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.skill_path(name)).ok()
    }

    /// Looks up a tool name by its content hash.
    pub fn by_hash(&self, hash: &str) -> Option<String> {
        self.lock_meta()
            .iter()
            .find(|(_, entry)| entry.hash == hash)
            .map(|(name, _)| name.clone())
    }

    /// Selects skill sections for re-injection: tools called in the previous
    /// turn first, then keyword-triggered ones, until the 5 KB budget.
    pub fn select(&self, previous_tool_names: &[String], latest_user_text: &str) -> Option<String> {
        let mut known: Vec<String> = {
            let meta = self.lock_meta();
            meta.keys().cloned().collect()
        };
        if known.is_empty() {
            return None;
        }
        known.sort();
        let user_lowered = latest_user_text.to_lowercase();

        let mut chosen: Vec<String> = Vec::new();
        for name in &known {
            if previous_tool_names.iter().any(|p| p == name) {
                chosen.push(name.clone());
            }
        }
        for name in &known {
            if chosen.contains(name) {
                continue;
            }
            if keyword_triggered(name, &user_lowered) {
                chosen.push(name.clone());
            }
        }
        if chosen.is_empty() {
            return None;
        }

        let mut out = String::new();
        for name in chosen {
            let Some(body) = self.get(&name) else {
                continue;
            };
            let section = format!("\n## Skill: {name}\n{body}\n");
            if out.len() + section.len() > SKILL_INJECTION_BUDGET {
                continue;
            }
            out.push_str(&section);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn skill_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("cc-tool-{name}.md"))
    }

    fn lock_meta(&self) -> std::sync::MutexGuard<'_, HashMap<String, SkillMetaEntry>> {
        match self.meta.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A tool name triggers on keywords: any `_`-separated part longer than 3
/// chars appearing in the user text.
fn keyword_triggered(name: &str, user_lowered: &str) -> bool {
    name.to_lowercase()
        .split('_')
        .filter(|part| part.len() > 3)
        .any(|part| user_lowered.contains(part))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SkillStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SkillStore::open(dir.path().to_path_buf());
        (dir, store)
    }

    /// **Scenario**: put persists the body and the meta sidecar; a reopened
    /// store sees both.
    #[test]
    fn put_get_and_reload() {
        let (dir, store) = store();
        store.put_blocking("fs_read", "Reads files.").unwrap();
        assert_eq!(store.get("fs_read").as_deref(), Some("Reads files."));

        let reopened = SkillStore::open(dir.path().to_path_buf());
        assert_eq!(reopened.get("fs_read").as_deref(), Some("Reads files."));
        let hash = short_hash("Reads files.");
        assert_eq!(reopened.by_hash(&hash).as_deref(), Some("fs_read"));
    }

    /// **Scenario**: unchanged bodies skip the rewrite (hash check).
    #[test]
    fn unchanged_body_is_a_no_op() {
        let (dir, store) = store();
        store.put_blocking("t", "body").unwrap();
        let meta_path = dir.path().join(META_FILE);
        let before = std::fs::read_to_string(&meta_path).unwrap();
        store.put_blocking("t", "body").unwrap();
        let after = std::fs::read_to_string(&meta_path).unwrap();
        assert_eq!(before, after);
    }

    /// **Scenario**: selection prefers previous-turn tools, honors keyword
    /// triggers, and stays under the 5 KB budget.
    #[test]
    fn selection_rules_and_budget() {
        let (_dir, store) = store();
        store.put_blocking("fs_read", "How to read.").unwrap();
        store.put_blocking("web_fetch", "How to fetch.").unwrap();

        // previous-turn tool wins even with no keyword match
        let injected = store.select(&["fs_read".to_string()], "unrelated").unwrap();
        assert!(injected.contains("## Skill: fs_read"));
        assert!(!injected.contains("web_fetch"));

        // keyword trigger: "fetch" appears in the user text
        let injected = store.select(&[], "please fetch that page").unwrap();
        assert!(injected.contains("## Skill: web_fetch"));

        // nothing relevant → no injection
        assert!(store.select(&[], "hello").is_none());

        // budget: a giant skill body does not fit
        store
            .put_blocking("huge_tool", &"x".repeat(SKILL_INJECTION_BUDGET))
            .unwrap();
        let injected = store.select(&["huge_tool".to_string(), "fs_read".to_string()], "");
        // huge is skipped, fs_read still fits
        let text = injected.unwrap();
        assert!(!text.contains("huge_tool"));
        assert!(text.contains("fs_read"));
    }

    /// **Scenario**: readers tolerate missing files.
    #[test]
    fn missing_files_are_none() {
        let (_dir, store) = store();
        assert!(store.get("ghost").is_none());
        assert!(store.by_hash("feedfeedfeed").is_none());
    }
}
