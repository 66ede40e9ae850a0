//! Role storage
//!
//! Personas the assistant can switch between: a name, a system prompt, and
//! an optional TTS voice. Persisted as a JSON file (`data/roles.json`);
//! not on the audio hot path. The dialogue engine reads the default role at
//! session start and the `change_role` intent swaps roles mid-conversation.

pub mod api;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub is_default: bool,
}

/// On-disk layout. Two historical formats are accepted on read: a flat
/// `{role_id: role}` map, and `{roles: {...}, default_role_id: ...}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RoleFile {
    #[serde(default)]
    roles: HashMap<String, Role>,
    #[serde(default)]
    default_role_id: Option<String>,
}

pub struct RoleStore {
    path: PathBuf,
    inner: Mutex<RoleFile>,
}

impl RoleStore {
    /// Load the store, seeding a default role when the file is absent
    pub fn load(path: &Path, default_prompt: &str, default_voice: &str) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                warn!("unreadable role file {}: {e}, reinitialising", path.display());
                Self::seed(default_prompt, default_voice)
            }),
            Err(_) => Self::seed(default_prompt, default_voice),
        };
        info!("loaded {} roles from {}", data.roles.len(), path.display());
        let store = Self { path: path.to_path_buf(), inner: Mutex::new(data) };
        store.save();
        store
    }

    fn parse(contents: &str) -> Result<RoleFile, serde_json::Error> {
        // nested format first, flat map as fallback
        if let Ok(file) = serde_json::from_str::<RoleFile>(contents) {
            if !file.roles.is_empty() {
                return Ok(file);
            }
        }
        let flat: HashMap<String, Role> = serde_json::from_str(contents)?;
        let default_role_id = flat
            .iter()
            .find(|(_, role)| role.is_default)
            .map(|(id, _)| id.clone());
        Ok(RoleFile { roles: flat, default_role_id })
    }

    fn seed(default_prompt: &str, default_voice: &str) -> RoleFile {
        let mut roles = HashMap::new();
        roles.insert(
            "default".to_string(),
            Role {
                name: "默认角色".to_string(),
                description: "default assistant persona".to_string(),
                prompt: default_prompt.to_string(),
                voice: default_voice.to_string(),
                is_default: true,
            },
        );
        RoleFile { roles, default_role_id: Some("default".to_string()) }
    }

    fn save(&self) {
        let data = self.inner.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&*data) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("failed to persist roles to {}: {e}", self.path.display());
                }
            }
            Err(e) => warn!("failed to serialise roles: {e}"),
        }
    }

    pub fn all(&self) -> HashMap<String, Role> {
        self.inner.lock().unwrap().roles.clone()
    }

    pub fn get(&self, id: &str) -> Option<Role> {
        self.inner.lock().unwrap().roles.get(id).cloned()
    }

    /// Look a role up by display name (the form intents use)
    pub fn get_by_name(&self, name: &str) -> Option<(String, Role)> {
        let data = self.inner.lock().unwrap();
        data.roles
            .iter()
            .find(|(_, role)| role.name == name)
            .map(|(id, role)| (id.clone(), role.clone()))
    }

    /// Insert a new role. Returns false when the id already exists.
    pub fn add(&self, id: &str, role: Role) -> bool {
        {
            let mut data = self.inner.lock().unwrap();
            if data.roles.contains_key(id) {
                return false;
            }
            data.roles.insert(id.to_string(), role);
        }
        self.save();
        true
    }

    /// Update an existing role. Returns the updated role, or None.
    pub fn update(&self, id: &str, role: Role) -> Option<Role> {
        let updated = {
            let mut data = self.inner.lock().unwrap();
            if !data.roles.contains_key(id) {
                return None;
            }
            data.roles.insert(id.to_string(), role.clone());
            role
        };
        self.save();
        Some(updated)
    }

    /// Delete a role. The default role cannot be deleted.
    pub fn delete(&self, id: &str) -> bool {
        let removed = {
            let mut data = self.inner.lock().unwrap();
            if data.default_role_id.as_deref() == Some(id) {
                return false;
            }
            data.roles.remove(id).is_some()
        };
        if removed {
            self.save();
        }
        removed
    }

    pub fn set_default(&self, id: &str) -> bool {
        let changed = {
            let mut data = self.inner.lock().unwrap();
            if !data.roles.contains_key(id) {
                return false;
            }
            data.default_role_id = Some(id.to_string());
            for (role_id, role) in data.roles.iter_mut() {
                role.is_default = role_id == id;
            }
            true
        };
        if changed {
            self.save();
        }
        changed
    }

    pub fn default_role(&self) -> Option<(String, Role)> {
        let data = self.inner.lock().unwrap();
        let id = data.default_role_id.clone()?;
        let role = data.roles.get(&id).cloned()?;
        Some((id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> RoleStore {
        RoleStore::load(&dir.path().join("roles.json"), "be helpful", "voice-a")
    }

    #[test]
    fn test_seeds_default_role() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let (id, role) = store.default_role().unwrap();
        assert_eq!(id, "default");
        assert_eq!(role.prompt, "be helpful");
        assert!(role.is_default);
    }

    #[test]
    fn test_crud_round_trip() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let teacher = Role {
            name: "英语老师".to_string(),
            description: "english teacher".to_string(),
            prompt: "teach english".to_string(),
            voice: "voice-b".to_string(),
            is_default: false,
        };
        assert!(store.add("teacher", teacher.clone()));
        assert!(!store.add("teacher", teacher.clone()), "duplicate id must be rejected");

        let (id, found) = store.get_by_name("英语老师").unwrap();
        assert_eq!(id, "teacher");
        assert_eq!(found.prompt, "teach english");

        let mut updated = teacher.clone();
        updated.prompt = "teach english slowly".to_string();
        store.update("teacher", updated).unwrap();
        assert_eq!(store.get("teacher").unwrap().prompt, "teach english slowly");

        assert!(store.delete("teacher"));
        assert!(store.get("teacher").is_none());
    }

    #[test]
    fn test_default_role_cannot_be_deleted() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.delete("default"));
    }

    #[test]
    fn test_set_default_moves_flag() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.add(
            "other",
            Role {
                name: "other".to_string(),
                description: String::new(),
                prompt: "p".to_string(),
                voice: String::new(),
                is_default: false,
            },
        );
        assert!(store.set_default("other"));
        let (id, _) = store.default_role().unwrap();
        assert_eq!(id, "other");
        assert!(!store.get("default").unwrap().is_default);
        assert!(store.get("other").unwrap().is_default);
    }

    #[test]
    fn test_reload_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roles.json");
        {
            let store = RoleStore::load(&path, "be helpful", "voice-a");
            store.add(
                "pirate",
                Role {
                    name: "pirate".to_string(),
                    description: String::new(),
                    prompt: "arr".to_string(),
                    voice: String::new(),
                    is_default: false,
                },
            );
        }
        let reloaded = RoleStore::load(&path, "ignored", "ignored");
        assert_eq!(reloaded.get("pirate").unwrap().prompt, "arr");
        assert_eq!(reloaded.default_role().unwrap().0, "default");
    }

    #[test]
    fn test_parse_flat_format() {
        let flat = r#"{"r1": {"name": "n", "prompt": "p", "is_default": true}}"#;
        let parsed = RoleStore::parse(flat).unwrap();
        assert_eq!(parsed.default_role_id.as_deref(), Some("r1"));
    }
}
