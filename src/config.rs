use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::gui::HotkeyMode;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    Bool(bool),
    Float(f32),
    Color([u8; 4]),
    Bits(u64),
    Index(u32),
    Text(String),
}

impl ConfigValue {
    fn same_kind(&self, other: &ConfigValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    Host,
    Script,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfigEntry {
    pub value: ConfigValue,
    pub origin: EntryOrigin,
}

/// A key the user bound to a control. Applied whenever a control with this
/// id is created, so bindings survive script reloads.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HotkeyBinding {
    pub control: u64,
    pub key: u32,
    pub mode: HotkeyMode,
}

#[derive(Serialize, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    entries: HashMap<u64, ConfigEntry>,
    #[serde(default)]
    autoload: Vec<u32>,
    #[serde(default)]
    allow_insecure: bool,
    #[serde(default)]
    hotkeys: Vec<HotkeyBinding>,
}

/// Persistent keyed configuration, addressed by the same hashed ids as GUI controls.
#[derive(Default)]
pub struct ConfigStore {
    entries: HashMap<u64, ConfigEntry>,
    pub autoload: Vec<u32>,
    pub allow_insecure: bool,
    pub hotkeys: Vec<HotkeyBinding>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn open(path: &Path) -> Result<Self, String> {
        let mut store = ConfigStore {
            path: Some(path.to_path_buf()),
            ..Default::default()
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let file: ConfigFile = serde_json::from_str(&contents)
                    .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
                store.entries = file.entries;
                store.autoload = file.autoload;
                store.allow_insecure = file.allow_insecure;
                store.hotkeys = file.hotkeys;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("Failed to read {}: {e}", path.display())),
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let file = ConfigFile {
            entries: self.entries.clone(),
            autoload: self.autoload.clone(),
            allow_insecure: self.allow_insecure,
            hotkeys: self.hotkeys.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| e.to_string())?;
        std::fs::write(path, json).map_err(|e| e.to_string())
    }

    #[cfg(test)]
    pub fn define_host(&mut self, id: u64, value: ConfigValue) {
        self.entries.insert(
            id,
            ConfigEntry {
                value,
                origin: EntryOrigin::Host,
            },
        );
    }

    /// Registers a script-owned entry. A value persisted by an earlier run of
    /// the same control survives if it has the same kind.
    pub fn register(&mut self, id: u64, value: ConfigValue) -> Result<(), String> {
        match self.entries.get(&id) {
            Some(entry) if entry.origin == EntryOrigin::Host => {
                Err("config entry ID is already in use internally".to_string())
            }
            Some(entry) if entry.value.same_kind(&value) => Ok(()),
            _ => {
                self.entries.insert(
                    id,
                    ConfigEntry {
                        value,
                        origin: EntryOrigin::Script,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&ConfigValue> {
        self.entries.get(&id).map(|entry| &entry.value)
    }

    pub fn set(&mut self, id: u64, value: ConfigValue) -> Result<(), String> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| format!("config entry {id:#x} does not exist"))?;
        if !entry.value.same_kind(&value) {
            return Err(format!("config entry {id:#x} holds a different type"));
        }
        entry.value = value;
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn hotkey_for(&self, control: u64) -> Option<HotkeyBinding> {
        self.hotkeys.iter().copied().find(|h| h.control == control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_entries_cannot_be_claimed_by_scripts() {
        let mut store = ConfigStore::default();
        store.define_host(7, ConfigValue::Bool(true));
        let err = store
            .register(7, ConfigValue::Bool(false))
            .expect_err("host entry should be protected");
        assert_eq!(err, "config entry ID is already in use internally");
        assert_eq!(store.get(7), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn script_entries_keep_persisted_value_of_same_kind() {
        let mut store = ConfigStore::default();
        store.register(9, ConfigValue::Float(0.5)).expect("register");
        store.set(9, ConfigValue::Float(2.0)).expect("set");
        store.register(9, ConfigValue::Float(0.5)).expect("register again");
        assert_eq!(store.get(9), Some(&ConfigValue::Float(2.0)));
        store.register(9, ConfigValue::Bool(true)).expect("kind change");
        assert_eq!(store.get(9), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn persists_entries_and_autoload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut store = ConfigStore::open(&path).expect("open empty");
        store.register(1, ConfigValue::Color([1, 2, 3, 4])).expect("register");
        store.autoload = vec![10, 20];
        store.allow_insecure = true;
        store.hotkeys.push(HotkeyBinding {
            control: 1,
            key: 0x46,
            mode: HotkeyMode::Hold,
        });
        store.save().expect("save");

        let reopened = ConfigStore::open(&path).expect("reopen");
        assert_eq!(reopened.get(1), Some(&ConfigValue::Color([1, 2, 3, 4])));
        assert_eq!(reopened.autoload, vec![10, 20]);
        assert!(reopened.allow_insecure);
        assert_eq!(reopened.hotkey_for(1).map(|h| h.key), Some(0x46));
        assert_eq!(reopened.hotkey_for(2), None);
    }
}
