// Persistence layer: a key/value backend plus the two repositories that map
// store state onto it. Repositories never fail outward; errors are logged and
// recorded in `PersistStatus` so the in-memory stores stay authoritative.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::modules::debounce::Coalesce;
use crate::modules::model::{Layout, LayoutsDocument};
use crate::settings::{Settings, ThemeMode};

pub const STORE_FILE: &str = "gridcards.json";

pub const KEY_LAYOUTS: &str = "layouts";
pub const KEY_CURRENT_LAYOUT_ID: &str = "currentLayoutId";
pub const KEY_SETTINGS: &str = "settings";

/// Get/set/delete by key, as offered by the host's persisted store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local backend. Used by tests and when no data directory exists.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// All keys in one JSON object file, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Opens `<dir>/gridcards.json`. A missing or unreadable file starts empty.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(STORE_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    log::warn!("[Repository] Failed to parse {:?}: {}, starting empty", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                log::warn!("[Repository] Failed to read {:?}: {}, starting empty", path, e);
                Map::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, entries: &Map<String, Value>) -> Result<()> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(entries)?;

        // Atomic write: tmp + rename, so a crash never leaves half a file.
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.write(&entries)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.write(&entries)?;
        }
        Ok(())
    }
}

/// Outcome of the most recent write, for the UI to surface.
#[derive(Debug, Default)]
pub struct PersistStatus {
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistStatusSnapshot {
    pub last_save_failed: bool,
    pub last_error: Option<String>,
}

impl PersistStatus {
    pub fn record_ok(&self) {
        *self.last_error.lock() = None;
    }

    pub fn record_failure(&self, err: &StoreError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    pub fn last_save_failed(&self) -> bool {
        self.last_error.lock().is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn snapshot(&self) -> PersistStatusSnapshot {
        let last_error = self.last_error();
        PersistStatusSnapshot {
            last_save_failed: last_error.is_some(),
            last_error,
        }
    }
}

/// Fields of the layout document to write. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutPatch {
    pub layouts: Option<Vec<Layout>>,
    pub current_layout_id: Option<String>,
}

impl LayoutPatch {
    pub fn full(doc: &LayoutsDocument) -> Self {
        Self {
            layouts: Some(doc.layouts.clone()),
            current_layout_id: Some(doc.current_layout_id.clone().unwrap_or_default()),
        }
    }

    pub fn layouts(layouts: &[Layout]) -> Self {
        Self {
            layouts: Some(layouts.to_vec()),
            current_layout_id: None,
        }
    }

    pub fn current(id: &str) -> Self {
        Self {
            layouts: None,
            current_layout_id: Some(id.to_string()),
        }
    }
}

impl Coalesce for LayoutPatch {
    fn coalesce(&mut self, newer: Self) {
        if newer.layouts.is_some() {
            self.layouts = newer.layouts;
        }
        if newer.current_layout_id.is_some() {
            self.current_layout_id = newer.current_layout_id;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SettingsPatch {
    pub theme_mode: Option<ThemeMode>,
    pub font_scale: Option<f64>,
}

impl Coalesce for SettingsPatch {
    fn coalesce(&mut self, newer: Self) {
        if newer.theme_mode.is_some() {
            self.theme_mode = newer.theme_mode;
        }
        if newer.font_scale.is_some() {
            self.font_scale = newer.font_scale;
        }
    }
}

fn record(status: &PersistStatus, what: &str, result: Result<()>) {
    match result {
        Ok(()) => status.record_ok(),
        Err(e) => {
            log::warn!("[Repository] Failed to persist {}: {}", what, e);
            status.record_failure(&e);
        }
    }
}

#[derive(Clone)]
pub struct LayoutRepository {
    kv: Arc<dyn KeyValueStore>,
    status: Arc<PersistStatus>,
}

impl LayoutRepository {
    pub fn new(kv: Arc<dyn KeyValueStore>, status: Arc<PersistStatus>) -> Self {
        Self { kv, status }
    }

    /// Persisted layouts, or `None` when there is nothing usable.
    pub fn hydrate(&self) -> Option<LayoutsDocument> {
        let raw = match self.kv.get(KEY_LAYOUTS) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("[Repository] Failed to read layouts: {}", e);
                return None;
            }
        };

        let layouts: Vec<Layout> = match serde_json::from_value(raw) {
            Ok(layouts) => layouts,
            Err(e) => {
                log::warn!("[Repository] Ignoring malformed layouts: {}", e);
                return None;
            }
        };
        if layouts.is_empty() {
            return None;
        }

        let current_layout_id = match self.kv.get(KEY_CURRENT_LAYOUT_ID) {
            Ok(Some(Value::String(id))) if !id.is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                log::warn!("[Repository] Failed to read current layout id: {}", e);
                None
            }
        };

        Some(LayoutsDocument {
            layouts,
            current_layout_id,
        })
    }

    /// Writes only the fields present in `patch`.
    pub fn persist(&self, patch: &LayoutPatch) {
        if let Some(layouts) = &patch.layouts {
            let result = serde_json::to_value(layouts)
                .map_err(StoreError::from)
                .and_then(|value| self.kv.set(KEY_LAYOUTS, value));
            record(&self.status, "layouts", result);
        }
        if let Some(id) = &patch.current_layout_id {
            let result = self.kv.set(KEY_CURRENT_LAYOUT_ID, Value::String(id.clone()));
            record(&self.status, "current layout id", result);
        }
    }
}

#[derive(Clone)]
pub struct SettingsRepository {
    kv: Arc<dyn KeyValueStore>,
    status: Arc<PersistStatus>,
}

impl SettingsRepository {
    pub fn new(kv: Arc<dyn KeyValueStore>, status: Arc<PersistStatus>) -> Self {
        Self { kv, status }
    }

    pub fn hydrate(&self) -> Option<Settings> {
        match self.kv.get(KEY_SETTINGS) {
            Ok(Some(value @ Value::Object(_))) => Some(Settings::normalize(&value)),
            Ok(_) => None,
            Err(e) => {
                log::warn!("[Repository] Failed to read settings: {}", e);
                None
            }
        }
    }

    /// Overlays the present fields onto the stored settings object, keeping
    /// any other keys already there.
    pub fn persist(&self, patch: &SettingsPatch) {
        let result = self.merge_and_write(patch);
        record(&self.status, "settings", result);
    }

    fn merge_and_write(&self, patch: &SettingsPatch) -> Result<()> {
        let mut object = match self.kv.get(KEY_SETTINGS)? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(mode) = patch.theme_mode {
            object.insert("themeMode".to_string(), serde_json::to_value(mode)?);
        }
        if let Some(scale) = patch.font_scale {
            object.insert("fontScale".to_string(), serde_json::to_value(scale)?);
        }
        self.kv.set(KEY_SETTINGS, Value::Object(object))
    }
}
