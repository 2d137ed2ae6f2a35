use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::modules::debounce::Debouncer;
use crate::modules::repository::{SettingsPatch, SettingsRepository};
use crate::modules::theme::{AppearanceSink, SystemThemeSignal, ThemeApplier};
use crate::modules::validation::normalize_font_scale;

/// Idle window before settings changes are written.
pub const SETTINGS_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub theme_mode: ThemeMode,
    pub font_scale: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme_mode: ThemeMode::System,
            font_scale: 1.0,
        }
    }
}

impl Settings {
    /// Reads whatever is stored under `settings`, replacing unknown theme
    /// names and non-positive scales with defaults.
    pub fn normalize(value: &Value) -> Self {
        let theme_mode = value
            .get("themeMode")
            .and_then(|v| serde_json::from_value::<ThemeMode>(v.clone()).ok())
            .unwrap_or_default();

        let font_scale = match value.get("fontScale") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(1.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(1.0),
            _ => 1.0,
        };

        Self {
            theme_mode,
            font_scale: normalize_font_scale(font_scale),
        }
    }
}

struct SettingsState {
    current: Settings,
    // Fields the user changed before hydration; hydration keeps these.
    touched_before_hydrate: Option<SettingsPatch>,
}

/// Theme mode and font scale, applied immediately and persisted debounced.
pub struct SettingsStore {
    state: Mutex<SettingsState>,
    applier: ThemeApplier,
    repo: SettingsRepository,
    debouncer: Debouncer<SettingsPatch>,
}

impl SettingsStore {
    pub fn new(
        runtime: Handle,
        repo: SettingsRepository,
        sink: Arc<dyn AppearanceSink>,
        signal: Arc<SystemThemeSignal>,
    ) -> Self {
        let writer_repo = repo.clone();
        let store = Self {
            state: Mutex::new(SettingsState {
                current: Settings::default(),
                touched_before_hydrate: Some(SettingsPatch::default()),
            }),
            applier: ThemeApplier::new(sink, signal),
            repo,
            debouncer: Debouncer::new(runtime, SETTINGS_DEBOUNCE, move |patch: SettingsPatch| {
                writer_repo.persist(&patch)
            }),
        };

        // Defaults go on screen right away so there is no flash before hydration.
        let defaults = Settings::default();
        store.applier.apply_theme(defaults.theme_mode);
        store.applier.apply_font_scale(defaults.font_scale);
        store
    }

    pub fn snapshot(&self) -> Settings {
        self.state.lock().current
    }

    pub fn is_following_system(&self) -> bool {
        self.applier.is_following_system()
    }

    /// Returns whether anything changed.
    pub fn set_theme_mode(&self, mode: ThemeMode) -> bool {
        let mut state = self.state.lock();
        if state.current.theme_mode == mode {
            return false;
        }
        state.current.theme_mode = mode;
        if let Some(touched) = state.touched_before_hydrate.as_mut() {
            touched.theme_mode = Some(mode);
        }

        // Applied and scheduled under the state lock so the screen and the
        // pending write never lag behind a concurrent change.
        log::debug!("[Settings] Theme mode -> {:?}", mode);
        self.applier.apply_theme(mode);
        self.debouncer.schedule(SettingsPatch {
            theme_mode: Some(mode),
            font_scale: None,
        });
        true
    }

    /// Returns whether anything changed. Invalid scales become 1.0.
    pub fn set_font_scale(&self, scale: f64) -> bool {
        let scale = normalize_font_scale(scale);
        let mut state = self.state.lock();
        if state.current.font_scale == scale {
            return false;
        }
        state.current.font_scale = scale;
        if let Some(touched) = state.touched_before_hydrate.as_mut() {
            touched.font_scale = Some(scale);
        }

        log::debug!("[Settings] Font scale -> {}", scale);
        self.applier.apply_font_scale(scale);
        self.debouncer.schedule(SettingsPatch {
            theme_mode: None,
            font_scale: Some(scale),
        });
        true
    }

    /// Loads persisted settings once. Values the user already changed in
    /// this session win over the stored ones.
    pub fn hydrate(&self) -> Settings {
        let loaded = self.repo.hydrate();

        let mut state = self.state.lock();
        let Some(touched) = state.touched_before_hydrate.take() else {
            return state.current;
        };
        if let Some(mut loaded) = loaded {
            if let Some(mode) = touched.theme_mode {
                loaded.theme_mode = mode;
            }
            if let Some(scale) = touched.font_scale {
                loaded.font_scale = scale;
            }
            state.current = loaded;
        }
        let settings = state.current;

        log::info!(
            "[Settings] Hydrated: theme={:?}, font scale={}",
            settings.theme_mode,
            settings.font_scale
        );
        self.applier.apply_theme(settings.theme_mode);
        self.applier.apply_font_scale(settings.font_scale);
        settings
    }

    pub fn is_hydrated(&self) -> bool {
        self.state.lock().touched_before_hydrate.is_none()
    }

    /// Writes any pending change now. Called on shutdown.
    pub fn flush(&self) -> bool {
        self.debouncer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::repository::{KeyValueStore, MemoryStore, PersistStatus, KEY_SETTINGS};
    use crate::modules::theme::tests::{Applied, RecordingAppearance};
    use serde_json::json;

    struct Fixture {
        store: SettingsStore,
        kv: Arc<MemoryStore>,
        sink: Arc<RecordingAppearance>,
        signal: Arc<SystemThemeSignal>,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingAppearance::default());
        let signal = SystemThemeSignal::new(false);
        let repo = SettingsRepository::new(kv.clone(), Arc::new(PersistStatus::default()));
        let store = SettingsStore::new(Handle::current(), repo, sink.clone(), Arc::clone(&signal));
        Fixture {
            store,
            kv,
            sink,
            signal,
        }
    }

    #[test]
    fn test_normalize_settings() {
        assert_eq!(
            Settings::normalize(&json!({ "themeMode": "dark", "fontScale": 1.5 })),
            Settings {
                theme_mode: ThemeMode::Dark,
                font_scale: 1.5
            }
        );
        assert_eq!(
            Settings::normalize(&json!({ "themeMode": "DARK", "fontScale": "1.2" })),
            Settings {
                theme_mode: ThemeMode::System,
                font_scale: 1.2
            }
        );
        assert_eq!(Settings::normalize(&json!({})), Settings::default());
        assert_eq!(Settings::normalize(&json!({ "fontScale": 0 })).font_scale, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_defaults_applied_on_construction() {
        let f = fixture();
        assert_eq!(f.sink.take(), vec![Applied::Dark(false), Applied::Scale(100)]);
        assert!(f.store.is_following_system());
        assert_eq!(f.signal.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_values_are_noops() {
        let f = fixture();
        f.sink.take();

        assert!(!f.store.set_theme_mode(ThemeMode::System));
        assert!(!f.store.set_font_scale(1.0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.sink.take().is_empty());
        assert_eq!(f.kv.get(KEY_SETTINGS).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_apply_now_and_persist_later() {
        let f = fixture();
        f.sink.take();

        assert!(f.store.set_theme_mode(ThemeMode::Dark));
        assert!(f.store.set_font_scale(1.25));
        assert_eq!(f.sink.take(), vec![Applied::Dark(true), Applied::Scale(125)]);
        assert_eq!(f.kv.get(KEY_SETTINGS).unwrap(), None);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            f.kv.get(KEY_SETTINGS).unwrap(),
            Some(json!({ "themeMode": "dark", "fontScale": 1.25 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_subscription_torn_down_on_switch() {
        let f = fixture();

        f.store.set_theme_mode(ThemeMode::Light);
        assert_eq!(f.signal.listener_count(), 0);

        f.store.set_theme_mode(ThemeMode::System);
        f.store.set_theme_mode(ThemeMode::Dark);
        f.store.set_theme_mode(ThemeMode::System);
        assert_eq!(f.signal.listener_count(), 1);

        f.sink.take();
        f.signal.publish(true);
        assert_eq!(f.sink.take(), vec![Applied::Dark(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_loads_and_applies() {
        let f = fixture();
        f.kv.set(KEY_SETTINGS, json!({ "themeMode": "dark", "fontScale": 0.9 })).unwrap();
        f.sink.take();

        let loaded = f.store.hydrate();

        assert_eq!(loaded.theme_mode, ThemeMode::Dark);
        assert_eq!(f.store.snapshot().font_scale, 0.9);
        assert_eq!(f.sink.take(), vec![Applied::Dark(true), Applied::Scale(90)]);
        assert!(f.store.is_hydrated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_keeps_early_user_change() {
        let f = fixture();
        f.kv.set(KEY_SETTINGS, json!({ "themeMode": "dark", "fontScale": 0.9 })).unwrap();

        f.store.set_font_scale(1.5);
        let loaded = f.store.hydrate();

        assert_eq!(
            loaded,
            Settings {
                theme_mode: ThemeMode::Dark,
                font_scale: 1.5
            }
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            f.kv.get(KEY_SETTINGS).unwrap(),
            Some(json!({ "themeMode": "dark", "fontScale": 1.5 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_runs_once() {
        let f = fixture();
        f.store.hydrate();
        f.store.set_theme_mode(ThemeMode::Light);

        f.kv.set(KEY_SETTINGS, json!({ "themeMode": "dark" })).unwrap();
        assert_eq!(f.store.hydrate().theme_mode, ThemeMode::Light);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_screen_matches_state_when_hydrate_races_setter() {
        for _ in 0..50 {
            let f = fixture();
            f.kv.set(KEY_SETTINGS, json!({ "themeMode": "dark" })).unwrap();

            std::thread::scope(|scope| {
                scope.spawn(|| f.store.hydrate());
                f.store.set_theme_mode(ThemeMode::Light);
            });

            assert_eq!(f.store.snapshot().theme_mode, ThemeMode::Light);
            let last_dark = f
                .sink
                .take()
                .into_iter()
                .rev()
                .find(|a| matches!(a, Applied::Dark(_)));
            assert_eq!(last_dark, Some(Applied::Dark(false)));

            assert!(f.store.flush());
            assert_eq!(
                f.kv.get(KEY_SETTINGS).unwrap(),
                Some(json!({ "themeMode": "light" }))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_pending_change() {
        let f = fixture();
        f.store.set_theme_mode(ThemeMode::Light);

        assert!(f.store.flush());
        assert_eq!(
            f.kv.get(KEY_SETTINGS).unwrap(),
            Some(json!({ "themeMode": "light" }))
        );
    }
}
