// Shared application state, handed to the command layer as managed state.
// Owns every store instance; nothing here touches a window, so it can be
// built and tested headless.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

use crate::modules::card_runtime::{CardRegistry, HostCommand};
use crate::modules::grid_store::LayoutStore;
use crate::modules::model::LayoutsDocument;
use crate::modules::repository::{
    KeyValueStore, LayoutRepository, PersistStatus, SettingsRepository,
};
use crate::modules::theme::{AppearanceSink, SystemThemeSignal};
use crate::settings::{Settings, SettingsStore};

#[derive(Clone)]
pub struct AppState {
    pub layouts: Arc<LayoutStore>,
    pub settings: Arc<SettingsStore>,
    pub persist_status: Arc<PersistStatus>,
    pub system_theme: Arc<SystemThemeSignal>,
    pub cards: Arc<Mutex<CardRegistry>>,
}

impl AppState {
    /// Builds both stores over one backend. Stores start with defaults;
    /// call [`AppState::hydrate`] once the backend is readable.
    pub fn new(
        runtime: Handle,
        kv: Arc<dyn KeyValueStore>,
        sink: Arc<dyn AppearanceSink>,
        system_dark: bool,
    ) -> Self {
        let persist_status = Arc::new(PersistStatus::default());
        let system_theme = SystemThemeSignal::new(system_dark);

        let layouts = LayoutStore::new(
            runtime.clone(),
            LayoutRepository::new(Arc::clone(&kv), Arc::clone(&persist_status)),
        );
        let settings = SettingsStore::new(
            runtime,
            SettingsRepository::new(kv, Arc::clone(&persist_status)),
            sink,
            Arc::clone(&system_theme),
        );

        Self {
            layouts: Arc::new(layouts),
            settings: Arc::new(settings),
            persist_status,
            system_theme,
            cards: Arc::new(Mutex::new(CardRegistry::new())),
        }
    }

    /// Loads persisted settings and layouts, then registers the current
    /// layout's cards.
    pub fn hydrate(&self) -> (Settings, LayoutsDocument) {
        let settings = self.settings.hydrate();
        let doc = self.layouts.hydrate();
        self.sync_cards(Instant::now());
        (settings, doc)
    }

    /// Re-syncs card runtimes with the current layout. Returns commands for
    /// mounted cards whose config changed.
    pub fn sync_cards(&self, now: Instant) -> Vec<(String, HostCommand)> {
        let current = self.layouts.current_layout();
        let configs = current
            .iter()
            .flat_map(|layout| layout.items.iter().map(|item| &item.config));
        self.cards.lock().sync(configs, now)
    }

    /// Writes every pending change. Called on shutdown.
    pub fn flush_all(&self) {
        let settings = self.settings.flush();
        let layouts = self.layouts.flush();
        log::info!(
            "[Repository] Flushed on exit (settings: {}, layouts: {})",
            settings,
            layouts
        );
    }
}
