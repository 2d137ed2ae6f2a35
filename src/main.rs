// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod host;

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use tauri::{AppHandle, Emitter, Manager, State, Theme, WindowEvent};
use tauri_plugin_clipboard_manager::ClipboardExt;
use tauri_plugin_dialog::DialogExt;
use tauri_plugin_opener::OpenerExt;

use gridcards_lib::error::StoreError;
use gridcards_lib::modules::card_runtime::{CardEvent, CardStatus};
use gridcards_lib::modules::model::{CardConfig, GridLayoutItem, Layout, LayoutsDocument};
use gridcards_lib::modules::repository::{JsonFileStore, KeyValueStore, MemoryStore, PersistStatusSnapshot};
use gridcards_lib::modules::validation::resolve_card_url;
use gridcards_lib::settings::{Settings, ThemeMode};
use gridcards_lib::state::AppState;

use host::{CardBounds, CardHost, TauriAppearance};

/// Tells the frontend about the new layout state and re-points card webviews.
///
/// Re-pointing may build webviews, which deadlocks on Windows when done from
/// a sync command on the main thread, so the host work runs on the async
/// runtime.
fn layouts_changed(app: &AppHandle, state: &AppState) {
    let _ = app.emit("layouts-changed", state.layouts.export_all());

    let commands = state.sync_cards(Instant::now());
    let live: Vec<String> = state.cards.lock().statuses().into_iter().map(|s| s.id).collect();
    let app = app.clone();
    tauri::async_runtime::spawn(async move {
        let host = app.state::<Arc<CardHost>>();
        host.retain(&live);
        host::apply_all(&host, commands);
    });
}

fn settings_changed(app: &AppHandle, state: &AppState) {
    let _ = app.emit("settings-changed", state.settings.snapshot());
}

// --- Layouts ---

#[tauri::command]
fn get_layouts(state: State<'_, AppState>) -> LayoutsDocument {
    state.layouts.export_all()
}

#[tauri::command]
fn get_current_layout(state: State<'_, AppState>) -> Option<Layout> {
    state.layouts.current_layout()
}

#[tauri::command]
fn is_store_ready(state: State<'_, AppState>) -> bool {
    state.layouts.is_ready()
}

#[tauri::command]
fn create_layout(app: AppHandle, state: State<'_, AppState>, name: String) -> String {
    let id = state.layouts.create_layout(&name);
    layouts_changed(&app, &state);
    id
}

#[tauri::command]
fn rename_layout(app: AppHandle, state: State<'_, AppState>, id: String, name: String) -> bool {
    let changed = state.layouts.rename_layout(&id, &name);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn delete_layout(app: AppHandle, state: State<'_, AppState>, id: String) -> bool {
    let changed = state.layouts.delete_layout(&id);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn switch_layout(app: AppHandle, state: State<'_, AppState>, id: String) -> bool {
    let changed = state.layouts.switch_layout(&id);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn reorder_layouts(app: AppHandle, state: State<'_, AppState>, order: Vec<String>) -> bool {
    let changed = state.layouts.reorder_layouts(order);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn update_layout_items(app: AppHandle, state: State<'_, AppState>, items: Vec<GridLayoutItem>) -> bool {
    let changed = state.layouts.update_layout_items(items);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

// --- Cards ---

#[tauri::command]
fn upsert_card(app: AppHandle, state: State<'_, AppState>, card: CardConfig) -> bool {
    let changed = state.layouts.upsert_card(card);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

/// Adds a new card to the current layout and returns it.
#[tauri::command]
fn add_card(app: AppHandle, state: State<'_, AppState>, name: String, url: String) -> CardConfig {
    let card = CardConfig::new(&name, &url);
    if state.layouts.upsert_card(card.clone()) {
        layouts_changed(&app, &state);
    }
    card
}

#[tauri::command]
fn remove_card(app: AppHandle, state: State<'_, AppState>, id: String) -> bool {
    let changed = state.layouts.remove_card(&id);
    if changed {
        layouts_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn copy_card_config(app: AppHandle, state: State<'_, AppState>, id: String) -> Result<(), String> {
    let card = state
        .layouts
        .find_card(&id)
        .ok_or_else(|| format!("unknown card {}", id))?;
    let json = serde_json::to_string(&card).map_err(|e| e.to_string())?;
    app.clipboard().write_text(json).map_err(|e| e.to_string())?;
    Ok(())
}

#[tauri::command]
fn open_card_externally(app: AppHandle, state: State<'_, AppState>, id: String) -> Result<(), String> {
    let card = state
        .layouts
        .find_card(&id)
        .ok_or_else(|| format!("unknown card {}", id))?;
    app.opener()
        .open_url(resolve_card_url(&card.url), None::<&str>)
        .map_err(|e| e.to_string())
}

// Webviews are created here, so keep these async (Windows deadlocks otherwise).
#[tauri::command]
async fn card_event(app: AppHandle, id: String, event: CardEvent) -> Result<(), String> {
    host::dispatch_event(&app, &id, event);
    Ok(())
}

#[tauri::command]
async fn set_card_bounds(app: AppHandle, id: String, bounds: CardBounds) -> Result<(), String> {
    let host = app.state::<Arc<CardHost>>();
    host.set_bounds(&id, bounds)
}

#[tauri::command]
fn get_card_statuses(state: State<'_, AppState>) -> Vec<CardStatus> {
    state.cards.lock().statuses()
}

#[tauri::command]
fn set_network_online(app: AppHandle, state: State<'_, AppState>, online: bool) {
    let commands = state.cards.lock().set_online(online);
    let host = app.state::<Arc<CardHost>>();
    host::apply_all(&host, commands);
}

// --- Import / export ---

#[tauri::command]
fn export_layouts_json(state: State<'_, AppState>) -> Result<String, String> {
    state.layouts.export_json().map_err(|e| e.to_string())
}

#[tauri::command]
fn import_layouts(app: AppHandle, state: State<'_, AppState>, doc: LayoutsDocument) {
    state.layouts.import_all(doc);
    layouts_changed(&app, &state);
}

#[tauri::command]
fn import_layouts_json(app: AppHandle, state: State<'_, AppState>, text: String) -> Result<(), String> {
    state.layouts.import_json(&text).map_err(|e| e.to_string())?;
    layouts_changed(&app, &state);
    Ok(())
}

/// Asks for a destination and writes the pretty-printed export there.
/// Returns the chosen path, or `None` if the dialog was cancelled.
#[tauri::command]
async fn export_layouts_to_file(app: AppHandle) -> Result<Option<String>, String> {
    let state = app.state::<AppState>();
    let json = state.layouts.export_json().map_err(|e| e.to_string())?;
    let file_name = format!("gridcards-layouts-{}.json", chrono::Local::now().format("%Y%m%d-%H%M%S"));

    let Some(target) = app
        .dialog()
        .file()
        .add_filter("JSON", &["json"])
        .set_file_name(file_name)
        .blocking_save_file()
    else {
        return Ok(None);
    };
    let path = target.into_path().map_err(|e| e.to_string())?;
    fs::write(&path, json).map_err(|e| {
        StoreError::Io {
            path: path.clone(),
            source: e,
        }
        .to_string()
    })?;

    log::info!("[Grid] Exported layouts to {:?}", path);
    Ok(Some(path.to_string_lossy().to_string()))
}

/// Asks for a layouts file and imports it. Returns false if cancelled.
#[tauri::command]
async fn import_layouts_from_file(app: AppHandle) -> Result<bool, String> {
    let Some(source) = app
        .dialog()
        .file()
        .add_filter("JSON", &["json"])
        .blocking_pick_file()
    else {
        return Ok(false);
    };
    let path = source.into_path().map_err(|e| e.to_string())?;
    let text = fs::read_to_string(&path).map_err(|e| e.to_string())?;

    let state = app.state::<AppState>();
    state.layouts.import_json(&text).map_err(|e| e.to_string())?;
    layouts_changed(&app, &state);
    Ok(true)
}

// --- Settings ---

#[tauri::command]
fn get_settings(state: State<'_, AppState>) -> Settings {
    state.settings.snapshot()
}

#[tauri::command]
fn set_theme_mode(app: AppHandle, state: State<'_, AppState>, mode: ThemeMode) -> bool {
    let changed = state.settings.set_theme_mode(mode);
    if changed {
        settings_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn set_font_scale(app: AppHandle, state: State<'_, AppState>, scale: f64) -> bool {
    let changed = state.settings.set_font_scale(scale);
    if changed {
        settings_changed(&app, &state);
    }
    changed
}

#[tauri::command]
fn get_persist_status(state: State<'_, AppState>) -> PersistStatusSnapshot {
    state.persist_status.snapshot()
}

fn open_backend(app: &AppHandle) -> Arc<dyn KeyValueStore> {
    match app.path().app_data_dir() {
        Ok(dir) => {
            let store = JsonFileStore::open(&dir);
            log::info!("[Repository] Using {:?}", store.path());
            Arc::new(store)
        }
        Err(e) => {
            log::warn!("[Repository] {} ({}), changes will not be saved", StoreError::NoDataDir, e);
            Arc::new(MemoryStore::new())
        }
    }
}

fn main() {
    let app = tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _argv, _cwd| {
            if let Some(win) = app.get_webview_window("main") {
                let _ = win.unminimize();
                let _ = win.set_focus();
            }
        }))
        .plugin(tauri_plugin_clipboard_manager::init())
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            if cfg!(debug_assertions) {
                app.handle().plugin(
                    tauri_plugin_log::Builder::default()
                        .level(log::LevelFilter::Info)
                        .build(),
                )?;
            }

            let handle = app.handle().clone();
            let system_dark = app
                .get_webview_window("main")
                .and_then(|w| w.theme().ok())
                .map(|t| t == Theme::Dark)
                .unwrap_or(false);

            // Debounce timers need a tokio handle; commands run off the runtime.
            let runtime = tauri::async_runtime::block_on(async { tokio::runtime::Handle::current() });
            let state = AppState::new(
                runtime,
                open_backend(&handle),
                Arc::new(TauriAppearance::new(handle.clone())),
                system_dark,
            );
            app.manage(state.clone());
            app.manage(Arc::new(CardHost::new(handle.clone())));

            // Hydrate off the main thread; mutations meanwhile are queued.
            let hydrate_handle = handle.clone();
            tauri::async_runtime::spawn_blocking(move || {
                let started = Instant::now();
                state.hydrate();
                log::info!("[Grid] Store ready in {:?}", started.elapsed());
                let _ = hydrate_handle.emit("store-ready", ());
                settings_changed(&hydrate_handle, &state);
                layouts_changed(&hydrate_handle, &state);
            });

            host::spawn_ticker(handle);
            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::ThemeChanged(theme) = event {
                if let Some(state) = window.try_state::<AppState>() {
                    state.system_theme.publish(*theme == Theme::Dark);
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            get_layouts,
            get_current_layout,
            is_store_ready,
            create_layout,
            rename_layout,
            delete_layout,
            switch_layout,
            reorder_layouts,
            update_layout_items,
            upsert_card,
            add_card,
            remove_card,
            copy_card_config,
            open_card_externally,
            card_event,
            set_card_bounds,
            get_card_statuses,
            set_network_online,
            export_layouts_json,
            import_layouts,
            import_layouts_json,
            export_layouts_to_file,
            import_layouts_from_file,
            get_settings,
            set_theme_mode,
            set_font_scale,
            get_persist_status
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|app_handle, event| {
        if let tauri::RunEvent::Exit = event {
            if let Some(state) = app_handle.try_state::<AppState>() {
                state.flush_all();
            }
        }
    });
}
