// Webview side of the card runtime: one child webview per mounted card,
// placed over the grid cell the frontend reports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tauri::webview::PageLoadEvent;
use tauri::{
    AppHandle, Emitter, LogicalPosition, LogicalSize, Manager, Url, Webview, WebviewBuilder,
    WebviewUrl,
};

use gridcards_lib::modules::card_runtime::{is_error_page, CardEvent, HostCommand};
use gridcards_lib::modules::theme::AppearanceSink;
use gridcards_lib::state::AppState;

const CARD_LABEL_PREFIX: &str = "gridcard-";
const TICK: Duration = Duration::from_secs(1);

/// Grid cell rectangle in logical pixels, relative to the main window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for CardBounds {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 320.0,
            height: 240.0,
        }
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CardStatusPayload {
    id: String,
    error: Option<String>,
    ready: bool,
}

/// Webview labels only allow a small alphabet; card ids may come from
/// imported files.
fn card_label(card_id: &str) -> String {
    let safe: String = card_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}{}", CARD_LABEL_PREFIX, safe)
}

/// Pending mount parameters, collected until the webview can be built.
#[derive(Default)]
struct MountPlan {
    address: Option<String>,
    user_agent: Option<&'static str>,
    partition: Option<String>,
    zoom: Option<f64>,
}

/// Last known cell of every card that has a webview or a reported cell.
#[derive(Default)]
struct CardCells(Mutex<HashMap<String, CardBounds>>);

impl CardCells {
    fn set(&self, card_id: &str, bounds: CardBounds) {
        self.0.lock().insert(card_id.to_string(), bounds);
    }

    /// Bounds to build with; a card the frontend has not placed yet is
    /// recorded at the default cell.
    fn for_build(&self, card_id: &str) -> CardBounds {
        *self.0.lock().entry(card_id.to_string()).or_default()
    }

    /// Forgets cards outside `live` and returns their ids.
    fn take_stale(&self, live: &[String]) -> Vec<String> {
        let mut cells = self.0.lock();
        let stale: Vec<String> = cells.keys().filter(|id| !live.contains(id)).cloned().collect();
        for id in &stale {
            cells.remove(id);
        }
        stale
    }
}

pub struct CardHost {
    app: AppHandle,
    cells: CardCells,
}

impl CardHost {
    pub fn new(app: AppHandle) -> Self {
        Self {
            app,
            cells: CardCells::default(),
        }
    }

    fn webview(&self, card_id: &str) -> Option<Webview> {
        self.app.get_webview(&card_label(card_id))
    }

    fn partition_dir(&self, partition: &str) -> Option<PathBuf> {
        let name = partition.trim_start_matches("persist:");
        let base = self.app.path().app_data_dir().ok()?;
        Some(base.join("partitions").join(name))
    }

    pub fn set_bounds(&self, card_id: &str, bounds: CardBounds) -> Result<(), String> {
        self.cells.set(card_id, bounds);
        if let Some(webview) = self.webview(card_id) {
            webview
                .set_bounds(tauri::Rect {
                    position: LogicalPosition::new(bounds.x, bounds.y).into(),
                    size: LogicalSize::new(bounds.width, bounds.height).into(),
                })
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Carries out runtime commands for one card.
    pub fn apply(&self, card_id: &str, commands: Vec<HostCommand>) {
        let mut plan = MountPlan::default();
        for command in commands {
            match command {
                HostCommand::SetAddress(address) => plan.address = Some(address),
                HostCommand::SetUserAgent(ua) => plan.user_agent = Some(ua),
                HostCommand::SetPartition(partition) => plan.partition = Some(partition),
                HostCommand::SetZoom(zoom) => plan.zoom = Some(zoom),
                HostCommand::Reload => self.eval(card_id, "window.location.reload()"),
                HostCommand::RunScript(script) => self.eval(card_id, &script),
            }
        }

        let result = match (plan.address.take(), plan.partition.is_some()) {
            // User agent and partition are fixed at creation: rebuild.
            (Some(address), true) => self.build(card_id, &address, &plan),
            (Some(address), false) => self.navigate(card_id, &address),
            (None, _) => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("[Cards] Failed to host card {}: {}", card_id, e);
        }

        if let (Some(zoom), Some(webview)) = (plan.zoom, self.webview(card_id)) {
            if let Err(e) = webview.set_zoom(zoom) {
                log::warn!("[Cards] Failed to zoom card {}: {}", card_id, e);
            }
        }
    }

    fn eval(&self, card_id: &str, script: &str) {
        if let Some(webview) = self.webview(card_id) {
            let _ = webview.eval(script);
        }
    }

    fn navigate(&self, card_id: &str, address: &str) -> Result<(), String> {
        let url = Url::parse(address).map_err(|e| e.to_string())?;
        match self.webview(card_id) {
            Some(webview) => webview.navigate(url).map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }

    fn build(&self, card_id: &str, address: &str, plan: &MountPlan) -> Result<(), String> {
        self.close(card_id);

        let window = self
            .app
            .get_window("main")
            .ok_or_else(|| "main window missing".to_string())?;
        let url = Url::parse(address).map_err(|e| e.to_string())?;
        let bounds = self.cells.for_build(card_id);

        let app = self.app.clone();
        let id = card_id.to_string();
        let mut builder = WebviewBuilder::new(card_label(card_id), WebviewUrl::External(url))
            .on_page_load(move |_webview, payload| {
                if !matches!(payload.event(), PageLoadEvent::Finished) {
                    return;
                }
                let online = app.state::<AppState>().cards.lock().is_online();
                if !online || is_error_page(payload.url().as_str()) {
                    dispatch_event(&app, &id, CardEvent::LoadFailed);
                }
                dispatch_event(&app, &id, CardEvent::ContentReady);
            });
        if let Some(ua) = plan.user_agent {
            builder = builder.user_agent(ua);
        }
        if let Some(dir) = plan.partition.as_deref().and_then(|p| self.partition_dir(p)) {
            builder = builder.data_directory(dir);
        }

        window
            .add_child(
                builder,
                LogicalPosition::new(bounds.x, bounds.y),
                LogicalSize::new(bounds.width, bounds.height),
            )
            .map_err(|e| e.to_string())?;
        log::debug!("[Cards] Mounted {}", card_id);
        Ok(())
    }

    pub fn close(&self, card_id: &str) {
        if let Some(webview) = self.webview(card_id) {
            let _ = webview.close();
        }
    }

    /// Closes webviews for cards that no longer have a runtime.
    pub fn retain(&self, live: &[String]) {
        for id in self.cells.take_stale(live) {
            self.close(&id);
        }
    }
}

/// Feeds one host event into the card runtime and carries out the result.
pub fn dispatch_event(app: &AppHandle, card_id: &str, event: CardEvent) {
    let state = app.state::<AppState>();
    let host = app.state::<Arc<CardHost>>();

    if event == CardEvent::Hidden {
        host.close(card_id);
    }
    let (commands, status) = {
        let mut cards = state.cards.lock();
        let commands = cards.handle(card_id, event, Instant::now());
        (commands, cards.status(card_id))
    };
    host.apply(card_id, commands);

    if let Some(status) = status {
        let _ = app.emit(
            "card-status",
            CardStatusPayload {
                id: status.id,
                error: status.error,
                ready: status.ready,
            },
        );
    }
}

/// Carries out a batch of commands for several cards.
pub fn apply_all(host: &CardHost, commands: Vec<(String, HostCommand)>) {
    let mut by_card: HashMap<String, Vec<HostCommand>> = HashMap::new();
    for (id, command) in commands {
        by_card.entry(id).or_default().push(command);
    }
    for (id, commands) in by_card {
        host.apply(&id, commands);
    }
}

/// Drives scheduled refreshes and retry backoff.
pub fn spawn_ticker(app: AppHandle) {
    tauri::async_runtime::spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        loop {
            interval.tick().await;
            let state = app.state::<AppState>();
            let host = app.state::<Arc<CardHost>>();
            let due = state.cards.lock().poll(Instant::now());
            if !due.is_empty() {
                log::debug!("[Cards] {} commands due", due.len());
                apply_all(&host, due);
            }
        }
    });
}

/// Applies appearance by telling the frontend, which owns the DOM.
pub struct TauriAppearance {
    app: AppHandle,
}

impl TauriAppearance {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl AppearanceSink for TauriAppearance {
    fn set_dark(&self, dark: bool) {
        let _ = self.app.emit("appearance-dark", dark);
    }

    fn set_font_scale(&self, percent: u32) {
        let _ = self.app.emit("appearance-font-scale", percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_label_is_webview_safe() {
        assert_eq!(card_label("card-1234"), "gridcard-card-1234");
        assert_eq!(card_label("a b/c.d"), "gridcard-a_b_c_d");
    }

    #[test]
    fn test_cards_built_before_placement_are_retired() {
        let cells = CardCells::default();
        assert_eq!(cells.for_build("c1"), CardBounds::default());
        cells.set("c2", CardBounds { x: 10.0, y: 20.0, width: 300.0, height: 200.0 });
        assert_eq!(cells.for_build("c2").x, 10.0);

        let mut stale = cells.take_stale(&["c2".to_string()]);
        stale.sort();
        assert_eq!(stale, vec!["c1".to_string()]);
        assert!(cells.take_stale(&["c2".to_string()]).is_empty());
        assert_eq!(cells.take_stale(&[]), vec!["c2".to_string()]);
    }
}
