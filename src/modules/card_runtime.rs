// Per-card lifecycle: what the embedded page host should do, and when.
//
// Pure state machine with no webview access. The shell feeds it host events
// (mounted, content ready, load failed, network status) plus a clock, and
// carries out the returned `HostCommand`s on the real webview.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::modules::model::CardConfig;
use crate::modules::validation::{
    effective_refresh_secs, effective_zoom, isolate_selector_script, resolve_card_url,
    user_agent_for,
};

/// Retries stop after this many consecutive failures.
pub const MAX_RETRIES: u32 = 5;
/// Backoff step; the n-th retry waits `n` steps.
pub const RETRY_STEP: Duration = Duration::from_millis(500);

pub const LOAD_FAILED_MESSAGE: &str = "Failed to load";

/// Storage partition that isolates one card's cookies and cache.
pub fn partition_for(card_id: &str) -> String {
    format!("persist:gridcard-{}", card_id)
}

/// Whether a finished navigation landed on the engine's own error page
/// instead of the card's site.
pub fn is_error_page(loaded: &str) -> bool {
    match url::Url::parse(loaded) {
        Ok(url) => matches!(url.scheme(), "about" | "chrome-error" | "edge-error"),
        Err(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    SetAddress(String),
    SetUserAgent(&'static str),
    SetPartition(String),
    SetZoom(f64),
    Reload,
    RunScript(String),
}

/// Host event reported for a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CardEvent {
    Visible,
    Hidden,
    ContentReady,
    LoadFailed,
    Refresh,
}

/// What the card frame shows around the page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardStatus {
    pub id: String,
    pub mounted: bool,
    pub ready: bool,
    pub error: Option<String>,
    pub retry: u32,
}

#[derive(Debug)]
pub struct CardRuntime {
    config: CardConfig,
    mounted: bool,
    ready: bool,
    online: bool,
    error: Option<String>,
    retry: u32,
    // A failure happened before the page was ready; back off once it is.
    retry_waiting_for_ready: bool,
    // The navigation in flight failed; its error page is not content.
    failed_load: bool,
    retry_due: Option<Instant>,
    next_refresh: Option<Instant>,
}

impl CardRuntime {
    pub fn new(config: CardConfig) -> Self {
        Self {
            config,
            mounted: false,
            ready: false,
            online: true,
            error: None,
            retry: 0,
            retry_waiting_for_ready: false,
            failed_load: false,
            retry_due: None,
            next_refresh: None,
        }
    }

    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    pub fn status(&self) -> CardStatus {
        CardStatus {
            id: self.config.id.clone(),
            mounted: self.mounted,
            ready: self.ready,
            error: self.error.clone(),
            retry: self.retry,
        }
    }

    fn refresh_every(&self) -> Duration {
        Duration::from_secs(effective_refresh_secs(self.config.refresh_interval))
    }

    fn mount_commands(&self) -> Vec<HostCommand> {
        vec![
            HostCommand::SetAddress(resolve_card_url(&self.config.url)),
            HostCommand::SetUserAgent(user_agent_for(self.config.access_mode)),
            HostCommand::SetPartition(partition_for(&self.config.id)),
            HostCommand::SetZoom(effective_zoom(self.config.zoom_factor)),
        ]
    }

    /// The card scrolled into view. Already-mounted cards are left alone.
    pub fn mount(&mut self, now: Instant) -> Vec<HostCommand> {
        if self.mounted {
            return Vec::new();
        }
        self.mounted = true;
        self.ready = false;
        self.next_refresh = Some(now + self.refresh_every());
        self.mount_commands()
    }

    /// The card left the view. Nothing is reloaded until it is mounted again.
    pub fn unmount(&mut self) {
        self.mounted = false;
        self.ready = false;
        self.failed_load = false;
        self.retry_due = None;
        self.next_refresh = None;
    }

    pub fn content_ready(&mut self, now: Instant) -> Vec<HostCommand> {
        if !self.mounted {
            return Vec::new();
        }
        self.ready = true;

        if std::mem::take(&mut self.failed_load) {
            // The error page finished: the banner stays and the backoff starts.
            if std::mem::take(&mut self.retry_waiting_for_ready) {
                self.retry_due = Some(now + RETRY_STEP * self.retry);
            }
            return Vec::new();
        }

        self.error = None;
        if self.retry_due.is_none() {
            // A clean load ends the failure streak.
            self.retry = 0;
        }

        match self.config.selector() {
            Some(selector) => vec![HostCommand::RunScript(isolate_selector_script(selector))],
            None => Vec::new(),
        }
    }

    pub fn load_failed(&mut self, now: Instant) {
        if !self.mounted {
            return;
        }
        self.error = Some(LOAD_FAILED_MESSAGE.to_string());
        self.failed_load = true;
        if self.retry >= MAX_RETRIES {
            return;
        }
        self.retry += 1;
        if self.ready {
            self.retry_due = Some(now + RETRY_STEP * self.retry);
        } else {
            self.retry_waiting_for_ready = true;
        }
    }

    /// Starts a new navigation, so an earlier failure no longer applies.
    fn reload(&mut self) -> HostCommand {
        self.failed_load = false;
        HostCommand::Reload
    }

    /// Explicit refresh from the card toolbar.
    pub fn reload_now(&mut self, now: Instant) -> Vec<HostCommand> {
        if !self.mounted {
            return Vec::new();
        }
        self.next_refresh = Some(now + self.refresh_every());
        vec![self.reload()]
    }

    /// Reloads when the network comes back while the page is showing.
    pub fn set_online(&mut self, online: bool) -> Vec<HostCommand> {
        let recovered = online && !self.online;
        self.online = online;
        if recovered && self.mounted && self.ready {
            vec![self.reload()]
        } else {
            Vec::new()
        }
    }

    /// Applies an edited config. A mounted card is re-pointed when anything
    /// the host was told at mount time changed.
    pub fn update_config(&mut self, config: CardConfig, now: Instant) -> Vec<HostCommand> {
        let old = std::mem::replace(&mut self.config, config);
        if !self.mounted {
            return Vec::new();
        }

        if old.refresh_interval != self.config.refresh_interval {
            self.next_refresh = Some(now + self.refresh_every());
        }

        let host_changed = resolve_card_url(&old.url) != resolve_card_url(&self.config.url)
            || old.access_mode != self.config.access_mode
            || effective_zoom(old.zoom_factor) != effective_zoom(self.config.zoom_factor);
        if host_changed {
            self.ready = false;
            self.error = None;
            self.retry = 0;
            self.retry_waiting_for_ready = false;
            self.failed_load = false;
            self.retry_due = None;
            return self.mount_commands();
        }

        match self.config.selector() {
            Some(selector) if self.ready && old.selector() != Some(selector) => {
                vec![HostCommand::RunScript(isolate_selector_script(selector))]
            }
            _ => Vec::new(),
        }
    }

    /// Fires whatever refresh or retry has come due.
    pub fn poll(&mut self, now: Instant) -> Vec<HostCommand> {
        if !self.mounted {
            return Vec::new();
        }
        let mut commands = Vec::new();

        if self.retry_due.is_some_and(|due| due <= now) {
            self.retry_due = None;
            commands.push(self.reload());
        }

        if let Some(due) = self.next_refresh {
            if due <= now {
                self.next_refresh = Some(now + self.refresh_every());
                if self.ready && commands.is_empty() {
                    commands.push(self.reload());
                }
            }
        }
        commands
    }

    /// Earliest instant at which `poll` may have something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.mounted {
            return None;
        }
        match (self.retry_due, self.next_refresh) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Runtimes for every card of the current layout, keyed by card id.
#[derive(Debug)]
pub struct CardRegistry {
    cards: HashMap<String, CardRuntime>,
    online: bool,
}

impl Default for CardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CardRegistry {
    pub fn new() -> Self {
        Self {
            cards: HashMap::new(),
            online: true,
        }
    }

    /// Brings the registry in line with `configs`: new cards get a fresh
    /// runtime, removed cards are dropped, edited cards are updated.
    pub fn sync<'a, I>(&mut self, configs: I, now: Instant) -> Vec<(String, HostCommand)>
    where
        I: IntoIterator<Item = &'a CardConfig>,
    {
        let mut commands = Vec::new();
        let mut keep = Vec::new();

        for config in configs {
            keep.push(config.id.clone());
            match self.cards.get_mut(&config.id) {
                Some(runtime) if runtime.config() != config => {
                    for cmd in runtime.update_config(config.clone(), now) {
                        commands.push((config.id.clone(), cmd));
                    }
                }
                Some(_) => {}
                None => {
                    let mut runtime = CardRuntime::new(config.clone());
                    runtime.online = self.online;
                    self.cards.insert(config.id.clone(), runtime);
                }
            }
        }

        let before = self.cards.len();
        self.cards.retain(|id, _| keep.contains(id));
        if self.cards.len() != before {
            log::debug!("[Cards] Dropped {} runtimes", before - self.cards.len());
        }
        commands
    }

    /// Routes one host event. Unknown card ids are ignored.
    pub fn handle(&mut self, id: &str, event: CardEvent, now: Instant) -> Vec<HostCommand> {
        let Some(runtime) = self.cards.get_mut(id) else {
            log::debug!("[Cards] Event {:?} for unknown card {}", event, id);
            return Vec::new();
        };
        match event {
            CardEvent::Visible => runtime.mount(now),
            CardEvent::Hidden => {
                runtime.unmount();
                Vec::new()
            }
            CardEvent::ContentReady => runtime.content_ready(now),
            CardEvent::LoadFailed => {
                runtime.load_failed(now);
                log::warn!("[Cards] Card {} failed to load (retry {})", id, runtime.retry);
                Vec::new()
            }
            CardEvent::Refresh => runtime.reload_now(now),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) -> Vec<(String, HostCommand)> {
        if self.online != online {
            log::info!("[Cards] Network {}", if online { "online" } else { "offline" });
        }
        self.online = online;
        let mut commands = Vec::new();
        for (id, runtime) in self.cards.iter_mut() {
            for cmd in runtime.set_online(online) {
                commands.push((id.clone(), cmd));
            }
        }
        commands
    }

    pub fn poll(&mut self, now: Instant) -> Vec<(String, HostCommand)> {
        let mut commands = Vec::new();
        for (id, runtime) in self.cards.iter_mut() {
            for cmd in runtime.poll(now) {
                commands.push((id.clone(), cmd));
            }
        }
        commands
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.cards.values().filter_map(CardRuntime::next_deadline).min()
    }

    pub fn status(&self, id: &str) -> Option<CardStatus> {
        self.cards.get(id).map(CardRuntime::status)
    }

    pub fn statuses(&self) -> Vec<CardStatus> {
        let mut all: Vec<CardStatus> = self.cards.values().map(CardRuntime::status).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::model::AccessMode;
    use crate::modules::validation::{MAX_REFRESH_SECS, UA_MOBILE, UA_PC};
    use rstest::rstest;

    fn config() -> CardConfig {
        CardConfig {
            id: "c1".to_string(),
            name: "Docs".to_string(),
            url: "docs.rs".to_string(),
            refresh_interval: 60,
            access_mode: AccessMode::Pc,
            target_selector: None,
            zoom_factor: None,
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn ready_card(t0: Instant) -> CardRuntime {
        let mut card = CardRuntime::new(config());
        card.mount(t0);
        card.content_ready(t0);
        card
    }

    #[test]
    fn test_mount_points_the_host() {
        let mut card = CardRuntime::new(config());
        let commands = card.mount(Instant::now());

        assert_eq!(
            commands,
            vec![
                HostCommand::SetAddress("https://docs.rs".to_string()),
                HostCommand::SetUserAgent(UA_PC),
                HostCommand::SetPartition("persist:gridcard-c1".to_string()),
                HostCommand::SetZoom(1.0),
            ]
        );
        assert!(card.mount(Instant::now()).is_empty(), "second mount is a no-op");
    }

    #[test]
    fn test_mobile_card_with_invalid_url_searches() {
        let mut cfg = config();
        cfg.url = "rust borrow checker".to_string();
        cfg.access_mode = AccessMode::Mobile;
        cfg.zoom_factor = Some(9.0);

        let commands = CardRuntime::new(cfg).mount(Instant::now());

        assert!(matches!(&commands[0], HostCommand::SetAddress(u) if u.starts_with("https://www.google.com/search?q=")));
        assert_eq!(commands[1], HostCommand::SetUserAgent(UA_MOBILE));
        assert_eq!(commands[3], HostCommand::SetZoom(3.0));
    }

    #[test]
    fn test_refresh_only_when_ready() {
        let t0 = Instant::now();
        let mut card = CardRuntime::new(config());
        card.mount(t0);

        // Not ready yet: the tick passes without a reload.
        assert!(card.poll(t0 + secs(60)).is_empty());

        card.content_ready(t0 + secs(61));
        assert!(card.poll(t0 + secs(100)).is_empty());
        assert_eq!(card.poll(t0 + secs(120)), vec![HostCommand::Reload]);
        assert!(card.poll(t0 + secs(121)).is_empty());
    }

    #[test]
    fn test_huge_refresh_interval_is_capped() {
        let t0 = Instant::now();
        let cfg: CardConfig = serde_json::from_str(
            r#"{ "id": "c1", "name": "Docs", "url": "docs.rs", "refreshInterval": 18446744073709551615 }"#,
        )
        .unwrap();
        let mut registry = CardRegistry::new();
        registry.sync([&cfg], t0);

        assert!(!registry.handle("c1", CardEvent::Visible, t0).is_empty());
        registry.handle("c1", CardEvent::ContentReady, t0);
        assert!(registry.poll(t0 + secs(3600)).is_empty());
        assert_eq!(
            registry.poll(t0 + secs(MAX_REFRESH_SECS)),
            vec![("c1".to_string(), HostCommand::Reload)]
        );
    }

    #[test]
    fn test_unmounted_cards_never_reload() {
        let t0 = Instant::now();
        let mut card = ready_card(t0);
        card.unmount();

        assert!(card.poll(t0 + secs(3600)).is_empty());
        assert!(card.reload_now(t0).is_empty());
        assert!(card.set_online(false).is_empty());
        assert!(card.set_online(true).is_empty());
        assert_eq!(card.next_deadline(), None);
    }

    #[test]
    fn test_content_ready_runs_selector_script() {
        let mut cfg = config();
        cfg.target_selector = Some("#main".to_string());
        let mut card = CardRuntime::new(cfg);
        card.mount(Instant::now());

        let commands = card.content_ready(Instant::now());
        assert_eq!(commands, vec![HostCommand::RunScript(isolate_selector_script("#main"))]);
        assert!(card.status().ready);
    }

    #[test]
    fn test_failure_backs_off_linearly() {
        let t0 = Instant::now();
        let mut card = ready_card(t0);

        card.load_failed(t0);
        assert_eq!(card.status().error.as_deref(), Some(LOAD_FAILED_MESSAGE));
        assert!(card.poll(t0 + Duration::from_millis(499)).is_empty());
        assert_eq!(card.poll(t0 + Duration::from_millis(500)), vec![HostCommand::Reload]);

        let t1 = t0 + secs(1);
        card.load_failed(t1);
        assert_eq!(card.status().retry, 2);
        assert!(card.poll(t1 + Duration::from_millis(999)).is_empty());
        assert_eq!(card.poll(t1 + Duration::from_millis(1000)), vec![HostCommand::Reload]);
    }

    #[test]
    fn test_failure_before_ready_waits_for_ready() {
        let t0 = Instant::now();
        let mut card = CardRuntime::new(config());
        card.mount(t0);

        card.load_failed(t0);
        assert!(card.poll(t0 + secs(5)).is_empty());

        let t1 = t0 + secs(10);
        card.content_ready(t1);
        assert_eq!(card.status().error.as_deref(), Some(LOAD_FAILED_MESSAGE));
        assert_eq!(card.poll(t1 + RETRY_STEP), vec![HostCommand::Reload]);

        card.content_ready(t1 + secs(1));
        assert_eq!(card.status().error, None, "a clean load clears the banner");
        assert_eq!(card.status().retry, 0);
    }

    #[test]
    fn test_error_page_keeps_banner_and_streak() {
        let t0 = Instant::now();
        let mut card = ready_card(t0);
        for n in 1..=MAX_RETRIES {
            card.load_failed(t0);
            // The host reports the error page finishing after the failure.
            assert!(card.content_ready(t0).is_empty());
            assert_eq!(card.status().retry, n);
            assert!(card.status().error.is_some());
            card.poll(t0 + secs(10));
        }

        card.load_failed(t0 + secs(20));
        card.content_ready(t0 + secs(20));
        assert_eq!(card.status().retry, MAX_RETRIES);
        assert!(card.poll(t0 + secs(25)).is_empty());
    }

    #[rstest]
    #[case(1, 1)]
    #[case(5, 5)]
    #[case(8, 5)]
    fn test_retry_is_capped(#[case] failures: u32, #[case] expected: u32) {
        let t0 = Instant::now();
        let mut card = ready_card(t0);
        for _ in 0..failures {
            card.load_failed(t0);
        }
        assert_eq!(card.status().retry, expected);
    }

    #[test]
    fn test_no_reload_after_retries_exhausted() {
        let t0 = Instant::now();
        let mut card = ready_card(t0);
        for _ in 0..MAX_RETRIES {
            card.load_failed(t0);
            card.poll(t0 + secs(10));
        }
        card.load_failed(t0 + secs(20));
        assert!(card.poll(t0 + secs(25)).is_empty());
        assert!(card.status().error.is_some());
    }

    #[test]
    fn test_clean_load_resets_streak() {
        let t0 = Instant::now();
        let mut card = ready_card(t0);
        card.load_failed(t0);
        card.poll(t0 + secs(1));
        card.content_ready(t0 + secs(2));
        assert_eq!(card.status().retry, 0);
    }

    #[test]
    fn test_network_recovery_reloads_once() {
        let mut card = ready_card(Instant::now());
        assert!(card.set_online(true).is_empty(), "no transition");
        assert!(card.set_online(false).is_empty());
        assert_eq!(card.set_online(true), vec![HostCommand::Reload]);
        assert!(card.set_online(true).is_empty());
    }

    #[test]
    fn test_update_config_repoints_mounted_card() {
        let t0 = Instant::now();
        let mut card = ready_card(t0);

        let mut renamed = config();
        renamed.name = "Renamed".to_string();
        assert!(card.update_config(renamed.clone(), t0).is_empty());

        let mut moved = renamed;
        moved.url = "https://crates.io".to_string();
        let commands = card.update_config(moved, t0);
        assert_eq!(commands[0], HostCommand::SetAddress("https://crates.io".to_string()));
        assert!(!card.status().ready);
    }

    #[test]
    fn test_registry_sync_and_routing() {
        let t0 = Instant::now();
        let mut registry = CardRegistry::new();
        let a = config();
        let mut b = config();
        b.id = "c2".to_string();

        registry.sync([&a, &b], t0);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.handle("c1", CardEvent::Visible, t0).len(), 4);
        registry.handle("c1", CardEvent::ContentReady, t0);
        assert!(registry.handle("ghost", CardEvent::Visible, t0).is_empty());
        assert_eq!(registry.next_deadline(), Some(t0 + secs(60)));

        assert_eq!(registry.poll(t0 + secs(60)), vec![("c1".to_string(), HostCommand::Reload)]);

        registry.set_online(false);
        assert_eq!(
            registry.set_online(true),
            vec![("c1".to_string(), HostCommand::Reload)]
        );

        registry.sync([&b], t0);
        assert_eq!(registry.status("c1"), None);
        assert_eq!(registry.statuses().len(), 1);
    }

    #[rstest]
    #[case("https://docs.rs/", false)]
    #[case("http://localhost:8080/app", false)]
    #[case("about:blank", true)]
    #[case("chrome-error://chromewebdata/", true)]
    #[case("edge-error://chromewebdata/", true)]
    #[case("not a url", true)]
    fn test_error_page_detection(#[case] loaded: &str, #[case] expected: bool) {
        assert_eq!(is_error_page(loaded), expected);
    }

    #[test]
    fn test_card_event_deserializes() {
        let event: CardEvent = serde_json::from_str("\"contentReady\"").unwrap();
        assert_eq!(event, CardEvent::ContentReady);
    }
}
