// Theme and font-scale side effects, and the live OS dark/light signal.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::modules::validation::font_scale_percent;
use crate::settings::ThemeMode;

/// Where appearance changes land: the window chrome and the frontend.
pub trait AppearanceSink: Send + Sync {
    fn set_dark(&self, dark: bool);
    fn set_font_scale(&self, percent: u32);
}

/// Sink for running without a window.
pub struct NoopAppearance;

impl AppearanceSink for NoopAppearance {
    fn set_dark(&self, _dark: bool) {}
    fn set_font_scale(&self, _percent: u32) {}
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Current OS color-scheme preference, fed by the shell's window events.
pub struct SystemThemeSignal {
    dark: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl SystemThemeSignal {
    pub fn new(initial_dark: bool) -> Arc<Self> {
        Arc::new(Self {
            dark: AtomicBool::new(initial_dark),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn is_dark(&self) -> bool {
        self.dark.load(Ordering::SeqCst)
    }

    /// Records a new OS preference and notifies listeners if it changed.
    pub fn publish(&self, dark: bool) {
        if self.dark.swap(dark, Ordering::SeqCst) == dark {
            return;
        }
        // Call outside the lock so listeners may subscribe or unsubscribe.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(dark);
        }
    }

    /// Registers `listener` until the returned handle is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            signal: Arc::downgrade(self),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    signal: Weak<SystemThemeSignal>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Applies theme and font scale immediately. In `System` mode it follows the
/// OS signal through a single subscription, replaced on every call.
pub struct ThemeApplier {
    sink: Arc<dyn AppearanceSink>,
    signal: Arc<SystemThemeSignal>,
    system_sub: Mutex<Option<Subscription>>,
}

impl ThemeApplier {
    pub fn new(sink: Arc<dyn AppearanceSink>, signal: Arc<SystemThemeSignal>) -> Self {
        Self {
            sink,
            signal,
            system_sub: Mutex::new(None),
        }
    }

    pub fn apply_theme(&self, mode: ThemeMode) {
        let mut system_sub = self.system_sub.lock();
        // Tear down before anything else; never two live subscriptions.
        system_sub.take();

        match mode {
            ThemeMode::System => {
                self.sink.set_dark(self.signal.is_dark());
                let sink = Arc::clone(&self.sink);
                *system_sub = Some(self.signal.subscribe(move |dark| sink.set_dark(dark)));
            }
            ThemeMode::Dark => self.sink.set_dark(true),
            ThemeMode::Light => self.sink.set_dark(false),
        }
    }

    pub fn apply_font_scale(&self, scale: f64) {
        self.sink.set_font_scale(font_scale_percent(scale));
    }

    pub fn is_following_system(&self) -> bool {
        self.system_sub.lock().is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Applied {
        Dark(bool),
        Scale(u32),
    }

    /// Records every side effect, in order.
    #[derive(Default)]
    pub(crate) struct RecordingAppearance {
        pub(crate) applied: Mutex<Vec<Applied>>,
    }

    impl RecordingAppearance {
        pub(crate) fn take(&self) -> Vec<Applied> {
            std::mem::take(&mut *self.applied.lock())
        }
    }

    impl AppearanceSink for RecordingAppearance {
        fn set_dark(&self, dark: bool) {
            self.applied.lock().push(Applied::Dark(dark));
        }
        fn set_font_scale(&self, percent: u32) {
            self.applied.lock().push(Applied::Scale(percent));
        }
    }

    fn applier(initial_dark: bool) -> (ThemeApplier, Arc<RecordingAppearance>, Arc<SystemThemeSignal>) {
        let sink = Arc::new(RecordingAppearance::default());
        let signal = SystemThemeSignal::new(initial_dark);
        let applier = ThemeApplier::new(sink.clone(), Arc::clone(&signal));
        (applier, sink, signal)
    }

    #[test]
    fn test_explicit_modes_ignore_os_changes() {
        let (applier, sink, signal) = applier(false);

        applier.apply_theme(ThemeMode::Dark);
        signal.publish(false);
        signal.publish(true);

        assert_eq!(sink.take(), vec![Applied::Dark(true)]);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_system_mode_follows_os() {
        let (applier, sink, signal) = applier(true);

        applier.apply_theme(ThemeMode::System);
        signal.publish(false);
        signal.publish(false);
        signal.publish(true);

        assert_eq!(
            sink.take(),
            vec![Applied::Dark(true), Applied::Dark(false), Applied::Dark(true)]
        );
        assert!(applier.is_following_system());
    }

    #[test]
    fn test_only_one_system_subscription() {
        let (applier, sink, signal) = applier(false);

        applier.apply_theme(ThemeMode::System);
        applier.apply_theme(ThemeMode::System);
        applier.apply_theme(ThemeMode::System);
        assert_eq!(signal.listener_count(), 1);

        sink.take();
        signal.publish(true);
        assert_eq!(sink.take(), vec![Applied::Dark(true)], "no stacked listeners");
    }

    #[test]
    fn test_leaving_system_tears_down() {
        let (applier, sink, signal) = applier(false);

        applier.apply_theme(ThemeMode::System);
        applier.apply_theme(ThemeMode::Light);
        assert_eq!(signal.listener_count(), 0);
        assert!(!applier.is_following_system());

        sink.take();
        signal.publish(true);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_font_scale_as_percent() {
        let (applier, sink, _) = applier(false);
        applier.apply_font_scale(1.1);
        applier.apply_font_scale(-3.0);
        assert_eq!(sink.take(), vec![Applied::Scale(110), Applied::Scale(100)]);
    }
}
