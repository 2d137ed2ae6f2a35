// Layout/card store - the in-memory source of truth for every layout and for
// which one is current.
//
// Mutations are expressed as `LayoutAction`s and applied by `apply`, a pure
// function over `LayoutsDocument`. `LayoutStore` wraps it with locking,
// debounced persistence and the one-time hydration step.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::error::{Result, StoreError};
use crate::modules::debounce::Debouncer;
use crate::modules::model::{CardConfig, GridLayoutItem, Layout, LayoutsDocument};
use crate::modules::repository::{LayoutPatch, LayoutRepository};
use crate::modules::validation::{sanitize_name, DEFAULT_CARD_NAME, DEFAULT_LAYOUT_NAME};

/// Idle window before layout changes are written.
pub const LAYOUT_DEBOUNCE: Duration = Duration::from_millis(400);

/// One store mutation. Ids that an action may need to mint are generated up
/// front, so replaying the action yields the same ids the caller already saw.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutAction {
    Create { id: String, name: String },
    Rename { id: String, name: String },
    Delete { id: String, replacement_id: String },
    Switch { id: String },
    UpdateItems { items: Vec<GridLayoutItem> },
    UpsertCard { card: CardConfig },
    RemoveCard { id: String },
    Reorder { order: Vec<String> },
    Import { doc: LayoutsDocument, replacement_id: String },
}

/// What an applied action asks of the persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Unchanged,
    Debounced(LayoutPatch),
    Immediate(LayoutPatch),
}

impl Outcome {
    pub fn is_changed(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

/// Applies `action` to `doc`. Unknown ids leave `doc` untouched.
pub fn apply(doc: &mut LayoutsDocument, action: LayoutAction) -> Outcome {
    match action {
        LayoutAction::Create { id, name } => {
            let layout = Layout::new(id.clone(), &name);
            doc.layouts.push(layout);
            doc.current_layout_id = Some(id);
            Outcome::Debounced(LayoutPatch::full(doc))
        }

        LayoutAction::Rename { id, name } => {
            let Some(layout) = doc.layouts.iter_mut().find(|l| l.id == id) else {
                return Outcome::Unchanged;
            };
            layout.name = sanitize_name(&name, DEFAULT_LAYOUT_NAME);
            Outcome::Debounced(LayoutPatch::full(doc))
        }

        LayoutAction::Delete { id, replacement_id } => {
            let Some(idx) = doc.layouts.iter().position(|l| l.id == id) else {
                return Outcome::Unchanged;
            };
            doc.layouts.remove(idx);
            ensure_current(doc, replacement_id);
            Outcome::Debounced(LayoutPatch::full(doc))
        }

        LayoutAction::Switch { id } => {
            if doc.current_layout_id.as_deref() == Some(id.as_str())
                || !doc.layouts.iter().any(|l| l.id == id)
            {
                return Outcome::Unchanged;
            }
            doc.current_layout_id = Some(id.clone());
            Outcome::Debounced(LayoutPatch::current(&id))
        }

        LayoutAction::UpdateItems { items } => {
            let Some(layout) = current_layout_mut(doc) else {
                return Outcome::Unchanged;
            };
            layout.items = normalize_items(items);
            Outcome::Debounced(LayoutPatch::layouts(&doc.layouts))
        }

        LayoutAction::UpsertCard { mut card } => {
            let Some(layout) = current_layout_mut(doc) else {
                return Outcome::Unchanged;
            };
            card.name = sanitize_name(&card.name, DEFAULT_CARD_NAME);
            match layout.items.iter_mut().find(|it| it.i == card.id) {
                Some(item) => item.config = card,
                None => layout.items.push(GridLayoutItem::placed(card)),
            }
            Outcome::Debounced(LayoutPatch::layouts(&doc.layouts))
        }

        LayoutAction::RemoveCard { id } => {
            let Some(layout) = current_layout_mut(doc) else {
                return Outcome::Unchanged;
            };
            let before = layout.items.len();
            layout.items.retain(|it| it.i != id);
            if layout.items.len() == before {
                return Outcome::Unchanged;
            }
            Outcome::Debounced(LayoutPatch::layouts(&doc.layouts))
        }

        LayoutAction::Reorder { order } => {
            if reorder_layouts(&mut doc.layouts, &order) {
                Outcome::Debounced(LayoutPatch::layouts(&doc.layouts))
            } else {
                Outcome::Unchanged
            }
        }

        LayoutAction::Import {
            doc: imported,
            replacement_id,
        } => {
            *doc = normalize_document(imported, replacement_id);
            Outcome::Immediate(LayoutPatch::full(doc))
        }
    }
}

fn current_layout_mut(doc: &mut LayoutsDocument) -> Option<&mut Layout> {
    let id = doc.current_layout_id.as_deref()?;
    doc.layouts.iter_mut().find(|l| l.id == id)
}

/// Restores the collection invariants: never empty, and the current id
/// always names an existing layout (falling back to the first one).
fn ensure_current(doc: &mut LayoutsDocument, replacement_id: String) {
    if doc.layouts.is_empty() {
        let layout = Layout::new(replacement_id, DEFAULT_LAYOUT_NAME);
        doc.current_layout_id = Some(layout.id.clone());
        doc.layouts.push(layout);
        return;
    }
    if doc.current_layout().is_none() {
        doc.current_layout_id = Some(doc.layouts[0].id.clone());
    }
}

/// Re-keys every config to its cell id and drops duplicate cells,
/// keeping the first occurrence.
fn normalize_items(items: Vec<GridLayoutItem>) -> Vec<GridLayoutItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|it| seen.insert(it.i.clone()))
        .map(|mut it| {
            if it.config.id != it.i {
                it.config.id = it.i.clone();
            }
            it
        })
        .collect()
}

/// Brings a document from outside (disk, import file) in line with the
/// store invariants without touching card addresses.
fn normalize_document(mut doc: LayoutsDocument, replacement_id: String) -> LayoutsDocument {
    let mut seen = HashSet::new();
    doc.layouts.retain(|layout| seen.insert(layout.id.clone()));
    for layout in &mut doc.layouts {
        layout.name = sanitize_name(&layout.name, DEFAULT_LAYOUT_NAME);
        layout.items = normalize_items(std::mem::take(&mut layout.items));
        for item in &mut layout.items {
            item.config.name = sanitize_name(&item.config.name, DEFAULT_CARD_NAME);
        }
    }
    ensure_current(&mut doc, replacement_id);
    doc
}

/// Rebuilds `layouts` following `new_order`. Returns true if the order changed.
///
/// Algorithm:
/// 1. Map existing layouts by ID for O(1) lookup
/// 2. Rebuild vector based on new_order
/// 3. Append any layouts missing from new_order, in their previous order
fn reorder_layouts(layouts: &mut Vec<Layout>, new_order: &[String]) -> bool {
    if layouts.is_empty() || new_order.is_empty() {
        return false;
    }

    let old_order: Vec<String> = layouts.iter().map(|l| l.id.clone()).collect();

    let mut by_id: HashMap<String, Layout> =
        layouts.drain(..).map(|l| (l.id.clone(), l)).collect();

    let mut reordered = Vec::with_capacity(old_order.len());
    for id in new_order {
        if let Some(layout) = by_id.remove(id) {
            reordered.push(layout);
        }
    }

    // Safety: keep layouts the caller did not mention (prevents data loss)
    for id in &old_order {
        if let Some(layout) = by_id.remove(id) {
            reordered.push(layout);
        }
    }

    let changed = reordered.iter().map(|l| &l.id).ne(old_order.iter());
    *layouts = reordered;
    changed
}

enum Phase {
    /// Actions taken before hydration, replayed over the persisted state.
    Pending(Vec<LayoutAction>),
    Ready,
}

struct GridState {
    doc: LayoutsDocument,
    phase: Phase,
}

pub struct LayoutStore {
    state: Mutex<GridState>,
    repo: LayoutRepository,
    debouncer: Debouncer<LayoutPatch>,
}

impl LayoutStore {
    pub fn new(runtime: Handle, repo: LayoutRepository) -> Self {
        let writer_repo = repo.clone();
        Self {
            state: Mutex::new(GridState {
                doc: LayoutsDocument::default(),
                phase: Phase::Pending(Vec::new()),
            }),
            repo,
            debouncer: Debouncer::new(runtime, LAYOUT_DEBOUNCE, move |patch: LayoutPatch| {
                writer_repo.persist(&patch)
            }),
        }
    }

    /// Applies one action and schedules its write. Before hydration the
    /// action is only recorded for replay; nothing is written yet.
    fn dispatch(&self, action: LayoutAction) -> bool {
        let mut state = self.state.lock();
        if let (Phase::Pending(_), LayoutAction::Import { doc, .. }) = (&state.phase, &action) {
            // Nothing to import over a document that has not loaded yet.
            if doc.layouts.is_empty() {
                log::debug!("[Grid] Ignored empty import before hydration");
                return false;
            }
        }
        let outcome = apply(&mut state.doc, action.clone());
        if !outcome.is_changed() {
            return false;
        }

        if let Phase::Pending(queue) = &mut state.phase {
            log::debug!("[Grid] Queued before hydration: {:?}", action);
            queue.push(action);
            return true;
        }

        // Scheduled under the state lock so pending payloads merge in the
        // same order the actions were applied.
        match outcome {
            Outcome::Debounced(patch) => self.debouncer.schedule(patch),
            Outcome::Immediate(patch) => {
                self.debouncer.schedule(patch);
                self.debouncer.flush();
            }
            Outcome::Unchanged => {}
        }
        true
    }

    /// Creates a layout, makes it current, and returns its id.
    pub fn create_layout(&self, name: &str) -> String {
        let id = Layout::generate_id();
        self.dispatch(LayoutAction::Create {
            id: id.clone(),
            name: name.to_string(),
        });
        log::info!("[Grid] Created layout {}", id);
        id
    }

    pub fn rename_layout(&self, id: &str, name: &str) -> bool {
        self.dispatch(LayoutAction::Rename {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn delete_layout(&self, id: &str) -> bool {
        let deleted = self.dispatch(LayoutAction::Delete {
            id: id.to_string(),
            replacement_id: Layout::generate_id(),
        });
        if deleted {
            log::info!("[Grid] Deleted layout {}", id);
        }
        deleted
    }

    pub fn switch_layout(&self, id: &str) -> bool {
        self.dispatch(LayoutAction::Switch { id: id.to_string() })
    }

    /// Replaces the current layout's cells, typically with the placement
    /// reported by the grid after a drag or resize.
    pub fn update_layout_items(&self, items: Vec<GridLayoutItem>) -> bool {
        self.dispatch(LayoutAction::UpdateItems { items })
    }

    /// Updates the card with `card.id` in the current layout, or appends it
    /// at the default placement when no cell has that id yet.
    pub fn upsert_card(&self, card: CardConfig) -> bool {
        self.dispatch(LayoutAction::UpsertCard { card })
    }

    pub fn remove_card(&self, id: &str) -> bool {
        self.dispatch(LayoutAction::RemoveCard { id: id.to_string() })
    }

    pub fn reorder_layouts(&self, order: Vec<String>) -> bool {
        self.dispatch(LayoutAction::Reorder { order })
    }

    /// Replaces everything and writes immediately.
    pub fn import_all(&self, doc: LayoutsDocument) {
        log::info!("[Grid] Importing {} layouts", doc.layouts.len());
        self.dispatch(LayoutAction::Import {
            doc,
            replacement_id: Layout::generate_id(),
        });
    }

    pub fn export_all(&self) -> LayoutsDocument {
        self.state.lock().doc.clone()
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_all())?)
    }

    /// Parses a layouts file and imports it. A file that does not parse
    /// leaves the store untouched.
    pub fn import_json(&self, text: &str) -> Result<()> {
        let doc: LayoutsDocument =
            serde_json::from_str(text).map_err(|e| StoreError::InvalidImport(e.to_string()))?;
        self.import_all(doc);
        Ok(())
    }

    pub fn current_layout(&self) -> Option<Layout> {
        self.state.lock().doc.current_layout().cloned()
    }

    pub fn current_layout_id(&self) -> Option<String> {
        self.state.lock().doc.current_layout_id.clone()
    }

    pub fn layouts(&self) -> Vec<Layout> {
        self.state.lock().doc.layouts.clone()
    }

    pub fn find_card(&self, id: &str) -> Option<CardConfig> {
        let state = self.state.lock();
        state
            .doc
            .layouts
            .iter()
            .flat_map(|l| l.items.iter())
            .find(|it| it.i == id)
            .map(|it| it.config.clone())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Ready)
    }

    /// Installs the persisted layouts (or a fresh default) and replays any
    /// actions taken while loading. Runs once; later calls return the
    /// current state unchanged.
    pub fn hydrate(&self) -> LayoutsDocument {
        let loaded = self.repo.hydrate();

        let mut state = self.state.lock();
        let queue = match std::mem::replace(&mut state.phase, Phase::Ready) {
            Phase::Pending(queue) => queue,
            Phase::Ready => return state.doc.clone(),
        };

        let from_disk = loaded.is_some();
        let mut doc = match loaded {
            Some(doc) => normalize_document(doc, Layout::generate_id()),
            None => LayoutsDocument::default(),
        };

        let replayed = queue.len();
        let mut immediate = false;
        for action in queue {
            if let Outcome::Immediate(_) = apply(&mut doc, action) {
                immediate = true;
            }
        }
        ensure_current(&mut doc, Layout::generate_id());
        state.doc = doc;

        log::info!(
            "[Grid] Hydrated {} layouts (from disk: {}, replayed: {})",
            state.doc.layouts.len(),
            from_disk,
            replayed
        );

        if replayed > 0 {
            self.debouncer.schedule(LayoutPatch::full(&state.doc));
            if immediate {
                self.debouncer.flush();
            }
        }
        state.doc.clone()
    }

    /// Writes any pending change now. Called on shutdown.
    pub fn flush(&self) -> bool {
        self.debouncer.flush()
    }
}
