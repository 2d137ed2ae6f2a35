// Layout and card data model. Field names serialize in camelCase so the
// persisted store and exported files keep the dashboard's established format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::modules::validation::{
    sanitize_name, DEFAULT_CARD_NAME, DEFAULT_LAYOUT_NAME, DEFAULT_REFRESH_SECS,
};

/// Placement given to a card that is inserted without an existing grid cell.
pub const DEFAULT_ITEM_X: i32 = 0;
pub const DEFAULT_ITEM_Y: i32 = 0;
pub const DEFAULT_ITEM_W: i32 = 8;
pub const DEFAULT_ITEM_H: i32 = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Pc,
    Mobile,
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_SECS
}

/// One embedded page: where it points and how it refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardConfig {
    pub id: String,
    pub name: String,
    /// Not validated on write; see `validation::resolve_card_url`.
    pub url: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_factor: Option<f64>,
}

impl CardConfig {
    /// A new card with a generated `card-<uuid>` id and default policies.
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            id: format!("card-{}", Uuid::new_v4()),
            name: sanitize_name(name, DEFAULT_CARD_NAME),
            url: url.to_string(),
            refresh_interval: DEFAULT_REFRESH_SECS,
            access_mode: AccessMode::default(),
            target_selector: None,
            zoom_factor: None,
        }
    }

    /// Selector with blank values treated as unset.
    pub fn selector(&self) -> Option<&str> {
        self.target_selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// One placed cell of the grid. `i` is always the id of `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridLayoutItem {
    pub i: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_draggable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_resizable: Option<bool>,
    pub config: CardConfig,
}

impl GridLayoutItem {
    /// Wraps `config` in a cell at the default placement.
    pub fn placed(config: CardConfig) -> Self {
        Self {
            i: config.id.clone(),
            x: DEFAULT_ITEM_X,
            y: DEFAULT_ITEM_Y,
            w: DEFAULT_ITEM_W,
            h: DEFAULT_ITEM_H,
            is_draggable: None,
            is_resizable: None,
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub items: Vec<GridLayoutItem>,
}

impl Layout {
    pub fn new(id: String, name: &str) -> Self {
        Self {
            id,
            name: sanitize_name(name, DEFAULT_LAYOUT_NAME),
            items: Vec::new(),
        }
    }

    /// Fresh `layout-<uuid>` id.
    pub fn generate_id() -> String {
        format!("layout-{}", Uuid::new_v4())
    }
}

/// The layout collection as persisted and as exported to a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutsDocument {
    pub layouts: Vec<Layout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_layout_id: Option<String>,
}

impl LayoutsDocument {
    pub fn current_layout(&self) -> Option<&Layout> {
        let id = self.current_layout_id.as_deref()?;
        self.layouts.iter().find(|l| l.id == id)
    }
}
