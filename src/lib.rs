// GridCards library entry point.
// Everything here is free of Tauri so the stores, repository and card runtime
// can be built and tested headless; the desktop shell lives in main.rs.

pub mod error;
pub mod settings;

// Shared state
pub mod state;

// Pure logic modules
pub mod modules;
