// Module exports for pure logic
pub mod validation;
pub mod model;
pub mod debounce;            // Write coalescing
pub mod repository;          // Persistence layer
pub mod theme;
pub mod grid_store;          // Layout/card store
pub mod card_runtime;        // Embedded page lifecycle
