use std::path::PathBuf;

/// Errors raised by the persistence layer and the import path.
///
/// Store operations themselves never fail; these only surface from the
/// key/value backend (where the repository swallows and records them) and
/// from explicit user actions such as importing a file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access store file at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode or decode store data: {0}")]
    Json(#[from] serde_json::Error),

    /// The user picked a file that is not a layouts document.
    #[error("invalid layouts file: {0}")]
    InvalidImport(String),

    #[error("no application data directory available")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, StoreError>;
