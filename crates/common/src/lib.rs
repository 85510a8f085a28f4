//! visreg Common Library
//!
//! Shared data model, error taxonomy and blob storage for the visual
//! regression engine and its HTTP/CLI surfaces.

pub mod blob;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use blob::{BlobRef, BlobStore, FsBlobStore, MemoryBlobStore};
pub use error::{DriverError, Error, Result};
pub use types::*;

/// visreg version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".visreg")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
