//! Stagecraft Core - Foundational types shared by every stagecraft crate
//!
//! - `StagecraftError` / `Result` - the pipeline-wide error taxonomy
//! - `ContentHash` - SHA-256 checksums for downloaded and manifested assets
//! - `atomic_write` - temp-file-then-rename writes for session artifacts
//! - `FileLock` - lock file serializing read-modify-write of an artifact

mod error;
mod fs;
mod hash;

pub use error::{Result, StagecraftError};
pub use fs::{atomic_write, FileLock};
pub use hash::{hex_encode, ContentHash};
