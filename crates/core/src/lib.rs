//! Shared primitives for the backup indexer
//!
//! This crate provides:
//! - File hashing (SHA-256/512 and the block-wise tree hash)
//! - The `FileAndHash` record and change-indicator encoding
//! - File-list escaping helpers
//! - The indexing fault taxonomy
//! - Atomic file writes

pub mod error;
pub mod escape;
pub mod fileinfo;
pub mod fsutil;
pub mod hash;

// Re-exports
pub use error::IndexFault;
pub use fileinfo::{FileAndHash, CHANGE_IND_MASK, CHANGE_IND_SPECIAL, CHANGE_IND_SYMLINK};
pub use hash::{HashAlgo, BLOCK_SIZE, CHUNK_HASH_SIZE};

/// Result type for indexer operations
pub type Result<T> = anyhow::Result<T>;
