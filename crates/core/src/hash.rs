//! File hashing for the client-side indexer
//!
//! Files are hashed in fixed-size blocks so that the tree-hash variant can
//! reuse the per-block digests as chunk hashes in the CBT hash sidecar.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Block granularity shared between hashing and change block tracking.
pub const BLOCK_SIZE: u64 = 512 * 1024;

/// Size of one chunk hash stored in the file hash sidecar.
pub const CHUNK_HASH_SIZE: usize = 32;

/// Hash algorithm requested by the server for the file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha512,
    /// Block-wise tree hash; per-block digests feed the CBT sidecar.
    TreeHash,
}

impl HashAlgo {
    /// Decode the wire value carried in a start-backup request.
    pub fn from_wire(v: i32) -> Option<Self> {
        match v {
            256 => Some(HashAlgo::Sha256),
            512 => Some(HashAlgo::Sha512),
            528 => Some(HashAlgo::TreeHash),
            _ => None,
        }
    }

    /// Extra key used for this hash in file-list entries.
    pub fn extra_key(&self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
            HashAlgo::TreeHash => "thash",
        }
    }
}

/// Incremental tree hasher.
///
/// Each `BLOCK_SIZE` span of input is digested with SHA-256; the final value
/// is SHA-256 over the concatenated block digests. A file shorter than one
/// block therefore hashes to SHA-256(SHA-256(content)).
pub struct TreeHasher {
    blocks: Vec<[u8; CHUNK_HASH_SIZE]>,
    current: Sha256,
    current_len: u64,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            current: Sha256::new(),
            current_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let remaining = (BLOCK_SIZE - self.current_len) as usize;
            let take = remaining.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take as u64;
            data = &data[take..];

            if self.current_len == BLOCK_SIZE {
                self.finish_block();
            }
        }
    }

    fn finish_block(&mut self) {
        let digest = std::mem::replace(&mut self.current, Sha256::new()).finalize();
        let mut block = [0u8; CHUNK_HASH_SIZE];
        block.copy_from_slice(&digest);
        self.blocks.push(block);
        self.current_len = 0;
    }

    /// Finalize, returning the root digest and the per-block chunk hashes.
    pub fn finalize(mut self) -> (Vec<u8>, Vec<[u8; CHUNK_HASH_SIZE]>) {
        if self.current_len > 0 || self.blocks.is_empty() {
            self.finish_block();
        }

        let mut root = Sha256::new();
        for block in &self.blocks {
            root.update(block);
        }
        (root.finalize().to_vec(), self.blocks)
    }
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a file with the requested algorithm, streaming in `BLOCK_SIZE` reads.
pub fn hash_file(path: &Path, algo: HashAlgo) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;

    let mut buf = vec![0u8; BLOCK_SIZE as usize];

    match algo {
        HashAlgo::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize().to_vec())
        }
        HashAlgo::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize().to_vec())
        }
        HashAlgo::TreeHash => Ok(hash_file_blocks(path)?.0),
    }
}

/// Tree-hash a file, also returning the per-block digests for the sidecar.
pub fn hash_file_blocks(path: &Path) -> Result<(Vec<u8>, Vec<[u8; CHUNK_HASH_SIZE]>)> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;

    let mut hasher = TreeHasher::new();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Hash bytes with SHA-256.
pub fn hash_bytes(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Convert a digest to lowercase hex.
pub fn to_hex(digest: &[u8]) -> String {
    const HEX_CHARS: &[u8] = b"0123456789abcdef";
    let mut hex = String::with_capacity(digest.len() * 2);
    for &byte in digest {
        hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
        hex.push(HEX_CHARS[(byte & 0xf) as usize] as char);
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_hash_algo_wire_values() {
        assert_eq!(HashAlgo::from_wire(256), Some(HashAlgo::Sha256));
        assert_eq!(HashAlgo::from_wire(512), Some(HashAlgo::Sha512));
        assert_eq!(HashAlgo::from_wire(528), Some(HashAlgo::TreeHash));
        assert_eq!(HashAlgo::from_wire(0), None);
    }

    #[test]
    fn test_sha256_file() -> anyhow::Result<()> {
        let mut f = NamedTempFile::new()?;
        f.write_all(b"hello world")?;

        let h = hash_file(f.path(), HashAlgo::Sha256)?;
        assert_eq!(
            to_hex(&h),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        Ok(())
    }

    #[test]
    fn test_tree_hash_single_block_structure() -> anyhow::Result<()> {
        let mut f = NamedTempFile::new()?;
        f.write_all(b"content")?;

        let (root, blocks) = hash_file_blocks(f.path())?;
        assert_eq!(blocks.len(), 1);

        // Root is the digest over the single block digest.
        let expected_block = Sha256::digest(b"content");
        assert_eq!(&blocks[0][..], &expected_block[..]);
        let expected_root = Sha256::digest(expected_block);
        assert_eq!(&root[..], &expected_root[..]);
        Ok(())
    }

    #[test]
    fn test_tree_hash_empty_file_has_one_block() -> anyhow::Result<()> {
        let f = NamedTempFile::new()?;
        let (_, blocks) = hash_file_blocks(f.path())?;
        assert_eq!(blocks.len(), 1);
        Ok(())
    }

    #[test]
    fn test_tree_hasher_block_boundaries() {
        let mut hasher = TreeHasher::new();
        hasher.update(&vec![7u8; BLOCK_SIZE as usize]);
        hasher.update(&vec![9u8; 10]);
        let (_, blocks) = hasher.finalize();
        assert_eq!(blocks.len(), 2);
    }
}
