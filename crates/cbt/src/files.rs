//! Checksummed persistence of tracking bitmaps
//!
//! Layout: `MD5(16) || u32 bitmap_size || u32 sector_size || bitmap`, the
//! checksum covering everything after itself. Writes stage to `<name>.new`
//! and rename into place.

use crate::bitmap::BitmapData;
use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of a persisted bitmap for a volume: `hdat_file_<vol>.cbt` for the
/// pending file-backup bitmap, `hdat_img_<vol>.cbt` for the image side.
pub fn cbt_file_name(data_dir: &Path, volume: &str, for_image: bool) -> PathBuf {
    let kind = if for_image { "img" } else { "file" };
    data_dir.join(format!("hdat_{}_{}.cbt", kind, conv_filename(volume)))
}

/// Name of a hash sidecar for a volume.
pub fn sidecar_file_name(data_dir: &Path, volume: &str, for_image: bool) -> PathBuf {
    let kind = if for_image { "img" } else { "file" };
    data_dir.join(format!("hdat_{}_{}.dat", kind, conv_filename(volume)))
}

/// Make a volume path safe for use inside a file name.
pub fn conv_filename(volume: &str) -> String {
    volume
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Read and checksum-verify a persisted bitmap.
pub fn read_bitmap(path: &Path) -> Result<BitmapData> {
    let raw = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if raw.len() < 16 + 8 {
        bail!("Bitmap file {} is truncated", path.display());
    }

    let (checksum, payload) = raw.split_at(16);
    let digest = Md5::digest(payload);
    if digest.as_slice() != checksum {
        bail!("Checksum of {} wrong", path.display());
    }

    let bitmap_size = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let sector_size = u32::from_le_bytes(payload[4..8].try_into().unwrap());

    if payload.len() < 8 + bitmap_size {
        bail!("Bitmap file {} is shorter than its header claims", path.display());
    }

    let bitmap = BitmapData {
        sector_size,
        data: payload[8..8 + bitmap_size].to_vec(),
    };
    bitmap.validate()?;
    Ok(bitmap)
}

fn write_bitmap(path: &Path, bitmap: &BitmapData) -> Result<()> {
    let mut payload = Vec::with_capacity(8 + bitmap.data.len());
    payload.extend_from_slice(&(bitmap.data.len() as u32).to_le_bytes());
    payload.extend_from_slice(&bitmap.sector_size.to_le_bytes());
    payload.extend_from_slice(&bitmap.data);

    let digest = Md5::digest(&payload);

    let mut file_bytes = Vec::with_capacity(16 + payload.len());
    file_bytes.extend_from_slice(&digest);
    file_bytes.extend_from_slice(&payload);

    snapdex_core::fsutil::atomic_write(path, &file_bytes)
}

/// Persist `bitmap`, ORing it into whatever the file already holds.
pub fn save_merge(path: &Path, bitmap: &BitmapData) -> Result<()> {
    let merged = if path.exists() {
        let mut on_disk = read_bitmap(path)?;
        on_disk.or_merge(bitmap)?;
        on_disk
    } else {
        bitmap.clone()
    };

    write_bitmap(path, &merged)
}

/// OR a persisted bitmap into `bitmap`. Missing file is not an error.
pub fn read_merge(path: &Path, bitmap: &mut BitmapData) -> Result<()> {
    if !path.exists() {
        tracing::debug!("Bitmap {} does not exist. Nothing to merge.", path.display());
        return Ok(());
    }

    let on_disk = read_bitmap(path)?;
    bitmap.or_merge(&on_disk)
}
