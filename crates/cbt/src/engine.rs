//! Bitmap finalization across the file/image backup alternation

use crate::backend::CbtBackend;
use crate::bitmap::BitmapData;
use crate::files::{cbt_file_name, read_merge, save_merge, sidecar_file_name};
use crate::{BLOCK_SIZE, FILE_SIDECAR_RECORD, SHA256_SIZE};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Change-block-tracking engine for one data directory.
///
/// The two `.cbt` files of a volume partition unseen changes: finishing a
/// file backup banks the merged bitmap for the next image backup and
/// consumes the pending file bitmap, and vice versa. Hash sidecar entries
/// covered by a set bit are stale and zeroed before the bitmap is consumed.
pub struct CbtEngine {
    backend: Arc<dyn CbtBackend>,
    data_dir: PathBuf,
    shadow_ids: Mutex<HashMap<String, i32>>,
    sequence_ids: Mutex<HashMap<String, i64>>,
}

impl CbtEngine {
    pub fn new(backend: Arc<dyn CbtBackend>, data_dir: &Path) -> Self {
        Self {
            backend,
            data_dir: data_dir.to_path_buf(),
            shadow_ids: Mutex::new(HashMap::new()),
            sequence_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self, volume: &str) -> bool {
        self.backend.is_supported(volume)
    }

    /// Last shadow id written to a volume's image sidecar.
    pub fn shadow_id(&self, volume: &str) -> Option<i32> {
        self.shadow_ids.lock().get(volume).copied()
    }

    /// Sidecar sequence id of a volume, bumped on every file-backup finish.
    pub fn sequence_id(&self, volume: &str) -> i64 {
        self.sequence_ids.lock().get(volume).copied().unwrap_or(0)
    }

    /// Finalize tracking for a backup of `volume`.
    ///
    /// Retrieves the live bitmap (plus the snapshot's bitmap when given,
    /// which is re-applied to the live tracker), persists the union for the
    /// *other* backup kind, consumes the pending bitmap of this kind, zeroes
    /// stale sidecar entries and rearms tracking.
    pub fn finish(
        &self,
        volume: &str,
        shadow_id: i32,
        snap_volume: Option<&str>,
        for_image: bool,
    ) -> Result<()> {
        self.backend.flush_volume(volume)?;

        let mut bitmap = self.backend.retrieve_bitmap(volume)?;
        bitmap.validate()?;

        if let Some(snap) = snap_volume.filter(|s| !s.is_empty()) {
            let snap_bitmap = self.backend.retrieve_bitmap(snap)?;
            snap_bitmap.validate()?;
            bitmap.or_merge(&snap_bitmap)?;
            self.backend.apply_bitmap(volume, &snap_bitmap)?;

            tracing::debug!(
                "Tracking reports {} changed blocks on snapshot {}",
                snap_bitmap.count_set(),
                snap
            );
        }

        let length = self.backend.volume_length(volume)?;
        let num_blocks = length.div_ceil(BLOCK_SIZE);

        if for_image {
            self.save_pending(volume, false, &bitmap)?;
            read_merge(&cbt_file_name(&self.data_dir, volume, true), &mut bitmap)?;

            self.zero_image_sidecar(volume, shadow_id, &bitmap, num_blocks)?;
            self.shadow_ids
                .lock()
                .insert(volume.to_string(), shadow_id);

            fs::remove_file(cbt_file_name(&self.data_dir, volume, true)).ok();
        } else {
            self.save_pending(volume, true, &bitmap)?;
            read_merge(&cbt_file_name(&self.data_dir, volume, false), &mut bitmap)?;

            *self
                .sequence_ids
                .lock()
                .entry(volume.to_string())
                .or_insert(0) += 1;

            self.zero_file_sidecar(volume, &bitmap, num_blocks)?;

            fs::remove_file(cbt_file_name(&self.data_dir, volume, false)).ok();
        }

        self.backend.reset_finish(volume)?;
        tracing::info!("Change block tracking active on volume {}", volume);
        Ok(())
    }

    /// Take one bitmap sample and bank it without running a backup.
    pub fn snapshot_cbt(&self, volume: &str) -> Result<()> {
        self.finish(volume, -1, None, false)
    }

    /// Persist the bitmap for the other backup kind. An empty bitmap with no
    /// existing file is skipped so a clean alternation leaves nothing behind.
    fn save_pending(&self, volume: &str, for_image: bool, bitmap: &BitmapData) -> Result<()> {
        let path = cbt_file_name(&self.data_dir, volume, for_image);
        if bitmap.count_set() == 0 && !path.exists() {
            return Ok(());
        }
        save_merge(&path, bitmap)
    }

    fn zero_image_sidecar(
        &self,
        volume: &str,
        shadow_id: i32,
        bitmap: &BitmapData,
        num_blocks: u64,
    ) -> Result<()> {
        let path = sidecar_file_name(&self.data_dir, volume, true);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Cannot open image hash data file {}", path.display()))?;

        file.set_len(4 + num_blocks * SHA256_SIZE as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&shadow_id.to_le_bytes())?;

        tracing::debug!("Zeroing image hash data of volume {}...", volume);

        let zero = [0u8; SHA256_SIZE];
        for block in set_blocks(bitmap, num_blocks) {
            file.seek(SeekFrom::Start(4 + block * SHA256_SIZE as u64))?;
            file.write_all(&zero)?;
        }

        file.sync_all()?;
        Ok(())
    }

    fn zero_file_sidecar(&self, volume: &str, bitmap: &BitmapData, num_blocks: u64) -> Result<()> {
        let path = sidecar_file_name(&self.data_dir, volume, false);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Cannot open file hash data file {}", path.display()))?;

        file.set_len(num_blocks * FILE_SIDECAR_RECORD as u64)?;

        tracing::debug!("Zeroing file hash data of volume {}...", volume);

        let zero = [0u8; FILE_SIDECAR_RECORD];
        let mut prev_set = false;
        for block in 0..num_blocks {
            let set = bitmap.block_set(block);
            if set {
                // Chunk records straddle block boundaries; the record before
                // the first bit of a run may cover part of the change.
                if !prev_set && block > 0 {
                    zero_record(&mut file, block - 1, &zero)?;
                }
                zero_record(&mut file, block, &zero)?;
            }
            prev_set = set;
        }

        file.sync_all()?;
        Ok(())
    }

    /// Delete all tracking state of a volume; called when a backup proceeds
    /// without a usable snapshot or tracking data is corrupt.
    pub fn disable(&self, volume: &str) -> Result<()> {
        for for_image in [false, true] {
            fs::remove_file(cbt_file_name(&self.data_dir, volume, for_image)).ok();
            fs::remove_file(sidecar_file_name(&self.data_dir, volume, for_image)).ok();
        }
        self.shadow_ids.lock().remove(volume);
        self.sequence_ids.lock().remove(volume);
        tracing::info!("Change block tracking disabled for volume {}", volume);
        Ok(())
    }

    /// Reconcile which volumes are tracked: arm tracking where supported,
    /// drop sidecars where not.
    pub fn update_enabled(&self, volumes: &[String]) -> Result<Vec<String>> {
        let mut enabled = Vec::new();
        for volume in volumes {
            if self.backend.is_supported(volume) {
                self.backend.reset_start(volume)?;
                enabled.push(volume.clone());
            } else {
                self.disable(volume)?;
            }
        }
        Ok(enabled)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn zero_record(file: &mut fs::File, block: u64, zero: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(block * FILE_SIDECAR_RECORD as u64))?;
    file.write_all(zero)?;
    Ok(())
}

fn set_blocks(bitmap: &BitmapData, num_blocks: u64) -> impl Iterator<Item = u64> + '_ {
    (0..num_blocks).filter(move |&b| bitmap.block_set(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemCbt;
    use tempfile::TempDir;

    const SECTOR: u32 = 64;

    fn engine(blocks: u64) -> (CbtEngine, Arc<MemCbt>, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemCbt::new());
        backend.add_volume("C", blocks * BLOCK_SIZE, SECTOR);
        let engine = CbtEngine::new(backend.clone(), dir.path());
        (engine, backend, dir)
    }

    fn fill_sidecar(dir: &Path, volume: &str, for_image: bool, records: u64) {
        let record = if for_image { SHA256_SIZE } else { FILE_SIDECAR_RECORD };
        let header = if for_image { 4 } else { 0 };
        let mut data = vec![0xabu8; header + records as usize * record];
        if for_image {
            data[..4].copy_from_slice(&1i32.to_le_bytes());
        }
        fs::write(sidecar_file_name(dir, volume, for_image), data).unwrap();
    }

    #[test]
    fn test_finish_image_zeroes_marked_slot_only() -> Result<()> {
        let (engine, backend, dir) = engine(100);
        fill_sidecar(dir.path(), "C", true, 100);

        backend.mark_block("C", 42);
        engine.finish("C", 7, None, true)?;

        let data = fs::read(sidecar_file_name(dir.path(), "C", true))?;
        assert_eq!(&data[..4], &7i32.to_le_bytes());

        let slot = |b: usize| &data[4 + b * SHA256_SIZE..4 + (b + 1) * SHA256_SIZE];
        assert_eq!(slot(42), &[0u8; SHA256_SIZE]);
        assert_eq!(slot(41), &[0xabu8; SHA256_SIZE]);
        assert_eq!(slot(43), &[0xabu8; SHA256_SIZE]);

        // The union was banked for the next file backup; the image side was
        // consumed.
        assert!(cbt_file_name(dir.path(), "C", false).exists());
        assert!(!cbt_file_name(dir.path(), "C", true).exists());
        assert_eq!(engine.shadow_id("C"), Some(7));
        Ok(())
    }

    #[test]
    fn test_alternation_consumes_both_bitmaps() -> Result<()> {
        let (engine, backend, dir) = engine(100);
        fill_sidecar(dir.path(), "C", true, 100);
        fill_sidecar(dir.path(), "C", false, 100);

        backend.mark_block("C", 42);
        engine.finish("C", 7, None, true)?;
        engine.finish("C", -1, None, false)?;

        // Both pending bitmaps are gone and tracking was rearmed twice.
        assert!(!cbt_file_name(dir.path(), "C", false).exists());
        assert!(!cbt_file_name(dir.path(), "C", true).exists());
        assert_eq!(backend.rearm_count("C"), 2);

        // The file sidecar lost slot 42 and its predecessor (record overlap
        // guard); the others survived.
        let data = fs::read(sidecar_file_name(dir.path(), "C", false))?;
        let slot =
            |b: usize| &data[b * FILE_SIDECAR_RECORD..(b + 1) * FILE_SIDECAR_RECORD];
        assert_eq!(slot(42), &[0u8; FILE_SIDECAR_RECORD]);
        assert_eq!(slot(41), &[0u8; FILE_SIDECAR_RECORD]);
        assert_eq!(slot(40), &[0xabu8; FILE_SIDECAR_RECORD]);
        assert_eq!(slot(43), &[0xabu8; FILE_SIDECAR_RECORD]);

        assert_eq!(engine.sequence_id("C"), 1);
        Ok(())
    }

    #[test]
    fn test_snapshot_bitmap_merges_and_reapplies() -> Result<()> {
        let (engine, backend, dir) = engine(50);
        backend.add_volume("snap_C", 50 * BLOCK_SIZE, SECTOR);
        fill_sidecar(dir.path(), "C", false, 50);

        backend.mark_block("C", 1);
        backend.mark_block("snap_C", 5);

        engine.finish("C", -1, Some("snap_C"), false)?;

        let data = fs::read(sidecar_file_name(dir.path(), "C", false))?;
        let slot =
            |b: usize| &data[b * FILE_SIDECAR_RECORD..(b + 1) * FILE_SIDECAR_RECORD];
        assert_eq!(slot(1), &[0u8; FILE_SIDECAR_RECORD]);
        assert_eq!(slot(5), &[0u8; FILE_SIDECAR_RECORD]);
        assert_eq!(slot(10), &[0xabu8; FILE_SIDECAR_RECORD]);

        // The union of live and snapshot bits was banked for the next
        // image backup.
        let banked = crate::files::read_bitmap(&cbt_file_name(dir.path(), "C", true))?;
        assert!(banked.block_set(1));
        assert!(banked.block_set(5));
        Ok(())
    }

    #[test]
    fn test_corrupt_pending_bitmap_fails_finish() -> Result<()> {
        let (engine, backend, dir) = engine(10);

        backend.mark_block("C", 2);
        engine.finish("C", 3, None, true)?; // banks hdat_file_C.cbt

        // Corrupt the banked bitmap.
        let path = cbt_file_name(dir.path(), "C", false);
        let mut raw = fs::read(&path)?;
        raw[20] ^= 0xff;
        fs::write(&path, raw)?;

        backend.mark_block("C", 3);
        assert!(engine.finish("C", -1, None, false).is_err());
        Ok(())
    }

    #[test]
    fn test_disable_removes_state() -> Result<()> {
        let (engine, backend, dir) = engine(10);
        backend.mark_block("C", 1);
        engine.finish("C", 5, None, true)?;

        engine.disable("C")?;
        assert!(!cbt_file_name(dir.path(), "C", false).exists());
        assert!(!sidecar_file_name(dir.path(), "C", true).exists());
        assert_eq!(engine.shadow_id("C"), None);
        Ok(())
    }
}
