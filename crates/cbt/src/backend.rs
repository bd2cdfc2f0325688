//! Volume tracker capability
//!
//! The real tracker lives in a platform driver reached through IOCTLs; this
//! trait is the narrow surface the engine needs. `NullCbt` stands in on
//! platforms without a driver, `MemCbt` backs the tests.

use crate::bitmap::BitmapData;
use crate::BLOCK_SIZE;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait CbtBackend: Send + Sync {
    /// Whether tracking is available for this volume.
    fn is_supported(&self, volume: &str) -> bool;

    fn volume_length(&self, volume: &str) -> Result<u64>;

    fn sector_size(&self, volume: &str) -> Result<u32>;

    /// Flush pending writes so the retrieved bitmap covers them.
    fn flush_volume(&self, volume: &str) -> Result<()>;

    /// Begin a tracking generation.
    fn reset_start(&self, volume: &str) -> Result<()>;

    /// Current bitmap of `target` (a volume or a snapshot mount).
    fn retrieve_bitmap(&self, target: &str) -> Result<BitmapData>;

    /// Re-mark the given bits in the live tracker, so changes captured by a
    /// snapshot are not lost when tracking is rearmed.
    fn apply_bitmap(&self, volume: &str, bitmap: &BitmapData) -> Result<()>;

    /// Rearm tracking after a successful finish.
    fn reset_finish(&self, volume: &str) -> Result<()>;

    /// Mark every block changed (used when tracking state is untrusted).
    fn mark_all(&self, volume: &str) -> Result<()>;
}

/// Backend for platforms without a tracking driver.
pub struct NullCbt;

impl CbtBackend for NullCbt {
    fn is_supported(&self, _volume: &str) -> bool {
        false
    }

    fn volume_length(&self, volume: &str) -> Result<u64> {
        bail!("no change block tracking for volume {}", volume)
    }

    fn sector_size(&self, volume: &str) -> Result<u32> {
        bail!("no change block tracking for volume {}", volume)
    }

    fn flush_volume(&self, _volume: &str) -> Result<()> {
        Ok(())
    }

    fn reset_start(&self, volume: &str) -> Result<()> {
        bail!("no change block tracking for volume {}", volume)
    }

    fn retrieve_bitmap(&self, target: &str) -> Result<BitmapData> {
        bail!("no change block tracking for volume {}", target)
    }

    fn apply_bitmap(&self, volume: &str, _bitmap: &BitmapData) -> Result<()> {
        bail!("no change block tracking for volume {}", volume)
    }

    fn reset_finish(&self, volume: &str) -> Result<()> {
        bail!("no change block tracking for volume {}", volume)
    }

    fn mark_all(&self, volume: &str) -> Result<()> {
        bail!("no change block tracking for volume {}", volume)
    }
}

struct MemVolume {
    length: u64,
    sector_size: u32,
    live: BitmapData,
    rearm_count: u64,
}

/// In-memory tracker used by tests. Targets registered with
/// [`MemCbt::add_volume`] behave like tracked volumes; snapshot mounts can
/// be registered the same way and given their own bits.
#[derive(Default)]
pub struct MemCbt {
    volumes: Mutex<HashMap<String, MemVolume>>,
}

impl MemCbt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, name: &str, length: u64, sector_size: u32) {
        let payload = payload_bytes_for(length);
        self.volumes.lock().insert(
            name.to_string(),
            MemVolume {
                length,
                sector_size,
                live: BitmapData::with_payload_capacity(payload, sector_size),
                rearm_count: 0,
            },
        );
    }

    /// Simulate a write to a block of a volume.
    pub fn mark_block(&self, name: &str, block: u64) {
        let mut volumes = self.volumes.lock();
        let vol = volumes.get_mut(name).expect("unknown mem volume");
        vol.live.set_block(block);
    }

    pub fn rearm_count(&self, name: &str) -> u64 {
        self.volumes.lock().get(name).map(|v| v.rearm_count).unwrap_or(0)
    }
}

fn payload_bytes_for(length: u64) -> usize {
    let blocks = length.div_ceil(BLOCK_SIZE);
    blocks.div_ceil(8) as usize
}

impl CbtBackend for MemCbt {
    fn is_supported(&self, volume: &str) -> bool {
        self.volumes.lock().contains_key(volume)
    }

    fn volume_length(&self, volume: &str) -> Result<u64> {
        match self.volumes.lock().get(volume) {
            Some(v) => Ok(v.length),
            None => bail!("unknown volume {}", volume),
        }
    }

    fn sector_size(&self, volume: &str) -> Result<u32> {
        match self.volumes.lock().get(volume) {
            Some(v) => Ok(v.sector_size),
            None => bail!("unknown volume {}", volume),
        }
    }

    fn flush_volume(&self, _volume: &str) -> Result<()> {
        Ok(())
    }

    fn reset_start(&self, volume: &str) -> Result<()> {
        if !self.is_supported(volume) {
            bail!("unknown volume {}", volume);
        }
        Ok(())
    }

    fn retrieve_bitmap(&self, target: &str) -> Result<BitmapData> {
        match self.volumes.lock().get(target) {
            Some(v) => Ok(v.live.clone()),
            None => bail!("unknown volume {}", target),
        }
    }

    fn apply_bitmap(&self, volume: &str, bitmap: &BitmapData) -> Result<()> {
        let mut volumes = self.volumes.lock();
        match volumes.get_mut(volume) {
            Some(v) => v.live.or_merge(bitmap),
            None => bail!("unknown volume {}", volume),
        }
    }

    fn reset_finish(&self, volume: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        match volumes.get_mut(volume) {
            Some(v) => {
                let payload = payload_bytes_for(v.length);
                v.live = BitmapData::with_payload_capacity(payload, v.sector_size);
                v.rearm_count += 1;
                Ok(())
            }
            None => bail!("unknown volume {}", volume),
        }
    }

    fn mark_all(&self, volume: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        match volumes.get_mut(volume) {
            Some(v) => {
                let blocks = v.length.div_ceil(BLOCK_SIZE);
                for b in 0..blocks {
                    v.live.set_block(b);
                }
                Ok(())
            }
            None => bail!("unknown volume {}", volume),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_cbt_tracks_and_rearms() -> Result<()> {
        let cbt = MemCbt::new();
        cbt.add_volume("/", 10 * BLOCK_SIZE, 64);

        assert!(cbt.is_supported("/"));
        assert!(!cbt.is_supported("/other"));

        cbt.mark_block("/", 3);
        let bm = cbt.retrieve_bitmap("/")?;
        assert!(bm.block_set(3));

        cbt.reset_finish("/")?;
        let bm = cbt.retrieve_bitmap("/")?;
        assert!(!bm.block_set(3));
        assert_eq!(cbt.rearm_count("/"), 1);
        Ok(())
    }

    #[test]
    fn test_mem_cbt_apply_bitmap() -> Result<()> {
        let cbt = MemCbt::new();
        cbt.add_volume("/", 10 * BLOCK_SIZE, 64);

        let mut extra = cbt.retrieve_bitmap("/")?;
        extra.set_block(7);
        cbt.apply_bitmap("/", &extra)?;

        assert!(cbt.retrieve_bitmap("/")?.block_set(7));
        Ok(())
    }

    #[test]
    fn test_null_cbt_unsupported() {
        let cbt = NullCbt;
        assert!(!cbt.is_supported("/"));
        assert!(cbt.retrieve_bitmap("/").is_err());
    }
}
