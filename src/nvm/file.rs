//! File-backed NVM
//!
//! One pretty-printed JSON image per key store in a directory. Each save goes to a
//! temporary file that is then renamed over the old image, so a crash leaves either
//! the previous or the new image, never a mix.

use super::{NvmError, NvmStore, StoreImage};
use log::{debug, info};
use std::path::{Path, PathBuf};

pub struct FileNvm {
    dir: PathBuf,
}

impl FileNvm {
    /// Open (and create if needed) an NVM directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, NvmError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        info!("NVM directory {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn image_path(&self, store_id: u32) -> PathBuf {
        self.dir.join(format!("store-{:08x}.json", store_id))
    }

    fn parse_id(name: &str) -> Option<u32> {
        let hex_id = name.strip_prefix("store-")?.strip_suffix(".json")?;
        u32::from_str_radix(hex_id, 16).ok()
    }
}

impl NvmStore for FileNvm {
    fn load_image(&self, store_id: u32) -> Result<Option<StoreImage>, NvmError> {
        let path = self.image_path(store_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        let image: StoreImage = serde_json::from_str(&json)?;
        if image.header.store_id != store_id {
            return Err(NvmError::Corrupted(format!(
                "{} holds store {}",
                path.display(),
                image.header.store_id
            )));
        }
        Ok(Some(image))
    }

    fn save_image(&self, image: &StoreImage) -> Result<(), NvmError> {
        let path = self.image_path(image.header.store_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(image)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(
            "Saved store {} image (counter {}, {} groups)",
            image.header.store_id,
            image.header.counter,
            image.groups.len()
        );
        Ok(())
    }

    fn image_ids(&self) -> Result<Vec<u32>, NvmError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(Self::parse_id) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn erase_all(&self) -> Result<(), NvmError> {
        for id in self.image_ids()? {
            std::fs::remove_file(self.image_path(id))?;
        }
        info!("Erased every key store image in {}", self.dir.display());
        Ok(())
    }
}
