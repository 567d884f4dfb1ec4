use lumen_events::AssetId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::LoadError;
use crate::unit::CompiledUnit;

const UNIT_EXTENSION: &str = "lbc";

/// On-disk compiled unit cache, sharded into subdirectories by a fixed-length
/// prefix of the asset id.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    prefix_len: usize,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, prefix_len: usize) -> Self {
        Self {
            root: root.into(),
            prefix_len: prefix_len.clamp(1, 32),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, asset_id: AssetId) -> PathBuf {
        let name = asset_id.0.simple().to_string();
        self.root
            .join(&name[..self.prefix_len])
            .join(format!("{}.{}", name, UNIT_EXTENSION))
    }

    /// Load a cached unit. A missing file is a miss; an unreadable one is
    /// deleted and also treated as a miss.
    pub fn load(&self, asset_id: AssetId) -> Result<Option<CompiledUnit>, LoadError> {
        let path = self.path_for(asset_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LoadError::CacheIo { path, source }),
        };

        match CompiledUnit::from_bytes(asset_id, &bytes) {
            Ok(unit) => Ok(Some(unit)),
            Err(e) => {
                warn!(target: "loader", "Dropping unreadable cache entry {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    pub fn store(&self, unit: &CompiledUnit) -> Result<(), LoadError> {
        let path = self.path_for(unit.asset_id);
        let io_err = |source| LoadError::CacheIo {
            path: path.clone(),
            source,
        };

        let bytes = unit.to_bytes().map_err(|e| LoadError::CorruptUnit {
            asset: unit.asset_id,
            reason: e.to_string(),
        })?;
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard).map_err(io_err)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(target: "loader", "Cached compiled unit {}", path.display());
        Ok(())
    }

    /// Shard directories and how many units each holds
    pub fn shards(&self) -> io::Result<Vec<(String, usize)>> {
        let mut shards = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(shards),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let units = fs::read_dir(entry.path())?
                .filter_map(Result::ok)
                .filter(|e| {
                    e.path().extension().and_then(|x| x.to_str()) == Some(UNIT_EXTENSION)
                })
                .count();
            shards.push((entry.file_name().to_string_lossy().into_owned(), units));
        }
        shards.sort();
        Ok(shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Compiler;
    use crate::vm::Assembler;
    use tempfile::TempDir;

    const SOURCE: &str = "@state default\n@on touch\nsay hi\n";

    #[test]
    fn test_store_then_load_uses_shard_directory() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path(), 3);
        let asset = AssetId::from_source(SOURCE);
        let unit = Assembler.compile(asset, SOURCE.as_bytes()).unwrap();

        assert!(cache.load(asset).unwrap().is_none());
        cache.store(&unit).unwrap();

        let path = cache.path_for(asset);
        let shard = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(shard, &asset.0.simple().to_string()[..3]);
        assert_eq!(cache.load(asset).unwrap(), Some(unit));
        assert_eq!(cache.shards().unwrap(), vec![(shard.to_string(), 1)]);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path(), 2);
        let asset = AssetId::from_source(SOURCE);
        let path = cache.path_for(asset);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"garbage").unwrap();

        assert!(cache.load(asset).unwrap().is_none());
        assert!(!path.exists());
    }
}
