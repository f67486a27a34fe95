use crate::corrector::NetMeteredEnergy;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Durable home of the net metered totals
pub trait AccumulatorStore {
    fn load(&mut self) -> Result<NetMeteredEnergy, StoreError>;
    fn store(&mut self, energy: &NetMeteredEnergy) -> Result<(), StoreError>;
}

impl<S: AccumulatorStore + ?Sized> AccumulatorStore for Box<S> {
    fn load(&mut self) -> Result<NetMeteredEnergy, StoreError> {
        (**self).load()
    }

    fn store(&mut self, energy: &NetMeteredEnergy) -> Result<(), StoreError> {
        (**self).store(energy)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    imported_wh: f64,
    exported_wh: f64,
}

/// JSON file store. Writes go to a synced sibling temp file that is renamed into
/// place, then the directory entry is synced too.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Makes the rename itself durable
    #[cfg(unix)]
    fn sync_parent_dir(&self) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| self.io_error(dir, e))
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl AccumulatorStore for JsonFileStore {
    fn load(&mut self) -> Result<NetMeteredEnergy, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(NetMeteredEnergy::default()),
            Err(e) => return Err(self.io_error(&self.path, e)),
        };

        let state: StateFile = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))?;

        for (name, value) in [
            ("imported_wh", state.imported_wh),
            ("exported_wh", state.exported_wh),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(StoreError::Corrupt(format!(
                    "{}: {name} is {value}",
                    self.path.display()
                )));
            }
        }

        Ok(NetMeteredEnergy::new(state.imported_wh, state.exported_wh))
    }

    fn store(&mut self, energy: &NetMeteredEnergy) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&StateFile {
            imported_wh: energy.imported_wh,
            exported_wh: energy.exported_wh,
        })?;

        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path).map_err(|e| self.io_error(&temp_path, e))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| self.io_error(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| self.io_error(&self.path, e))?;
        self.sync_parent_dir()
    }
}

/// In-memory store, with a switch to make writes fail
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub energy: NetMeteredEnergy,
    pub fail_writes: bool,
    pub writes: usize,
}

impl MemoryStore {
    pub fn with_energy(energy: NetMeteredEnergy) -> Self {
        Self {
            energy,
            ..Self::default()
        }
    }
}

impl AccumulatorStore for MemoryStore {
    fn load(&mut self) -> Result<NetMeteredEnergy, StoreError> {
        Ok(self.energy)
    }

    fn store(&mut self, energy: &NetMeteredEnergy) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("simulated write failure".to_string()));
        }
        self.energy = *energy;
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().unwrap(), NetMeteredEnergy::default());
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = JsonFileStore::new(&path);

        store.store(&NetMeteredEnergy::new(1234.5, 67.25)).unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());

        let mut reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.load().unwrap(), NetMeteredEnergy::new(1234.5, 67.25));
    }

    #[test]
    fn test_reload_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("state.json"));

        let mut value = 0.1000123_f64;
        for i in 0..500 {
            value = value * 1.000_372_045_511_861_3 + 1e-7 * i as f64;
            let energy = NetMeteredEnergy::new(value, value * 7.0 / 3.0);
            store.store(&energy).unwrap();
            assert_eq!(store.load().unwrap(), energy, "iteration {i}");
        }

        for energy in [
            NetMeteredEnergy::new(0.10001230000000001, 0.10003720455118613),
            NetMeteredEnergy::new(123_456.789_012_345_67, 1.0 / 3.0),
        ] {
            store.store(&energy).unwrap();
            let loaded = store.load().unwrap();
            assert_eq!(loaded.imported_wh.to_bits(), energy.imported_wh.to_bits());
            assert_eq!(loaded.exported_wh.to_bits(), energy.exported_wh.to_bits());
        }
    }

    #[test]
    fn test_leftover_temp_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(dir.path().join("state.json.tmp"), "{\"imported_wh\": 1").unwrap();

        let mut store = JsonFileStore::new(&path);
        store.store(&NetMeteredEnergy::new(8.0, 2.0)).unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());
        assert_eq!(store.load().unwrap(), NetMeteredEnergy::new(8.0, 2.0));
    }

    #[test]
    fn test_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("state.json"));
        store.store(&NetMeteredEnergy::new(1.0, 2.0)).unwrap();
        store.store(&NetMeteredEnergy::new(3.0, 4.0)).unwrap();
        assert_eq!(store.load().unwrap(), NetMeteredEnergy::new(3.0, 4.0));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        let result = JsonFileStore::new(&path).load();
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_negative_value_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"imported_wh": 10.0, "exported_wh": -1.0}"#).unwrap();

        let result = JsonFileStore::new(&path).load();
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("missing").join("state.json"));
        let result = store.store(&NetMeteredEnergy::new(1.0, 1.0));
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let mut store = MemoryStore::with_energy(NetMeteredEnergy::new(5.0, 1.0));
        store.fail_writes = true;
        assert!(store.store(&NetMeteredEnergy::new(6.0, 1.0)).is_err());
        assert_eq!(store.load().unwrap(), NetMeteredEnergy::new(5.0, 1.0));

        store.fail_writes = false;
        store.store(&NetMeteredEnergy::new(6.0, 1.0)).unwrap();
        assert_eq!(store.writes, 1);
        assert_eq!(store.load().unwrap(), NetMeteredEnergy::new(6.0, 1.0));
    }
}
