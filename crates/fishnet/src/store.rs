//! Named layer storage.
//!
//! Layers are addressed by path. [`GeoJsonStore`] maps a path to a
//! `.geojson` file; [`MemoryStore`] keeps layers in a map and is what the
//! tests run against.

use crate::error::{FishnetError, Result};
use crate::geojson;
use crate::layer::Layer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

pub const LAYER_EXTENSION: &str = "geojson";

/// Persistence for named feature collections.
pub trait LayerStore {
    fn read(&self, path: &Path) -> Result<Layer>;

    /// Create or overwrite.
    fn write(&self, path: &Path, layer: &Layer) -> Result<()>;

    /// Removing a missing layer is not an error.
    fn delete(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

impl<T: LayerStore + ?Sized> LayerStore for &T {
    fn read(&self, path: &Path) -> Result<Layer> {
        (**self).read(path)
    }

    fn write(&self, path: &Path, layer: &Layer) -> Result<()> {
        (**self).write(path, layer)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        (**self).delete(path)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
}

/// Layer name without directory or extension (`data/parks.geojson` -> `parks`).
pub fn base_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A layer called `name` next to `path`, keeping its extension if any.
/// Dots inside `name` are kept as they are.
pub fn sibling(path: &Path, name: &str) -> PathBuf {
    let mut file = OsString::from(name);
    if let Some(ext) = path.extension() {
        file.push(".");
        file.push(ext);
    }
    path.with_file_name(file)
}

/// A layer called `name` inside the interim directory.
pub fn interim(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{LAYER_EXTENSION}"))
}

/// GeoJSON files on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct GeoJsonStore;

impl GeoJsonStore {
    pub fn new() -> Self {
        Self
    }

    /// `parks` and `parks.v2` gain `.geojson`; `parks.geojson` and `parks.json` are used as is.
    fn resolve(path: &Path) -> PathBuf {
        let has_json_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| {
                e.eq_ignore_ascii_case(LAYER_EXTENSION) || e.eq_ignore_ascii_case("json")
            });
        if has_json_ext {
            path.to_path_buf()
        } else {
            let mut file = path.as_os_str().to_owned();
            file.push(".");
            file.push(LAYER_EXTENSION);
            PathBuf::from(file)
        }
    }
}

impl LayerStore for GeoJsonStore {
    fn read(&self, path: &Path) -> Result<Layer> {
        geojson::read_file(Self::resolve(path))
    }

    fn write(&self, path: &Path, layer: &Layer) -> Result<()> {
        geojson::write_file(Self::resolve(path), layer)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let path = Self::resolve(path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FishnetError::Storage { path, source }),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        Self::resolve(path).is_file()
    }
}

/// Layers held in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    layers: Mutex<BTreeMap<PathBuf, Layer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `layer` under `path` and hand the path back.
    pub fn insert(&self, path: impl Into<PathBuf>, layer: Layer) -> PathBuf {
        let path = path.into();
        self.layers.lock().insert(path.clone(), layer);
        path
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.layers.lock().keys().cloned().collect()
    }
}

impl LayerStore for MemoryStore {
    fn read(&self, path: &Path) -> Result<Layer> {
        self.layers
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| FishnetError::LayerNotFound(path.display().to_string()))
    }

    fn write(&self, path: &Path, layer: &Layer) -> Result<()> {
        self.layers.lock().insert(path.to_path_buf(), layer.clone());
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.layers.lock().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.layers.lock().contains_key(path)
    }
}
