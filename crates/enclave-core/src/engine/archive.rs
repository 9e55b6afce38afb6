//! Package directories.
//!
//! A package is a directory with a manifest and one JSON-encoded [`Pickled`]
//! object per file:
//!
//! ```text
//! package/
//! ├── manifest.json   # {"format": 1, "modules": {"model": ["model.pkl", ...]}}
//! └── model/
//!     ├── model.pkl
//!     └── example.pkl
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::pickle::Pickled;

/// Manifest file name at the package root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Supported manifest format.
pub const FORMAT_VERSION: u32 = 1;

/// Package table of contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Storage key -> object names stored under it.
    #[serde(default)]
    pub modules: BTreeMap<String, BTreeSet<String>>,
}

impl Manifest {
    pub fn new(name: Option<String>) -> Self {
        Self {
            format: FORMAT_VERSION,
            name,
            modules: BTreeMap::new(),
        }
    }

    pub fn contains(&self, key: &str, name: &str) -> bool {
        self.modules.get(key).is_some_and(|names| names.contains(name))
    }
}

/// An opened package directory.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
    manifest: Manifest,
}

impl Archive {
    /// Open the package at `root` and validate its manifest.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest_path = root.join(MANIFEST_FILE);
        let bytes = fs::read(&manifest_path).map_err(|e| {
            Error::load(format!("cannot open package {}: {}", root.display(), e))
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            Error::load(format!("malformed manifest {}: {}", manifest_path.display(), e))
        })?;
        if manifest.format != FORMAT_VERSION {
            return Err(Error::load(format!(
                "package {} uses format {}, expected {}",
                root.display(),
                manifest.format,
                FORMAT_VERSION
            )));
        }
        Ok(Self { root, manifest })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Read object `name` stored under `key`.
    pub fn read(&self, key: &str, name: &str) -> Result<Pickled> {
        if !self.manifest.contains(key, name) {
            return Err(Error::load(format!(
                "{}/{} not found in package {}",
                key,
                name,
                self.root.display()
            )));
        }
        let path = self.root.join(key).join(name);
        let bytes = fs::read(&path)
            .map_err(|e| Error::load(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::load(format!("malformed object {}: {}", path.display(), e)))
    }
}

/// Writes a package directory.
pub struct PackageWriter {
    root: PathBuf,
    manifest: Manifest,
}

impl PackageWriter {
    /// Start a package at `root`, creating the directory if needed.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::load(format!("cannot create {}: {}", root.display(), e)))?;
        Ok(Self {
            root,
            manifest: Manifest::new(None),
        })
    }

    /// Set the package display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.manifest.name = Some(name.into());
        self
    }

    /// Store `object` as `<key>/<name>`.
    pub fn add(&mut self, key: &str, name: &str, object: &Pickled) -> Result<&mut Self> {
        if key.is_empty() || name.is_empty() || key.contains(['/', '\\']) || name.contains(['/', '\\'])
        {
            return Err(Error::load(format!("invalid object path {}/{}", key, name)));
        }
        let dir = self.root.join(key);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::load(format!("cannot create {}: {}", dir.display(), e)))?;
        let bytes = serde_json::to_vec(object)
            .map_err(|e| Error::load(format!("cannot encode {}/{}: {}", key, name, e)))?;
        let path = dir.join(name);
        fs::write(&path, bytes)
            .map_err(|e| Error::load(format!("cannot write {}: {}", path.display(), e)))?;

        self.manifest
            .modules
            .entry(key.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(self)
    }

    /// Write the manifest; the package is loadable afterwards.
    pub fn finish(self) -> Result<PathBuf> {
        let path = self.root.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&self.manifest)
            .map_err(|e| Error::load(format!("cannot encode manifest: {}", e)))?;
        fs::write(&path, bytes)
            .map_err(|e| Error::load(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_open() {
        let temp = TempDir::new().unwrap();
        let mut writer = PackageWriter::create(temp.path().join("pkg")).unwrap().name("demo");
        writer
            .add("model", "value.pkl", &Pickled::Int { value: 7 })
            .unwrap();
        let root = writer.finish().unwrap();

        let archive = Archive::open(&root).unwrap();
        assert_eq!(archive.manifest().name.as_deref(), Some("demo"));
        assert_eq!(
            archive.read("model", "value.pkl").unwrap(),
            Pickled::Int { value: 7 }
        );
    }

    #[test]
    fn test_missing_package() {
        let temp = TempDir::new().unwrap();
        let err = Archive::open(temp.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::LoadFailure(_)));
    }

    #[test]
    fn test_unlisted_object() {
        let temp = TempDir::new().unwrap();
        let root = PackageWriter::create(temp.path()).unwrap().finish().unwrap();
        let archive = Archive::open(root).unwrap();
        assert!(matches!(
            archive.read("some other", "garbage path"),
            Err(Error::LoadFailure(_))
        ));
    }

    #[test]
    fn test_malformed_object() {
        let temp = TempDir::new().unwrap();
        let mut writer = PackageWriter::create(temp.path()).unwrap();
        writer.add("model", "bad.pkl", &Pickled::None).unwrap();
        let root = writer.finish().unwrap();
        fs::write(root.join("model").join("bad.pkl"), b"{not json").unwrap();

        let archive = Archive::open(&root).unwrap();
        assert!(matches!(
            archive.read("model", "bad.pkl"),
            Err(Error::LoadFailure(_))
        ));
    }

    #[test]
    fn test_wrong_format_version() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(MANIFEST_FILE),
            br#"{"format": 99, "modules": {}}"#,
        )
        .unwrap();
        assert!(Archive::open(temp.path()).is_err());
    }

    #[test]
    fn test_rejects_nested_paths() {
        let temp = TempDir::new().unwrap();
        let mut writer = PackageWriter::create(temp.path()).unwrap();
        assert!(writer.add("../escape", "x.pkl", &Pickled::None).is_err());
    }
}
