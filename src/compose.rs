//! Orchestration document model: the compose-style manifest shared with the container
//! tool and with later invocations of this CLI.
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{atomic::write_atomic, constants::MANIFEST_LOCK_SUFFIX, error::ManifestError};

/// One container entry. `container_name` is the join key for merge and removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: String,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub restart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ServiceSpec {
    /// Named volumes referenced by this spec (bind mounts excluded).
    pub fn named_volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().filter_map(|entry| {
            let source = volume_source(entry)?;
            is_named_volume(source).then_some(source)
        })
    }

    /// Tag portion of the image reference, if any.
    pub fn image_tag(&self) -> Option<&str> {
        let (repo, tag) = self.image.rsplit_once(':')?;
        (!tag.contains('/') && !repo.is_empty()).then_some(tag)
    }
}

/// Top-level named volume declaration. Always serialised as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {}

/// In-memory form of a manifest file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeDocument {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeSpec>,
}

impl ComposeDocument {
    /// Reads the manifest at `path`. A missing file is an empty document.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ManifestError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&contents).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`load`](Self::load) but a corrupt manifest is discarded; it is regenerated
    /// from configuration anyway.
    pub fn load_or_discard(path: &Path) -> Result<Self, ManifestError> {
        match Self::load(path) {
            Err(ManifestError::Parse { path, source }) => {
                warn!(
                    "Discarding unreadable manifest {} ({source}); it will be regenerated",
                    path.display()
                );
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// True when no service is declared.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Finds the key and spec holding `container_name`.
    pub fn find(&self, container_name: &str) -> Option<(&str, &ServiceSpec)> {
        self.services
            .iter()
            .find(|(_, spec)| spec.container_name == container_name)
            .map(|(key, spec)| (key.as_str(), spec))
    }

    /// Inserts `spec` under `key`, replacing whatever entry already owned the same
    /// container name. Other entries are left untouched.
    pub fn upsert_service(&mut self, key: &str, spec: ServiceSpec) {
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|(existing, s)| {
                existing.as_str() != key && s.container_name == spec.container_name
            })
            .map(|(existing, _)| existing.clone())
            .collect();
        for existing in stale {
            debug!("Replacing manifest entry '{existing}' with '{key}'");
            self.remove_by_key(&existing);
        }

        if let Some(previous) = self.services.insert(key.to_string(), spec.clone()) {
            self.prune_volumes(&previous);
        }

        for volume in spec.named_volumes() {
            self.volumes.entry(volume.to_string()).or_default();
        }
    }

    /// Removes the service owning `container_name` and any named volume only it used.
    /// Returns the removed spec.
    pub fn remove_service(&mut self, container_name: &str) -> Option<ServiceSpec> {
        let key = self.find(container_name)?.0.to_string();
        self.remove_by_key(&key)
    }

    fn remove_by_key(&mut self, key: &str) -> Option<ServiceSpec> {
        let removed = self.services.remove(key)?;
        self.prune_volumes(&removed);
        Some(removed)
    }

    fn prune_volumes(&mut self, removed: &ServiceSpec) {
        for volume in removed.named_volumes() {
            let still_used = self
                .services
                .values()
                .any(|spec| spec.named_volumes().any(|v| v == volume));
            if !still_used {
                self.volumes.remove(volume);
            }
        }
    }

    /// Serialises the document as YAML.
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        serde_yaml::to_string(self).map_err(ManifestError::Serialize)
    }

    /// Writes the document atomically.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let yaml = self.to_yaml()?;
        write_atomic(path, yaml.as_bytes()).map_err(|source| ManifestError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Saves a non-empty document, or deletes the backing file when empty. Container
    /// tools reject a manifest without services.
    pub fn persist(&self, path: &Path) -> Result<(), ManifestError> {
        if !self.is_empty() {
            return self.save(path);
        }

        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed empty manifest {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ManifestError::Write {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Exclusive advisory lock held around a manifest read-modify-write.
///
/// The lock lives on a sidecar file and is released on drop or when the process
/// dies, so a crashed invocation never leaves the manifest locked.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
    path: PathBuf,
}

impl ManifestLock {
    /// Blocks until the lock next to `manifest` is held.
    pub fn acquire(manifest: &Path) -> Result<Self, ManifestError> {
        let path = lock_path(manifest);
        let lock_err = |source| ManifestError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(lock_err)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        debug!("Acquired manifest lock {}", path.display());

        Ok(Self { file, path })
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!("Failed to release manifest lock {}: {err}", self.path.display());
        }
    }
}

fn lock_path(manifest: &Path) -> PathBuf {
    let mut name = manifest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(MANIFEST_LOCK_SUFFIX);
    manifest.with_file_name(name)
}

/// Loads, mutates and persists a manifest while holding its lock.
pub fn update_manifest<T>(
    path: &Path,
    mutate: impl FnOnce(&mut ComposeDocument) -> T,
) -> Result<(ComposeDocument, T), ManifestError> {
    let _lock = ManifestLock::acquire(path)?;
    let mut document = ComposeDocument::load_or_discard(path)?;
    let outcome = mutate(&mut document);
    document.persist(path)?;
    Ok((document, outcome))
}

fn volume_source(entry: &str) -> Option<&str> {
    // Windows drive letters ("C:\data:/app") contain an extra colon.
    let bytes = entry.as_bytes();
    if bytes.len() > 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return None;
    }
    entry.split_once(':').map(|(source, _)| source)
}

fn is_named_volume(source: &str) -> bool {
    !source.is_empty()
        && !source.starts_with('/')
        && !source.starts_with('.')
        && !source.starts_with('~')
        && !source.starts_with('$')
        && !source.contains('/')
        && !source.contains('\\')
}
