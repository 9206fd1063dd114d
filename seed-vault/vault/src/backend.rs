//! Software key backends.

use anyhow::{Context, Result, bail};
use nix::sys::stat::Mode;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use zeroize::Zeroizing;

use crate::KeyBackend;

/// Length of the generated master key material.
pub const KEY_MATERIAL_LEN: usize = 32;

/// Master key stored in a file readable only by the owner.
///
/// Used where no hardware key facility is available. The file is created
/// with `O_EXCL`, so two processes provisioning at once cannot overwrite
/// each other's key.
pub struct FileKeyBackend {
    path: PathBuf,
}

impl FileKeyBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn owner_only() -> u32 {
    u32::from((Mode::S_IRUSR | Mode::S_IWUSR).bits())
}

impl KeyBackend for FileKeyBackend {
    fn provision(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create key directory {}", parent.display()))?;
        }

        let mut material = Zeroizing::new([0u8; KEY_MATERIAL_LEN]);
        OsRng.fill_bytes(&mut material[..]);

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(owner_only())
            .open(&self.path);

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to create key file {}", self.path.display())
                });
            }
        };

        if let Err(e) = file.write_all(&material[..]).and_then(|()| file.sync_all()) {
            fs::remove_file(&self.path).ok();
            return Err(e)
                .with_context(|| format!("failed to write key file {}", self.path.display()));
        }

        log::info!("generated master key at {}", self.path.display());
        Ok(true)
    }

    fn ikm(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut file = fs::File::open(&self.path)
            .with_context(|| format!("master key {} is not provisioned", self.path.display()))?;
        let mut material = Zeroizing::new(Vec::with_capacity(KEY_MATERIAL_LEN));
        file.read_to_end(&mut material)
            .with_context(|| format!("failed to read key file {}", self.path.display()))?;

        if material.len() != KEY_MATERIAL_LEN {
            bail!(
                "key file {} holds {} bytes, expected {KEY_MATERIAL_LEN}",
                self.path.display(),
                material.len()
            );
        }
        Ok(material)
    }

    fn destroy(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::warn!("destroyed master key {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove key file {}", self.path.display()))
            }
        }
    }
}

/// In-process key backend, for tests and ephemeral vaults.
#[derive(Default)]
pub struct MemoryKeyBackend {
    material: Mutex<Option<Zeroizing<Vec<u8>>>>,
    hardware: bool,
}

impl MemoryKeyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that reports itself as hardware backed.
    pub fn hardware() -> Self {
        Self {
            material: Mutex::new(None),
            hardware: true,
        }
    }

    /// A backend already holding `material`.
    pub fn with_material(material: &[u8]) -> Self {
        Self {
            material: Mutex::new(Some(Zeroizing::new(material.to_vec()))),
            hardware: false,
        }
    }
}

impl KeyBackend for MemoryKeyBackend {
    fn provision(&self) -> Result<bool> {
        let mut slot = self.material.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(false);
        }
        let mut material = Zeroizing::new(vec![0u8; KEY_MATERIAL_LEN]);
        OsRng.fill_bytes(material.as_mut_slice());
        *slot = Some(material);
        Ok(true)
    }

    fn ikm(&self) -> Result<Zeroizing<Vec<u8>>> {
        let slot = self.material.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(material) => Ok(material.clone()),
            None => bail!("in-memory master key is not provisioned"),
        }
    }

    fn destroy(&self) -> Result<()> {
        self.material
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn is_hardware_backed(&self) -> bool {
        self.hardware
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn file_backend_provisions_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileKeyBackend::new(dir.path().join("keys/master.key"));

        assert!(backend.provision().unwrap());
        let first = backend.ikm().unwrap();
        assert!(!backend.provision().unwrap());
        assert_eq!(*first, *backend.ikm().unwrap());
        assert_eq!(first.len(), KEY_MATERIAL_LEN);

        let mode = fs::metadata(backend.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_backend_without_key_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileKeyBackend::new(dir.path().join("master.key"));
        let err = backend.ikm().unwrap_err();
        assert!(format!("{err:#}").contains("not provisioned"));
    }

    #[test]
    fn file_backend_rejects_truncated_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        fs::write(&path, [1u8; 7]).unwrap();
        assert!(FileKeyBackend::new(&path).ikm().is_err());
    }

    #[test]
    fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileKeyBackend::new(dir.path().join("master.key"));
        backend.provision().unwrap();
        backend.destroy().unwrap();
        backend.destroy().unwrap();
        assert!(backend.ikm().is_err());
    }

    #[test]
    fn memory_backend_regenerates_after_destroy() {
        let backend = MemoryKeyBackend::new();
        assert!(backend.provision().unwrap());
        let first = backend.ikm().unwrap();
        backend.destroy().unwrap();
        assert!(backend.ikm().is_err());
        assert!(backend.provision().unwrap());
        assert_ne!(*first, *backend.ikm().unwrap());
    }
}
