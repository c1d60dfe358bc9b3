//! Key stores hold sealed key blobs, one per key identifier.
//!
//! Stores never see plaintext key material; sealing and unsealing happen in
//! the HSM under the master key.

use crate::error::{HsmError, Result};
use crate::key::validate_key_id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const KEY_EXTENSION: &str = "key";

/// Persistence backend for sealed key blobs
pub trait KeyStore: Send + Sync {
    /// Create or replace the blob for `key_id`
    fn save(&self, key_id: &str, sealed: &[u8]) -> Result<()>;

    /// All stored blobs
    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove the blob for `key_id`
    fn delete(&self, key_id: &str) -> Result<()>;
}

/// Directory of `<id>.key` files, owner read/write only
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Open (creating if needed) the key directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map an identifier to its file, refusing anything outside the directory
    fn path_for(&self, key_id: &str) -> Result<PathBuf> {
        validate_key_id(key_id)?;
        let path = self.dir.join(format!("{}.{}", key_id, KEY_EXTENSION));
        if path.parent() != Some(self.dir.as_path()) {
            return Err(HsmError::InvalidKeyId(key_id.to_string()));
        }
        Ok(path)
    }
}

impl KeyStore for FileKeyStore {
    fn save(&self, key_id: &str, sealed: &[u8]) -> Result<()> {
        let path = self.path_for(key_id)?;
        let tmp = path.with_extension("key.tmp");

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp)?;
        file.write_all(sealed)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        debug!(key_id, path = %path.display(), "Key saved");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut blobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }
            let Some(key_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_key_id(key_id).is_err() {
                warn!(path = %path.display(), "Skipping key file with invalid name");
                continue;
            }
            blobs.push((key_id.to_string(), fs::read(&path)?));
        }
        Ok(blobs)
    }

    fn delete(&self, key_id: &str) -> Result<()> {
        let path = self.path_for(key_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Non-persistent store for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn save(&self, key_id: &str, sealed: &[u8]) -> Result<()> {
        validate_key_id(key_id)?;
        self.blobs.lock().insert(key_id.to_string(), sealed.to_vec());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .blobs
            .lock()
            .iter()
            .map(|(id, blob)| (id.clone(), blob.clone()))
            .collect())
    }

    fn delete(&self, key_id: &str) -> Result<()> {
        self.blobs.lock().remove(key_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_save_load_delete() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys")).unwrap();

        store.save("card_signing", b"sealed-blob").unwrap();
        let blobs = store.load_all().unwrap();
        assert_eq!(blobs, vec![("card_signing".to_string(), b"sealed-blob".to_vec())]);

        store.delete("card_signing").unwrap();
        assert!(store.load_all().unwrap().is_empty());
        // deleting twice is not an error
        store.delete("card_signing").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys")).unwrap();
        store.save("k1", b"x").unwrap();

        let mode = fs::metadata(store.dir().join("k1.key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();

        assert!(matches!(store.save("../escape", b"x"), Err(HsmError::InvalidKeyId(_))));
        assert!(matches!(store.save("/etc/passwd", b"x"), Err(HsmError::InvalidKeyId(_))));
        assert!(matches!(store.delete("a/../../b"), Err(HsmError::InvalidKeyId(_))));
    }

    #[test]
    fn test_foreign_files_ignored() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("bad name.key"), b"x").unwrap();
        store.save("good", b"y").unwrap();

        let blobs = store.load_all().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].0, "good");
    }
}
