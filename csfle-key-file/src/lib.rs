//! File-backed key vault for `csfle`.
//!
//! Stores data key documents on the filesystem, next to a local master key.
//! Suitable for development and single-host deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use csfle::error::{Error, KmsError};
use csfle::key_vault::{DataEncryptionKey, KeyId, KeyVaultStore};
use csfle::kms::{LocalKms, LOCAL_MASTER_KEY_SIZE};
use secrecy::{ExposeSecret, SecretVec};
use tracing::{debug, info};

/// Name of the local master key file.
pub const MASTER_KEY_FILE: &str = "master.key";

/// File-backed key vault.
///
/// Keys are stored with the following structure:
/// ```text
/// keys/
/// ├── master.key                                  (32 bytes, 0600 permissions)
/// └── demoFLE.__keystore/                         (key vault namespace)
///     ├── 0000000000000001-0b0e6b0e-6a5c-4f5e-9d0c-0f7e3b1a2c44.json
///     └── 0000000000000002-5f3c2d1e-...json       (one document per data key)
/// ```
///
/// The file name prefix is the insertion sequence number, which fixes the
/// order of [`KeyVaultStore::list`]. Each document is written to a temporary
/// file, synced, and renamed into place, so a key is either fully present or
/// absent.
///
/// Documents are indexed in memory when the vault is opened. Lookups that
/// miss the index rescan the directory, so keys written by another process
/// are still found.
pub struct FileKeyVault {
    dir: PathBuf,
    index: RwLock<Index>,
}

#[derive(Default)]
struct Index {
    keys: Vec<DataEncryptionKey>,
    next_sequence: u64,
}

impl Index {
    fn find_by_alias(&self, alias: &str) -> Option<DataEncryptionKey> {
        self.keys.iter().find(|k| k.has_alias(alias)).cloned()
    }

    fn find_by_id(&self, id: KeyId) -> Option<DataEncryptionKey> {
        self.keys.iter().find(|k| k.id() == id).cloned()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::BackendUnavailable("key vault lock poisoned".to_string())
}

impl FileKeyVault {
    /// Opens (creating if needed) the key vault directory.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding the key documents
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the directory cannot be created
    /// or holds a corrupt key document.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let index = Self::scan(&dir)?;
        debug!(dir = %dir.display(), keys = index.keys.len(), "key vault opened");
        Ok(Self { dir, index: RwLock::new(index) })
    }

    /// Opens the vault for a namespace below a key directory created by [`init`].
    ///
    /// # Errors
    ///
    /// See [`FileKeyVault::open`].
    pub fn for_namespace(key_dir: impl AsRef<Path>, namespace: &str) -> Result<Self, Error> {
        Self::open(key_dir.as_ref().join(namespace))
    }

    /// Directory holding the key documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, sequence: u64, id: KeyId) -> PathBuf {
        self.dir.join(format!("{sequence:016}-{id}.json"))
    }

    fn read_key(path: &Path) -> Result<DataEncryptionKey, Error> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::BackendUnavailable(format!("corrupt key document {}: {e}", path.display())))
    }

    fn sequence_of(path: &Path) -> Result<u64, Error> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.split_once('-'))
            .and_then(|(sequence, _)| sequence.parse().ok())
            .ok_or_else(|| Error::BackendUnavailable(format!("unrecognized key document name {}", path.display())))
    }

    fn scan(dir: &Path) -> Result<Index, Error> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                entries.push((Self::sequence_of(&path)?, Self::read_key(&path)?));
            }
        }
        entries.sort_by_key(|(sequence, _)| *sequence);

        let next_sequence = entries.last().map_or(1, |(sequence, _)| sequence + 1);
        Ok(Index { keys: entries.into_iter().map(|(_, key)| key).collect(), next_sequence })
    }

    /// Rescans the directory and returns the refreshed index.
    fn refresh(&self) -> Result<RwLockWriteGuard<'_, Index>, Error> {
        let mut index = self.index.write().map_err(poisoned)?;
        *index = Self::scan(&self.dir)?;
        Ok(index)
    }

    fn lookup<F>(&self, find: F) -> Result<Option<DataEncryptionKey>, Error>
    where
        F: Fn(&Index) -> Option<DataEncryptionKey>,
    {
        let cached = find(&*self.index.read().map_err(poisoned)?);
        if cached.is_some() {
            return Ok(cached);
        }
        Ok(find(&*self.refresh()?))
    }
}

impl KeyVaultStore for FileKeyVault {
    fn insert_key(&self, key: &DataEncryptionKey) -> Result<(), Error> {
        let mut index = self.refresh()?;

        if let Some(alias) =
            key.key_alt_names().iter().find(|alias| index.find_by_alias(alias).is_some())
        {
            return Err(Error::DuplicateAlias(alias.clone()));
        }

        let json = serde_json::to_vec_pretty(key)
            .map_err(|e| Error::BackendUnavailable(format!("cannot encode key document: {e}")))?;
        let sequence = index.next_sequence;
        let path = self.key_path(sequence, key.id());
        write_durable(&path, &json)?;

        index.keys.push(key.clone());
        index.next_sequence = sequence + 1;
        drop(index);

        debug!(key_id = %key.id(), sequence, path = %path.display(), "key document written");
        Ok(())
    }

    fn find_by_alias(&self, alias: &str) -> Result<Option<DataEncryptionKey>, Error> {
        self.lookup(|index| index.find_by_alias(alias))
    }

    fn find_by_id(&self, id: KeyId) -> Result<Option<DataEncryptionKey>, Error> {
        self.lookup(|index| index.find_by_id(id))
    }

    fn list(&self) -> Result<Vec<DataEncryptionKey>, Error> {
        Ok(self.refresh()?.keys.clone())
    }
}

/// Writes `bytes` to `path` via a synced temporary file and an atomic rename.
fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    let mut file = create_private(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;

    // Persist the rename itself. Directories cannot be opened on Windows.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

fn create_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Initializes a key directory with a fresh local master key.
///
/// # Errors
///
/// Returns `Error::BackendUnavailable` if the directory cannot be created, or
/// if a master key already exists (it is never overwritten).
pub fn init(key_dir: impl AsRef<Path>) -> Result<(), Error> {
    let key_dir = key_dir.as_ref();
    fs::create_dir_all(key_dir)?;

    let path = key_dir.join(MASTER_KEY_FILE);
    if path.exists() {
        return Err(Error::BackendUnavailable(format!("master key already exists: {}", path.display())));
    }

    let master_key = LocalKms::generate_master_key();
    write_durable(&path, master_key.expose_secret())?;

    info!(path = %path.display(), "local master key created");
    Ok(())
}

/// Reads the local master key of a key directory.
///
/// # Errors
///
/// - `Error::BackendUnavailable` if the file cannot be read
/// - `Error::Kms` if it does not hold a 32-byte key
pub fn read_master_key(key_dir: impl AsRef<Path>) -> Result<SecretVec<u8>, Error> {
    let path = key_dir.as_ref().join(MASTER_KEY_FILE);
    let mut bytes = Vec::with_capacity(LOCAL_MASTER_KEY_SIZE);
    File::open(&path)?.read_to_end(&mut bytes)?;

    if bytes.len() != LOCAL_MASTER_KEY_SIZE {
        let len = bytes.len();
        return Err(KmsError::InvalidMasterKey(format!(
            "{}: expected {LOCAL_MASTER_KEY_SIZE} bytes, got {len}",
            path.display()
        ))
        .into());
    }
    Ok(SecretVec::new(bytes))
}

/// Builds the local KMS provider from a key directory's master key.
///
/// # Errors
///
/// See [`read_master_key`].
pub fn local_kms(key_dir: impl AsRef<Path>) -> Result<LocalKms, Error> {
    Ok(LocalKms::new(read_master_key(key_dir)?)?)
}
