//! Pluggable storage for manifests, blobs, and branch mappings

mod key;
mod memory;
mod writer;

pub use key::StorageKey;
pub use memory::MemoryStore;
pub use writer::StorageWriter;

use crate::errors::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    fs,
    fs::{File, OpenOptions},
    io,
    io::{Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task;

/// Content-addressed object storage
///
/// Writes are plain overwrites with no transactions. Everything stored under
/// a key is derived from that key, so two writers racing on one key always
/// store the same bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Check whether an object exists without reading it
    async fn exists(&self, key: &StorageKey) -> Result<bool, Error>;

    /// Read a whole object, `None` if it isn't stored
    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, Error>;

    /// Store a whole object, replacing anything already there
    async fn put(&self, key: &StorageKey, data: Bytes) -> Result<(), Error>;
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    async fn exists(&self, key: &StorageKey) -> Result<bool, Error> {
        (**self).exists(key).await
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, Error> {
        (**self).get(key).await
    }

    async fn put(&self, key: &StorageKey, data: Bytes) -> Result<(), Error> {
        (**self).put(key, data).await
    }
}

fn create_parent_dirs(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            // Keep going, another writer may have been creating the same directory
            log::warn!("error creating directory at {:?}, {:?}", parent, err);
        }
    }
}

/// [BlobStore] backed by a local directory
///
/// Objects live at `{name}/manifests/{reference}`, `{name}/blobs/{digest}`
/// and `{name}/branches/{digest}` under the root. Writes go to a temporary
/// file under `{root}/tmp/` which is then renamed into place, so readers
/// never see a partial object.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open one object from local storage, as a File
    pub fn open(&self, key: &StorageKey) -> Result<Option<File>, Error> {
        let path = key.to_path(&self.path);
        match File::open(path) {
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Ok(None),
                _ => Err(e.into()),
            },
            Ok(f) => Ok(Some(f)),
        }
    }

    /// Check whether a stored file exists without actually opening it
    ///
    /// Returns true if and only if the storage exists as a regular file. Any
    /// errors will cause this to return false.
    pub fn contains(&self, key: &StorageKey) -> bool {
        let path = key.to_path(&self.path);
        match fs::metadata(path) {
            Err(_) => false,
            Ok(metadata) => metadata.is_file(),
        }
    }

    /// Begin writing to temporary storage
    pub fn begin_write(&self) -> Result<StorageWriter, Error> {
        let key = StorageKey::temp();
        let temp_path = key.to_path(&self.path);
        create_parent_dirs(&temp_path);

        let temp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o440)
            .open(&temp_path)?;

        Ok(StorageWriter::new(key, temp_file, temp_path))
    }

    /// Promote a temporary file into a StorageKey
    pub fn commit_write(&self, mut writer: StorageWriter, key: &StorageKey) -> Result<(), Error> {
        let content_digest = writer.finalize()?;
        let dest_path = key.to_path(&self.path);
        create_parent_dirs(&dest_path);
        writer.rename_temp(&dest_path)?;
        log::debug!("storage commit, {} -> {:?}", content_digest, dest_path);
        Ok(())
    }

    fn read_blocking(&self, key: &StorageKey) -> Result<Option<Bytes>, Error> {
        match self.open(key)? {
            None => Ok(None),
            Some(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(Some(data.into()))
            }
        }
    }

    fn write_blocking(&self, key: &StorageKey, data: &[u8]) -> Result<(), Error> {
        let mut writer = self.begin_write()?;
        writer.write_all(data)?;
        self.commit_write(writer, key)
    }
}

#[async_trait]
impl BlobStore for FileStore {
    async fn exists(&self, key: &StorageKey) -> Result<bool, Error> {
        let storage = self.clone();
        let key = key.clone();
        Ok(task::spawn_blocking(move || storage.contains(&key)).await?)
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, Error> {
        let storage = self.clone();
        let key = key.clone();
        task::spawn_blocking(move || storage.read_blocking(&key)).await?
    }

    async fn put(&self, key: &StorageKey, data: Bytes) -> Result<(), Error> {
        let storage = self.clone();
        let key = key.clone();
        task::spawn_blocking(move || storage.write_blocking(&key, &data)).await?
    }
}
