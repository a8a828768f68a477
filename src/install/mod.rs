//! Installation database backed by a single container image
//!
//! Every installed resource is one layer in the image plus one label in its
//! config. The image lives in memory once loaded and is written back to a
//! single tarball after every change.

mod index;

pub use index::{label_value, parse_label_value, Installation, InstallationIndex};

use crate::{
    errors::Error,
    image::{flatten, read_archive, write_archive, Image},
    layer::{LayerBuilder, Owner},
    opener::{ByteStream, OpenerRegistry},
    storage::{StorageKey, StorageWriter},
};
use std::{
    collections::HashSet,
    env, fs,
    fs::{File, OpenOptions},
    io,
    io::{BufReader, BufWriter, Cursor},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};
use tokio::{sync::Mutex, task};
use url::Url;

/// Label prefix used when none is configured
pub const DEFAULT_LABEL_PREFIX: &str = "cc.hoard.installed";

/// Builder for configuring a [Manager]
#[derive(Debug)]
pub struct ManagerBuilder {
    openers: OpenerRegistry,
    db_path: Option<PathBuf>,
    label_prefix: String,
    owner: Owner,
}

impl ManagerBuilder {
    pub fn new(openers: OpenerRegistry) -> Self {
        ManagerBuilder {
            openers,
            db_path: None,
            label_prefix: DEFAULT_LABEL_PREFIX.to_owned(),
            owner: Owner::ROOT,
        }
    }

    /// Change the database file
    ///
    /// The default can be determined with [Manager::default_db_path()]
    pub fn db_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Change the prefix of the labels that record installations
    pub fn label_prefix(mut self, prefix: &str) -> Self {
        self.label_prefix = prefix.to_owned();
        self
    }

    /// Owner written into every installed file
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn build(self) -> Result<Manager, Error> {
        let db_path = match self.db_path {
            Some(path) => path,
            None => Manager::default_db_path()?,
        };
        log::info!("using installation database {:?}", db_path);
        Ok(Manager {
            openers: self.openers,
            db_path,
            label_prefix: self.label_prefix,
            owner: self.owner,
            resident: Mutex::new(None),
        })
    }
}

/// Installs resources into, and extracts them from, one image file
///
/// All operations on a manager are serialized by one lock which is held for
/// the whole load, fetch, build, and save cycle. Changes are made to a copy
/// of the resident image, which only replaces it once the copy has been
/// renamed into place on disk.
pub struct Manager {
    openers: OpenerRegistry,
    db_path: PathBuf,
    label_prefix: String,
    owner: Owner,
    resident: Mutex<Option<Image>>,
}

impl Manager {
    pub fn builder(openers: OpenerRegistry) -> ManagerBuilder {
        ManagerBuilder::new(openers)
    }

    /// Determine the database path used if no other is configured
    ///
    /// Typically this returns `$HOME/.local/share/hoard/hoard.db`, but it may
    /// return `$XDG_DATA_HOME/hoard/hoard.db` if the per-user data directory
    /// has been set, and the path can be chosen directly via the `$HOARD_DB`
    /// environment variable.
    pub fn default_db_path() -> Result<PathBuf, Error> {
        match env::var("HOARD_DB") {
            Ok(s) => Ok(Path::new(&s).to_path_buf()),
            Err(_) => {
                let mut buf = match env::var("XDG_DATA_HOME") {
                    Ok(s) => Ok(Path::new(&s).to_path_buf()),
                    Err(_) => match env::var("HOME") {
                        Ok(s) => Ok(Path::new(&s).join(".local").join("share")),
                        Err(_) => Err(Error::NoDefaultDatabasePath),
                    },
                };
                if let Ok(buf) = &mut buf {
                    buf.push("hoard");
                    buf.push("hoard.db");
                }
                buf
            }
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn label_prefix(&self) -> &str {
        &self.label_prefix
    }

    /// Install a resource's files under `dir`
    ///
    /// If the same URL and directory are already installed and the
    /// resource's cache key hasn't changed, the existing installation is
    /// returned untouched. Otherwise any previous layer for them is replaced
    /// by a freshly built one and the database is saved.
    pub async fn install(&self, url: &str, dir: &str) -> Result<Installation, Error> {
        let dir = dir.trim_start_matches('/');
        let builder = LayerBuilder::new(dir)?.owner(self.owner);
        let (url, opener) = self.openers.resolve(url)?;

        let mut resident = self.resident.lock().await;
        let current = self.load(&mut resident).await?;
        let mut index = InstallationIndex::from_labels(&self.label_prefix, current.labels())?;

        let cache_key = opener.cache_key(&url).await?;
        if let Some(existing) = index.get(&url, dir) {
            if existing.cache_key == cache_key {
                log::info!("{} is up to date", existing);
                return Ok(existing.clone());
            }
        }

        let mut image = current;
        if let Some(stale) = index.remove(&url, dir) {
            log::info!("replacing {}, cache key was {:?}", stale, stale.cache_key);
            image.remove_layer(&stale.digest);
        }

        let stream = opener.open(&url).await?;
        let layer = task::spawn_blocking(move || builder.build(stream)).await??;
        let installation = index::new_installation(&url, dir, layer.digest().clone(), cache_key)?;
        index.insert(installation.clone())?;
        image.append_layer(layer);
        index.write_labels(image.labels_mut());

        self.commit(&mut resident, image).await?;
        log::info!("installed {}", installation);
        Ok(installation)
    }

    /// Remove the installation of `url` in `dir`, if there is one
    pub async fn uninstall(&self, url: &str, dir: &str) -> Result<(), Error> {
        let dir = dir.trim_start_matches('/');
        let url = Url::parse(url).map_err(|_| Error::InvalidResourceId(url.to_owned()))?;

        let mut resident = self.resident.lock().await;
        let mut image = self.load(&mut resident).await?;
        let mut index = InstallationIndex::from_labels(&self.label_prefix, image.labels())?;
        match index.remove(&url, dir) {
            None => {
                log::debug!("{} in {:?} is not installed", url, dir);
                Ok(())
            }
            Some(installation) => {
                image.remove_layer(&installation.digest);
                index.write_labels(image.labels_mut());
                self.commit(&mut resident, image).await?;
                log::info!("uninstalled {}", installation);
                Ok(())
            }
        }
    }

    /// Everything currently installed, ordered by URL and directory
    pub async fn installations(&self) -> Result<Vec<Installation>, Error> {
        let mut resident = self.resident.lock().await;
        let image = self.load(&mut resident).await?;
        let index = InstallationIndex::from_labels(&self.label_prefix, image.labels())?;
        Ok(index.iter().cloned().collect())
    }

    /// Merged files of every installation whose URL scheme is listed
    ///
    /// Empty scheme strings are ignored, and at least one must remain.
    pub async fn extract<S: AsRef<str>>(&self, schemes: &[S]) -> Result<ByteStream, Error> {
        let schemes: HashSet<String> = schemes
            .iter()
            .map(|s| s.as_ref().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if schemes.is_empty() {
            return Err(Error::NoSchemes);
        }

        let mut image = {
            let mut resident = self.resident.lock().await;
            self.load(&mut resident).await?
        };
        let index = InstallationIndex::from_labels(&self.label_prefix, image.labels())?;
        let digests: HashSet<_> = index
            .iter()
            .filter(|installation| schemes.contains(installation.scheme()))
            .map(|installation| installation.digest.clone())
            .collect();
        image.retain_layers(|layer| digests.contains(layer.digest()));
        Manager::flatten(image).await
    }

    /// Merged files of every installation
    pub async fn extract_all(&self) -> Result<ByteStream, Error> {
        let image = {
            let mut resident = self.resident.lock().await;
            self.load(&mut resident).await?
        };
        Manager::flatten(image).await
    }

    /// Write the database one last time and forget the resident image
    ///
    /// The manager stays usable, the next operation loads from disk again.
    pub async fn close(&self) -> Result<(), Error> {
        let mut resident = self.resident.lock().await;
        let image = self.load(&mut resident).await?;
        self.commit(&mut resident, image).await?;
        *resident = None;
        Ok(())
    }

    async fn flatten(image: Image) -> Result<ByteStream, Error> {
        let tar = task::spawn_blocking(move || flatten(image.layers())).await??;
        Ok(Box::new(Cursor::new(tar)))
    }

    /// Copy of the resident image, loading it first if needed
    async fn load(&self, resident: &mut Option<Image>) -> Result<Image, Error> {
        if let Some(image) = resident.as_ref() {
            return Ok(image.clone());
        }
        let path = self.db_path.clone();
        let image = task::spawn_blocking(move || load_db(&path)).await??;
        log::debug!("loaded {} layers from {:?}", image.layers().len(), self.db_path);
        *resident = Some(image.clone());
        Ok(image)
    }

    /// Persist `image` and make it the resident image
    ///
    /// The temporary file is written on a blocking thread. The rename and the
    /// swap of the resident image happen together with no await in between,
    /// so a cancelled caller leaves both memory and disk as they were.
    async fn commit(&self, resident: &mut Option<Image>, image: Image) -> Result<(), Error> {
        let path = self.db_path.clone();
        let to_write = image.clone();
        let mut writer = task::spawn_blocking(move || write_temp(&path, &to_write)).await??;
        writer
            .rename_temp(&self.db_path)
            .map_err(|e| persistence_error(&self.db_path, e))?;
        *resident = Some(image);
        log::debug!("saved installation database {:?}", self.db_path);
        Ok(())
    }
}

fn persistence_error(path: &Path, err: Error) -> Error {
    match err {
        Error::Io(e) => Error::persistence(path, e),
        other => other,
    }
}

fn load_db(path: &Path) -> Result<Image, Error> {
    match fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("no installation database at {:?} yet, starting empty", path);
            Ok(Image::default())
        }
        Err(e) => Err(Error::persistence(path, e)),
        Ok(metadata) if !metadata.is_file() => Err(Error::persistence(
            path,
            io::Error::new(io::ErrorKind::Other, "not a regular file"),
        )),
        Ok(_) => {
            let file = File::open(path).map_err(|e| Error::persistence(path, e))?;
            read_archive(BufReader::new(file))
        }
    }
}

/// Write `image` to a new temporary file next to `path`
fn write_temp(path: &Path, image: &Image) -> Result<StorageWriter, Error> {
    let key = StorageKey::temp();
    let temp_path = temp_sibling(path, &key);
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::persistence(path, e))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&temp_path)
        .map_err(|e| Error::persistence(path, e))?;
    let writer = StorageWriter::new(key, file, temp_path);
    let result: Result<StorageWriter, Error> = (|| {
        let writer = write_archive(image, BufWriter::new(writer))?;
        let mut writer = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        writer.finalize()?;
        Ok(writer)
    })();
    result.map_err(|e| persistence_error(path, e))
}

fn temp_sibling(path: &Path, key: &StorageKey) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = match key {
        StorageKey::Temp(pid, random) => format!("{}-{}", pid, random),
        _ => rand::random::<u64>().to_string(),
    };
    path.with_file_name(format!("{}.{}.tmp", file_name, suffix))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn temp_files_are_siblings() {
        let path = Path::new("/var/lib/hoard/hoard.db");
        assert_eq!(
            temp_sibling(path, &StorageKey::Temp(12, 34)),
            Path::new("/var/lib/hoard/hoard.db.12-34.tmp")
        );
    }

    #[test]
    fn missing_db_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let image = load_db(&dir.path().join("nothing.db")).unwrap();
        assert!(image.layers().is_empty());
        assert!(image.labels().is_empty());
    }

    #[test]
    fn directory_db_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_db(dir.path()), Err(Error::Persistence { .. })));
    }

    #[test]
    fn saved_db_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("hoard.db");
        let mut image = Image::default();
        image.labels_mut().insert("k".into(), "v".into());
        let mut writer = write_temp(&path, &image).unwrap();
        writer.rename_temp(&path).unwrap();
        assert_eq!(load_db(&path).unwrap(), image);
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("hoard.db")]);
    }
}
