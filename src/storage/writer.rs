use crate::{errors::Error, image::ContentDigest, layer::HashingWriter, storage::StorageKey};
use std::{
    fs,
    fs::File,
    io,
    io::Write,
    path::{Path, PathBuf},
};

/// Temporary file being written on its way into a [FileStore](super::FileStore)
///
/// If the writer is dropped before [StorageWriter::rename_temp], the
/// temporary file is removed.
pub struct StorageWriter {
    temp_file: Option<HashingWriter<File>>,
    temp_path: Option<PathBuf>,
    pub key: StorageKey,
}

impl StorageWriter {
    pub fn new(key: StorageKey, temp_file: File, temp_path: PathBuf) -> StorageWriter {
        StorageWriter {
            key,
            temp_file: Some(HashingWriter::new(temp_file)),
            temp_path: Some(temp_path),
        }
    }

    /// Delete the temporary file backing this writer
    pub fn remove_temp(&mut self) -> Result<(), Error> {
        self.temp_file.take();
        if let Some(path) = self.temp_path.take() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Flush and sync the file, returning the digest of everything written
    pub fn finalize(&mut self) -> Result<ContentDigest, Error> {
        match self.temp_file.take() {
            Some(mut writer) => {
                writer.flush()?;
                let (file, content_digest, _) = writer.finish();
                file.sync_all()?;
                Ok(content_digest)
            }
            None => Err(Error::Io(closed())),
        }
    }

    /// Rename the temporary file and detach it from this writer
    pub fn rename_temp(&mut self, dest_path: &Path) -> Result<(), Error> {
        match self.temp_path.take() {
            Some(temp_path) => match fs::rename(&temp_path, dest_path) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.temp_path = Some(temp_path);
                    Err(e.into())
                }
            },
            None => Err(Error::Io(closed())),
        }
    }
}

impl Drop for StorageWriter {
    fn drop(&mut self) {
        if self.temp_path.is_some() {
            if let Err(e) = self.remove_temp() {
                log::warn!("failed to remove temp file for {:?}, {}", self.key, e);
            }
        }
    }
}

impl Write for StorageWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match &mut self.temp_file {
            Some(file) => file.write(buf),
            None => Err(closed()),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match &mut self.temp_file {
            Some(file) => file.flush(),
            None => Err(closed()),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "storage writer already finalized")
}
