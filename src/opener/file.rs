use crate::{
    errors::Error,
    image::ContentDigest,
    opener::{ByteStream, Opener},
};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::{
    fs,
    fs::File,
    io,
    io::{Cursor, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tar::{Builder, HeaderMode};
use tokio::task;
use url::Url;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Opener for `file:///absolute/path` URLs
///
/// A directory becomes a tar of its contents, walked in sorted order with
/// deterministic headers. A regular file must already be a tar, optionally
/// gzipped.
#[derive(Clone, Debug, Default)]
pub struct FileOpener;

impl FileOpener {
    pub const SCHEME: &'static str = "file";

    pub fn new() -> Self {
        FileOpener
    }
}

fn local_path(url: &Url) -> Result<PathBuf, Error> {
    url.to_file_path()
        .map_err(|()| Error::InvalidResourceId(url.to_string()))
}

fn not_found(path: &Path, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_string_lossy().into_owned()),
        _ => e.into(),
    }
}

fn open_file(path: &Path) -> Result<ByteStream, Error> {
    let mut file = File::open(path).map_err(|e| not_found(path, e))?;
    let mut magic = [0u8; 2];
    let is_gzip = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(0))?;
    if is_gzip {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Archive a directory tree, children in name order
fn archive_dir(root: &Path) -> Result<Vec<u8>, Error> {
    let mut builder = Builder::new(Vec::new());
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let mut children: Vec<PathBuf> = fs::read_dir(root.join(&relative))?
            .map(|entry| entry.map(|entry| relative.join(entry.file_name())))
            .collect::<Result<_, _>>()?;
        children.sort();
        let mut subdirs = Vec::new();
        for child in children {
            let full = root.join(&child);
            builder.append_path_with_name(&full, &child)?;
            if fs::symlink_metadata(&full)?.is_dir() {
                subdirs.push(child);
            }
        }
        // Stack order, so the first subdirectory is walked next
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(builder.into_inner()?)
}

fn file_cache_key(path: &Path) -> Result<String, Error> {
    let metadata = fs::metadata(path).map_err(|e| not_found(path, e))?;
    if metadata.is_dir() {
        let archive = archive_dir(path)?;
        Ok(ContentDigest::from_content(&archive).hex_str().to_owned())
    } else {
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(format!("{}-{}", metadata.len(), mtime))
    }
}

#[async_trait]
impl Opener for FileOpener {
    async fn open(&self, url: &Url) -> Result<ByteStream, Error> {
        let path = local_path(url)?;
        task::spawn_blocking(move || {
            let metadata = fs::metadata(&path).map_err(|e| not_found(&path, e))?;
            if metadata.is_dir() {
                Ok(Box::new(Cursor::new(archive_dir(&path)?)) as ByteStream)
            } else {
                open_file(&path)
            }
        })
        .await?
    }

    async fn cache_key(&self, url: &Url) -> Result<String, Error> {
        let path = local_path(url)?;
        task::spawn_blocking(move || file_cache_key(&path)).await?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{errors::ErrorKind, image::tests::untar};
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    use tokio::runtime::Runtime;

    fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn directory_is_archived_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        fs::write(dir.path().join("b/inner/z.txt"), b"z").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("c.txt"), b"c").unwrap();
        let url = Url::from_file_path(dir.path()).unwrap();

        Runtime::new().unwrap().block_on(async {
            let opener = FileOpener::new();
            let paths: Vec<String> = untar(&read_all(opener.open(&url).await.unwrap()))
                .into_iter()
                .map(|e| e.path.trim_end_matches('/').to_owned())
                .collect();
            assert_eq!(paths, vec!["a.txt", "b", "c.txt", "b/inner", "b/inner/z.txt"]);

            let first = opener.cache_key(&url).await.unwrap();
            assert_eq!(first, opener.cache_key(&url).await.unwrap());
            fs::write(dir.path().join("a.txt"), b"changed").unwrap();
            assert_ne!(first, opener.cache_key(&url).await.unwrap());
        });
    }

    #[test]
    fn tarball_files_are_gunzipped() {
        let dir = tempfile::tempdir().unwrap();
        let tar = crate::image::tests::tar_files(&[("x", b"x")]);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar).unwrap();
        fs::write(dir.path().join("plain.tar"), &tar).unwrap();
        fs::write(dir.path().join("packed.tar.gz"), gz.finish().unwrap()).unwrap();

        Runtime::new().unwrap().block_on(async {
            let opener = FileOpener::new();
            for name in &["plain.tar", "packed.tar.gz"] {
                let url = Url::from_file_path(dir.path().join(name)).unwrap();
                assert_eq!(read_all(opener.open(&url).await.unwrap()), tar);
                let key = opener.cache_key(&url).await.unwrap();
                assert!(key.starts_with(&format!("{}-", fs::metadata(dir.path().join(name)).unwrap().len())));
            }
        });
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("nope")).unwrap();
        Runtime::new().unwrap().block_on(async {
            let err = FileOpener::new().open(&url).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        });
    }
}
