#![allow(dead_code)]

use async_trait::async_trait;
use hoard::{
    opener::{ByteStream, Opener},
    Error,
};
use std::{
    collections::{BTreeSet, HashMap},
    io::{Cursor, Read},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};
use tar::{Archive, Builder, EntryType, Header};
use tokio::sync::Notify;
use url::Url;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Uncompressed tar holding regular files, with arbitrary timestamps
pub fn tar_files(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (index, (path, data)) in files.iter().enumerate() {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000 + index as u64);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Regular files in a tar stream, as (path, contents)
pub fn regular_files<R: Read>(stream: R) -> Vec<(String, Vec<u8>)> {
    let mut archive = Archive::new(stream);
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        files.push((path, data));
    }
    files
}

pub fn file_paths<R: Read>(stream: R) -> BTreeSet<String> {
    regular_files(stream).into_iter().map(|(path, _)| path).collect()
}

struct Resource {
    cache_key: String,
    tar: Vec<u8>,
}

/// Opener serving canned tarballs, counting how often it's asked
///
/// Unknown URLs are `NotFound`.
#[derive(Default)]
pub struct StubOpener {
    resources: Mutex<HashMap<String, Resource>>,
    opens: AtomicUsize,
    key_checks: AtomicUsize,
}

impl StubOpener {
    pub fn new() -> Self {
        Default::default()
    }

    /// Serve `files` at `url`, replacing whatever was there
    pub fn set(&self, url: &str, cache_key: &str, files: &[(&str, &[u8])]) {
        let url = Url::parse(url).unwrap().to_string();
        self.resources.lock().unwrap().insert(
            url,
            Resource {
                cache_key: cache_key.to_owned(),
                tar: tar_files(files),
            },
        );
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn key_checks(&self) -> usize {
        self.key_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Opener for StubOpener {
    async fn open(&self, url: &Url) -> Result<ByteStream, Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.resources.lock().unwrap().get(url.as_str()) {
            Some(resource) => Ok(Box::new(Cursor::new(resource.tar.clone()))),
            None => Err(Error::NotFound(url.to_string())),
        }
    }

    async fn cache_key(&self, url: &Url) -> Result<String, Error> {
        self.key_checks.fetch_add(1, Ordering::SeqCst);
        match self.resources.lock().unwrap().get(url.as_str()) {
            Some(resource) => Ok(resource.cache_key.clone()),
            None => Err(Error::NotFound(url.to_string())),
        }
    }
}

/// Opener whose downloads never finish
#[derive(Default)]
pub struct StalledOpener {
    never: Notify,
}

impl StalledOpener {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl Opener for StalledOpener {
    async fn open(&self, _url: &Url) -> Result<ByteStream, Error> {
        self.never.notified().await;
        Err(Error::NotFound("unreachable".to_owned()))
    }

    async fn cache_key(&self, _url: &Url) -> Result<String, Error> {
        Ok("stalled".to_owned())
    }
}
