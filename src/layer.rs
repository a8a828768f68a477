//! Reproducible layer builder
//!
//! A layer is rebuilt from a tar stream with every piece of per-build noise
//! stripped out: paths get a fixed prefix, timestamps are pinned, owners are
//! overwritten, and the gzip header carries no name or time. The resulting
//! digest only depends on file contents, paths, and those rewrite parameters.

use crate::{
    errors::Error,
    image::{ContentDigest, Layer},
};
use flate2::{write::GzEncoder, Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::{
    io,
    io::{Read, Write},
    path::{Component, Path, PathBuf},
};
use tar::{Archive, Builder, EntryType, Header};

/// Modification time written into every layer entry, in seconds
pub const SOURCE_DATE_EPOCH: u64 = 0;

/// [SOURCE_DATE_EPOCH] as it appears in image configs
pub const SOURCE_DATE_EPOCH_RFC3339: &str = "1970-01-01T00:00:00Z";

/// Numeric owner written into every layer entry
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Owner {
    pub uid: u64,
    pub gid: u64,
}

impl Owner {
    pub const ROOT: Owner = Owner { uid: 0, gid: 0 };

    pub fn new(uid: u64, gid: u64) -> Self {
        Owner { uid, gid }
    }
}

/// Settings for rebuilding a tar stream as a reproducible [Layer]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerBuilder {
    dir: PathBuf,
    mtime: u64,
    owner: Owner,
}

impl LayerBuilder {
    /// Place every file from the source stream under `dir`
    ///
    /// `dir` must be relative. Empty and `.` both mean the layer root, and
    /// `..` is never allowed.
    pub fn new(dir: &str) -> Result<Self, Error> {
        Ok(LayerBuilder {
            dir: normalize_dir(dir)?,
            mtime: SOURCE_DATE_EPOCH,
            owner: Owner::ROOT,
        })
    }

    /// Overwrite entry ownership with this uid and gid
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    /// Use a different fixed modification time
    pub fn mtime(mut self, seconds: u64) -> Self {
        self.mtime = seconds;
        self
    }

    /// Normalized destination directory, empty for the layer root
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Call `opener` for the source stream, then [LayerBuilder::build] it
    pub fn build_from<F, R>(&self, opener: F) -> Result<Layer, Error>
    where
        F: FnOnce() -> Result<R, Error>,
        R: Read,
    {
        self.build(opener()?)
    }

    /// Read a tar archive and rewrite it as a compressed, digested layer
    pub fn build<R: Read>(&self, source: R) -> Result<Layer, Error> {
        let compressed = HashingWriter::new(Vec::new());
        let encoder = GzBuilder::new().write(compressed, Compression::default());
        let mut builder = Builder::new(HashingWriter::new(encoder));

        let mut archive = Archive::new(source);
        let mut entries = 0usize;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if self.append_entry(&mut builder, &mut entry)? {
                entries += 1;
            }
        }

        let uncompressed: HashingWriter<GzEncoder<HashingWriter<Vec<u8>>>> = builder.into_inner()?;
        let (encoder, diff_id, uncompressed_size) = uncompressed.finish();
        let (data, digest, _) = encoder.finish()?.finish();
        log::debug!(
            "built layer {} from {} entries, {} bytes ({} uncompressed) under {:?}",
            digest,
            entries,
            data.len(),
            uncompressed_size,
            self.dir
        );
        Ok(Layer::new(digest, diff_id, uncompressed_size, data.into()))
    }

    fn destination(&self, path: &Path) -> Option<PathBuf> {
        let mut result = self.dir.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => result.push(part),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => (),
                Component::ParentDir => return None,
            }
        }
        if result.as_os_str().is_empty() {
            None
        } else {
            Some(result)
        }
    }

    fn append_entry<W: Write, R: Read>(
        &self,
        builder: &mut Builder<W>,
        entry: &mut tar::Entry<'_, R>,
    ) -> Result<bool, Error> {
        let path = entry.path()?.into_owned();
        let kind = entry.header().entry_type();
        let dest = match self.destination(&path) {
            Some(dest) => dest,
            None => {
                if path.components().any(|c| c == Component::ParentDir) {
                    log::warn!("skipping tar entry that escapes its root, {:?}", path);
                }
                return Ok(false);
            }
        };

        let mut header = Header::new_gnu();
        header.set_mode(entry.header().mode()?);
        header.set_mtime(self.mtime);
        header.set_uid(self.owner.uid);
        header.set_gid(self.owner.gid);
        header.set_size(0);

        match kind {
            EntryType::Regular | EntryType::Continuous => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(entry.size());
                builder.append_data(&mut header, &dest, entry)?;
            }
            EntryType::Directory | EntryType::Fifo => {
                header.set_entry_type(kind);
                builder.append_data(&mut header, &dest, io::empty())?;
            }
            EntryType::Char | EntryType::Block => {
                header.set_entry_type(kind);
                let major = entry.header().device_major()?.unwrap_or(0);
                let minor = entry.header().device_minor()?.unwrap_or(0);
                header.set_device_major(major)?;
                header.set_device_minor(minor)?;
                builder.append_data(&mut header, &dest, io::empty())?;
            }
            EntryType::Symlink => {
                let target = link_name(entry, &path)?;
                header.set_entry_type(kind);
                builder.append_link(&mut header, &dest, target)?;
            }
            EntryType::Link => {
                // Hard link targets are archive paths, so they move with the prefix
                let target = link_name(entry, &path)?;
                let target = self.destination(&target).ok_or_else(|| {
                    Error::InvalidArchive(format!("hard link target escapes root, {:?}", target))
                })?;
                header.set_entry_type(kind);
                builder.append_link(&mut header, &dest, target)?;
            }
            _ => {
                log::warn!("skipping unsupported tar entry type {:?}, {:?}", kind, path);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Build one reproducible layer from a stream factory
///
/// Shorthand for [LayerBuilder::new] with an owner, then
/// [LayerBuilder::build_from].
pub fn build_layer<F, R>(opener: F, dir: &str, owner: Owner) -> Result<Layer, Error>
where
    F: FnOnce() -> Result<R, Error>,
    R: Read,
{
    LayerBuilder::new(dir)?.owner(owner).build_from(opener)
}

fn link_name<R: Read>(entry: &tar::Entry<'_, R>, path: &Path) -> Result<PathBuf, Error> {
    match entry.link_name()? {
        Some(link) => Ok(link.into_owned()),
        None => Err(Error::InvalidArchive(format!("link without a target, {:?}", path))),
    }
}

fn normalize_dir(dir: &str) -> Result<PathBuf, Error> {
    let path = Path::new(dir);
    if path.is_absolute() {
        return Err(Error::InvalidDestination(dir.to_owned()));
    }
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::CurDir => (),
            _ => return Err(Error::InvalidDestination(dir.to_owned())),
        }
    }
    Ok(result)
}

/// Writer adapter which hashes and counts everything passing through it
pub(crate) struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    len: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
            len: 0,
        }
    }

    /// Detach the inner writer, along with the digest and length of all data
    /// written so far
    pub fn finish(self) -> (W, ContentDigest, u64) {
        (self.inner, ContentDigest::from_hasher(self.hasher), self.len)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let actual_size = self.inner.write(buf)?;
        self.hasher.update(&buf[..actual_size]);
        self.len += actual_size as u64;
        Ok(actual_size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::tests::{tar_files, untar_layer};

    fn files() -> Vec<u8> {
        tar_files(&[("plugins/a.dll", b"aaaa" as &[u8]), ("README.md", b"hello")])
    }

    #[test]
    fn digest_is_reproducible() {
        let first = LayerBuilder::new("game").unwrap().build(&files()[..]).unwrap();
        let second = LayerBuilder::new("game").unwrap().build(&files()[..]).unwrap();
        assert_eq!(first.digest(), second.digest());
        assert_eq!(first.diff_id(), second.diff_id());
        assert_eq!(first.data(), second.data());
        assert!(first.digest().matches(first.data()));
    }

    #[test]
    fn digest_ignores_source_timestamps_and_owners() {
        let mut raw = Builder::new(Vec::new());
        let mut header = Header::new_ustar();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_uid(1000);
        header.set_gid(1000);
        raw.append_data(&mut header, "plugins/a.dll", &b"aaaa"[..]).unwrap();
        let mut header = Header::new_ustar();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        raw.append_data(&mut header, "README.md", &b"hello"[..]).unwrap();
        let raw = raw.into_inner().unwrap();

        let noisy = LayerBuilder::new("game").unwrap().build(&raw[..]).unwrap();
        let clean = LayerBuilder::new("game").unwrap().build(&files()[..]).unwrap();
        assert_eq!(noisy.digest(), clean.digest());
    }

    #[test]
    fn rewrite_parameters_change_digest() {
        let base = LayerBuilder::new("game").unwrap().build(&files()[..]).unwrap();
        let other_dir = LayerBuilder::new("other").unwrap().build(&files()[..]).unwrap();
        let other_owner = LayerBuilder::new("game")
            .unwrap()
            .owner(Owner::new(1000, 1000))
            .build(&files()[..])
            .unwrap();
        let other_time = LayerBuilder::new("game")
            .unwrap()
            .mtime(86400)
            .build(&files()[..])
            .unwrap();
        assert_ne!(base.digest(), other_dir.digest());
        assert_ne!(base.digest(), other_owner.digest());
        assert_ne!(base.digest(), other_time.digest());
    }

    #[test]
    fn entries_are_rewritten() {
        let layer = LayerBuilder::new("./game/")
            .unwrap()
            .owner(Owner::new(1000, 1001))
            .build(&files()[..])
            .unwrap();
        let entries = untar_layer(&layer);
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["game/plugins/a.dll", "game/README.md"]);
        for entry in &entries {
            assert_eq!(entry.mtime, SOURCE_DATE_EPOCH);
            assert_eq!((entry.uid, entry.gid), (1000, 1001));
        }
        assert_eq!(entries[0].data, b"aaaa");
    }

    #[test]
    fn root_dir_keeps_paths() {
        let layer = LayerBuilder::new(".").unwrap().build(&files()[..]).unwrap();
        let entries = untar_layer(&layer);
        assert_eq!(entries[0].path, "plugins/a.dll");
        assert_eq!(layer.uncompressed_size() % 512, 0);
    }

    #[test]
    fn rejects_bad_destinations() {
        assert!(matches!(
            LayerBuilder::new("/abs"),
            Err(Error::InvalidDestination(_))
        ));
        assert!(matches!(
            LayerBuilder::new("a/../b"),
            Err(Error::InvalidDestination(_))
        ));
        assert_eq!(LayerBuilder::new("").unwrap().dir(), Path::new(""));
    }

    #[test]
    fn skips_escaping_entries() {
        let mut raw = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        // set_path refuses "..", so write the name bytes directly
        header.as_gnu_mut().unwrap().name[..9].copy_from_slice(b"../escape");
        header.set_cksum();
        raw.append(&header, &b"x"[..]).unwrap();
        let raw = raw.into_inner().unwrap();
        let layer = LayerBuilder::new("game").unwrap().build(&raw[..]).unwrap();
        assert!(untar_layer(&layer).is_empty());
    }

    #[test]
    fn symlinks_and_hardlinks() {
        let mut raw = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o755);
        raw.append_data(&mut header, "bin/run", &b"run"[..]).unwrap();
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        raw.append_link(&mut header, "bin/start", "run").unwrap();
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Link);
        header.set_size(0);
        raw.append_link(&mut header, "bin/again", "bin/run").unwrap();
        let raw = raw.into_inner().unwrap();

        let layer = LayerBuilder::new("srv").unwrap().build(&raw[..]).unwrap();
        let entries = untar_layer(&layer);
        assert_eq!(entries[1].path, "srv/bin/start");
        assert_eq!(entries[1].link.as_deref(), Some("run"));
        assert_eq!(entries[2].path, "srv/bin/again");
        assert_eq!(entries[2].link.as_deref(), Some("srv/bin/run"));
    }

    #[test]
    fn opener_errors_propagate() {
        let result = build_layer(
            || -> Result<&[u8], Error> { Err(Error::NotFound("nope".into())) },
            ".",
            Owner::ROOT,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
