use crate::image::{ContentDigest, Reference, ResourceName};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Address of one object in a [BlobStore](super::BlobStore)
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum StorageKey {
    /// Scratch file used while writing, only meaningful to [FileStore](super::FileStore)
    Temp(u32, u64),
    /// Manifest JSON, by branch or by its own digest
    Manifest(ResourceName, Reference),
    /// Layer or config blob
    Blob(ResourceName, ContentDigest),
    /// Name of the branch whose build produced this digest
    Branch(ResourceName, ContentDigest),
}

impl StorageKey {
    pub fn temp() -> Self {
        StorageKey::Temp(std::process::id(), rand::random::<u64>())
    }

    /// Location of this key under a bucket directory
    ///
    /// Resource names never contain `.` or `..` segments and references never
    /// contain slashes, so every key stays inside `base_dir`.
    pub fn to_path(&self, base_dir: &Path) -> PathBuf {
        let mut path = base_dir.to_path_buf();
        match self {
            StorageKey::Temp(pid, random) => {
                path.push("tmp");
                path.push(format!("{}-{}", pid, random));
                path.set_extension("tmp");
            }
            StorageKey::Manifest(name, reference) => {
                path.extend(name.iter());
                path.push("manifests");
                path.push(reference.as_str());
            }
            StorageKey::Blob(name, digest) => {
                path.extend(name.iter());
                path.push("blobs");
                path.push(digest.as_str());
            }
            StorageKey::Branch(name, digest) => {
                path.extend(name.iter());
                path.push("branches");
                path.push(digest.as_str());
            }
        }
        path
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Temp(pid, random) => write!(f, "temp({}-{})", pid, random),
            StorageKey::Manifest(name, reference) => write!(f, "{}/manifests/{}", name, reference),
            StorageKey::Blob(name, digest) => write!(f, "{}/blobs/{}", name, digest),
            StorageKey::Branch(name, digest) => write!(f, "{}/branches/{}", name, digest),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn path_str(key: StorageKey) -> String {
        key.to_path(Path::new("root")).to_str().unwrap().to_owned()
    }

    #[test]
    fn storage_paths() {
        assert_eq!(path_str(StorageKey::Temp(1, 2)), "root/tmp/1-2.tmp");
        assert_eq!(
            path_str(StorageKey::Temp(9999999, 4444444)),
            "root/tmp/9999999-4444444.tmp"
        );
        assert_eq!(
            path_str(StorageKey::Manifest(
                "denikson/bepinexpack_valheim".parse().unwrap(),
                "latest".parse().unwrap()
            )),
            "root/denikson/bepinexpack_valheim/manifests/latest"
        );
        assert_eq!(
            path_str(StorageKey::Manifest(
                "892970".parse().unwrap(),
                "sha256:00112233445566778899aabbccddeeff".parse().unwrap()
            )),
            "root/892970/manifests/sha256:00112233445566778899aabbccddeeff"
        );
        assert_eq!(
            path_str(StorageKey::Blob(
                "892970".parse().unwrap(),
                "sha256:00112233445566778899aabbccddeeff".parse().unwrap()
            )),
            "root/892970/blobs/sha256:00112233445566778899aabbccddeeff"
        );
        assert_eq!(
            path_str(StorageKey::Branch(
                "a/b".parse().unwrap(),
                "sha256:00112233445566778899aabbccddeeff".parse().unwrap()
            )),
            "root/a/b/branches/sha256:00112233445566778899aabbccddeeff"
        );
    }
}
