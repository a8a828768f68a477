//! `docker save` style tarballs, used as the installation database file

use crate::{
    errors::Error,
    image::{ContentDigest, Image, Layer},
    manifest::RuntimeConfig,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{Read, Write},
};
use tar::{Archive, Builder, EntryType, Header};

/// Repository tag recorded for the single image in a database archive
pub const ARCHIVE_REPO_TAG: &str = "hoard.local/db:latest";

const MANIFEST_PATH: &str = "manifest.json";
const LAYER_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Deserialize, Serialize)]
struct ArchiveManifest {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write an image as a tarball
pub fn write_archive<W: Write>(image: &Image, writer: W) -> Result<W, Error> {
    let rendered = image.render()?;
    let manifest = vec![ArchiveManifest {
        config: rendered.config_digest.to_string(),
        repo_tags: vec![ARCHIVE_REPO_TAG.to_owned()],
        layers: image
            .layers()
            .iter()
            .map(|layer| layer_path(layer.digest()))
            .collect(),
    }];
    let manifest = serde_json::to_vec(&manifest)?;

    let mut builder = Builder::new(writer);
    append_file(&mut builder, MANIFEST_PATH, &manifest)?;
    append_file(&mut builder, rendered.config_digest.as_str(), &rendered.config)?;
    for layer in image.layers() {
        append_file(&mut builder, &layer_path(layer.digest()), layer.data())?;
    }
    Ok(builder.into_inner()?)
}

/// Read an image back from a tarball written by [write_archive]
///
/// Every layer is checked against the digest in its file name.
pub fn read_archive<R: Read>(reader: R) -> Result<Image, Error> {
    let mut files: HashMap<String, Bytes> = HashMap::new();
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(path, data.into());
    }

    let manifest = file_data(&files, MANIFEST_PATH)?;
    let mut manifest: Vec<ArchiveManifest> = serde_json::from_slice(&manifest)?;
    let manifest = match (manifest.pop(), manifest.is_empty()) {
        (Some(manifest), true) => manifest,
        _ => {
            return Err(Error::InvalidArchive(
                "expected exactly one image in manifest.json".to_owned(),
            ))
        }
    };

    let config_digest = ContentDigest::parse(&manifest.config)?;
    let config = file_data(&files, &manifest.config)?;
    if !config_digest.matches(&config) {
        return Err(Error::ContentDigestMismatch {
            expected: config_digest,
            found: ContentDigest::from_content(&config),
        });
    }
    let config: RuntimeConfig = serde_json::from_slice(&config)?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for path in &manifest.layers {
        let hex = path.strip_suffix(LAYER_SUFFIX).ok_or_else(|| {
            Error::InvalidArchive(format!("unexpected layer file name {:?}", path))
        })?;
        let digest = ContentDigest::from_sha256_hex(hex)?;
        let data = file_data(&files, path)?;
        layers.push(Layer::from_compressed(digest, data)?);
    }
    Image::from_parts(config, layers)
}

fn layer_path(digest: &ContentDigest) -> String {
    format!("{}{}", digest.hex_str(), LAYER_SUFFIX)
}

fn file_data(files: &HashMap<String, Bytes>, path: &str) -> Result<Bytes, Error> {
    files
        .get(path)
        .cloned()
        .ok_or_else(|| Error::InvalidArchive(format!("missing {:?}", path)))
}

fn append_file<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<(), Error> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(crate::layer::SOURCE_DATE_EPOCH);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}
