//! Images, layers, and the identifiers used to address them

#[cfg(test)]
pub(crate) mod tests;

mod archive;
mod digest;
mod extract;
mod name;
mod reference;

pub use archive::{read_archive, write_archive, ARCHIVE_REPO_TAG};
pub use digest::ContentDigest;
pub use extract::flatten;
pub use name::ResourceName;
pub use reference::Reference;

use crate::{
    errors::Error,
    manifest::{media_types, ImageConfig, Link, Manifest, RuntimeConfig},
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::{collections::BTreeMap, fmt, io::Read};

/// One compressed filesystem layer, held in memory
///
/// Cloning a layer shares its data.
#[derive(Clone, PartialEq)]
pub struct Layer {
    digest: ContentDigest,
    diff_id: ContentDigest,
    uncompressed_size: u64,
    data: Bytes,
}

impl Layer {
    pub(crate) fn new(
        digest: ContentDigest,
        diff_id: ContentDigest,
        uncompressed_size: u64,
        data: Bytes,
    ) -> Self {
        Layer {
            digest,
            diff_id,
            uncompressed_size,
            data,
        }
    }

    /// Load a layer from its compressed bytes, checking them against `digest`
    pub fn from_compressed(digest: ContentDigest, data: Bytes) -> Result<Self, Error> {
        let found = ContentDigest::from_content(&data);
        if found != digest {
            return Err(Error::ContentDigestMismatch {
                expected: digest,
                found,
            });
        }
        let mut hasher = crate::layer::HashingWriter::new(std::io::sink());
        std::io::copy(&mut GzDecoder::new(&data[..]), &mut hasher)?;
        let (_, diff_id, uncompressed_size) = hasher.finish();
        Ok(Layer::new(digest, diff_id, uncompressed_size, data))
    }

    /// Digest of the compressed bytes
    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    /// Digest of the uncompressed tar
    pub fn diff_id(&self) -> &ContentDigest {
        &self.diff_id
    }

    /// Compressed size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Compressed bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Read back the uncompressed tar
    pub fn tar_reader(&self) -> impl Read + '_ {
        GzDecoder::new(&self.data[..])
    }

    pub fn link(&self) -> Link {
        Link {
            media_type: media_types::LAYER_TAR_GZIP.to_owned(),
            size: self.size(),
            digest: self.digest.clone(),
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Layer({}, {} bytes)", self.digest, self.data.len())
    }
}

/// A configuration plus an ordered list of layers
///
/// The config's `rootfs.diff_ids` always lists the layers' diff ids in
/// order. Images are plain values, so mutating one never affects a clone.
#[derive(Clone, PartialEq)]
pub struct Image {
    config: RuntimeConfig,
    layers: Vec<Layer>,
}

impl Default for Image {
    fn default() -> Self {
        Image::new(RuntimeConfig::default())
    }
}

impl Image {
    /// Start an image with no layers
    pub fn new(mut config: RuntimeConfig) -> Self {
        config.rootfs.diff_ids.clear();
        Image {
            config,
            layers: Vec::new(),
        }
    }

    /// Assemble an image from a config and its layers
    ///
    /// The config's diff ids must match the layers exactly.
    pub fn from_parts(config: RuntimeConfig, layers: Vec<Layer>) -> Result<Self, Error> {
        let diff_ids: Vec<&ContentDigest> = layers.iter().map(Layer::diff_id).collect();
        if config.rootfs.diff_ids.iter().collect::<Vec<_>>() != diff_ids {
            return Err(Error::InvalidArchive(
                "image config diff_ids do not match its layers".to_owned(),
            ));
        }
        Ok(Image { config, layers })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The container settings inside the config, minus the layer list
    pub fn image_config_mut(&mut self) -> &mut ImageConfig {
        &mut self.config.config
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.config.labels
    }

    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.config.config.labels
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Find a layer by digest
    pub fn layer(&self, digest: &ContentDigest) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.digest() == digest)
    }

    pub fn append_layer(&mut self, layer: Layer) {
        self.config.rootfs.diff_ids.push(layer.diff_id().clone());
        self.layers.push(layer);
    }

    /// Remove the first layer with this digest
    pub fn remove_layer(&mut self, digest: &ContentDigest) -> Option<Layer> {
        let index = self.layers.iter().position(|l| l.digest() == digest)?;
        self.config.rootfs.diff_ids.remove(index);
        Some(self.layers.remove(index))
    }

    /// Keep only the layers `keep` accepts
    pub fn retain_layers<F: FnMut(&Layer) -> bool>(&mut self, mut keep: F) {
        let layers = std::mem::take(&mut self.layers);
        self.config.rootfs.diff_ids.clear();
        for layer in layers {
            if keep(&layer) {
                self.append_layer(layer);
            }
        }
    }

    /// Serialize the config blob and the manifest pointing at it
    pub fn render(&self) -> Result<RenderedImage, Error> {
        let config = Bytes::from(serde_json::to_vec(&self.config)?);
        let config_digest = ContentDigest::from_content(&config);
        let manifest = Manifest {
            schema_version: 2,
            media_type: media_types::MANIFEST.to_owned(),
            config: Link {
                media_type: media_types::RUNTIME_CONFIG.to_owned(),
                size: config.len() as u64,
                digest: config_digest.clone(),
            },
            layers: self.layers.iter().map(Layer::link).collect(),
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest)?);
        log::trace!("rendered manifest {}", String::from_utf8_lossy(&manifest_bytes));
        Ok(RenderedImage {
            manifest_digest: ContentDigest::from_content(&manifest_bytes),
            manifest,
            manifest_bytes,
            config_digest,
            config,
        })
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("labels", self.labels())
            .field("layers", &self.layers)
            .finish()
    }
}

/// The serialized form of an [Image], as served to registry clients
#[derive(Clone, Debug)]
pub struct RenderedImage {
    pub manifest: Manifest,
    pub manifest_bytes: Bytes,
    pub manifest_digest: ContentDigest,
    pub config: Bytes,
    pub config_digest: ContentDigest,
}
