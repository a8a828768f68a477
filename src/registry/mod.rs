//! Read-only registry that builds images on demand
//!
//! A client pulling `{name}:{branch}` gets a one-layer image built on the
//! spot from the resource the [Resolver] maps that name to. Everything built
//! is written to a [BlobStore] by digest, so pulls by digest, and the blob
//! downloads that follow a manifest, are served from the store.

mod http;
mod resolver;

pub use self::{
    http::{router, DOCKER_CONTENT_DIGEST, DOCKER_DISTRIBUTION_API_VERSION},
    resolver::{NumericResolver, Resolver, ThunderstoreResolver},
};

use crate::{
    errors::Error,
    image::{ContentDigest, Image, RenderedImage, Reference, ResourceName},
    layer::{LayerBuilder, Owner},
    manifest::media_types,
    opener::OpenerRegistry,
    storage::{BlobStore, StorageKey},
};
use bytes::Bytes;
use futures_util::future::try_join_all;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};
use tokio::{sync::Mutex as AsyncMutex, task};

/// Label prefix used when none is configured
pub const DEFAULT_LABEL_PREFIX: &str = "cc.hoard.resource";

/// Builder for configuring a [PullRegistry]
pub struct PullRegistryBuilder {
    openers: OpenerRegistry,
    resolver: Arc<dyn Resolver>,
    store: Arc<dyn BlobStore>,
    base: Image,
    dir: String,
    owner: Owner,
    label_prefix: String,
    user: Option<String>,
    env: Vec<String>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    working_dir: Option<String>,
}

impl PullRegistryBuilder {
    pub fn new(openers: OpenerRegistry, resolver: Arc<dyn Resolver>, store: Arc<dyn BlobStore>) -> Self {
        PullRegistryBuilder {
            openers,
            resolver,
            store,
            base: Image::default(),
            dir: String::new(),
            owner: Owner::ROOT,
            label_prefix: DEFAULT_LABEL_PREFIX.to_owned(),
            user: None,
            env: Vec::new(),
            entrypoint: None,
            cmd: None,
            working_dir: None,
        }
    }

    /// Image every built layer is stacked on, empty by default
    pub fn base_image(mut self, base: Image) -> Self {
        self.base = base;
        self
    }

    /// Directory the resource's files are placed in, relative to the root
    pub fn dir(mut self, dir: &str) -> Self {
        self.dir = dir.trim_start_matches('/').to_owned();
        self
    }

    /// Owner written into every built file
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    /// Prefix of the `.name`, `.branch` and `.url` labels on built images
    pub fn label_prefix(mut self, prefix: &str) -> Self {
        self.label_prefix = prefix.to_owned();
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_owned());
        self
    }

    /// Add a `KEY=value` environment entry to built images
    pub fn env(mut self, entry: &str) -> Self {
        self.env.push(entry.to_owned());
        self
    }

    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_owned());
        self
    }

    pub fn build(self) -> Result<PullRegistry, Error> {
        let layer_builder = LayerBuilder::new(&self.dir)?.owner(self.owner);
        let mut base = self.base;
        {
            let config = base.image_config_mut();
            if let Some(user) = self.user {
                config.user = user;
            }
            config.env.extend(self.env);
            if self.entrypoint.is_some() {
                config.entrypoint = self.entrypoint;
            }
            if self.cmd.is_some() {
                config.cmd = self.cmd;
            }
            if let Some(working_dir) = self.working_dir {
                config.working_dir = working_dir;
            }
        }
        Ok(PullRegistry {
            inner: Arc::new(Inner {
                openers: self.openers,
                resolver: self.resolver,
                store: self.store,
                base,
                layer_builder,
                label_prefix: self.label_prefix,
                flights: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// A manifest, ready to send
#[derive(Clone, Debug)]
pub struct ManifestResponse {
    pub digest: ContentDigest,
    pub media_type: &'static str,
    pub data: Bytes,
}

/// A blob, ready to send
#[derive(Clone, Debug)]
pub struct BlobResponse {
    pub digest: ContentDigest,
    pub data: Bytes,
}

struct Built {
    image: Image,
    rendered: RenderedImage,
}

impl Built {
    fn manifest(&self) -> ManifestResponse {
        ManifestResponse {
            digest: self.rendered.manifest_digest.clone(),
            media_type: media_types::MANIFEST,
            data: self.rendered.manifest_bytes.clone(),
        }
    }

    fn blob(&self, digest: &ContentDigest) -> Option<Bytes> {
        if digest == &self.rendered.config_digest {
            Some(self.rendered.config.clone())
        } else {
            self.image.layer(digest).map(|layer| layer.data().clone())
        }
    }

    fn blobs(&self) -> Vec<(ContentDigest, Bytes)> {
        let mut blobs = vec![(
            self.rendered.config_digest.clone(),
            self.rendered.config.clone(),
        )];
        for layer in self.image.layers() {
            blobs.push((layer.digest().clone(), layer.data().clone()));
        }
        blobs
    }
}

type FlightKey = (ResourceName, String);
type Flight = Arc<AsyncMutex<Option<Arc<Built>>>>;

struct Inner {
    openers: OpenerRegistry,
    resolver: Arc<dyn Resolver>,
    store: Arc<dyn BlobStore>,
    base: Image,
    layer_builder: LayerBuilder,
    label_prefix: String,
    flights: Mutex<HashMap<FlightKey, Weak<AsyncMutex<Option<Arc<Built>>>>>>,
}

/// Pull side of the registry protocol, building images on cache misses
///
/// Cloning a registry shares its state.
#[derive(Clone)]
pub struct PullRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for PullRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PullRegistry({:?})", self.inner.openers)
    }
}

impl PullRegistry {
    pub fn builder(
        openers: OpenerRegistry,
        resolver: Arc<dyn Resolver>,
        store: Arc<dyn BlobStore>,
    ) -> PullRegistryBuilder {
        PullRegistryBuilder::new(openers, resolver, store)
    }

    fn parse_name(&self, name: &str) -> Result<ResourceName, Error> {
        let name = ResourceName::parse(name)?;
        self.inner.resolver.validate(&name)?;
        Ok(name)
    }

    /// Check a manifest request without building anything
    ///
    /// Branches only need a valid name. Digests must already be cached.
    pub async fn head_manifest(&self, name: &str, reference: &str) -> Result<(), Error> {
        let name = self.parse_name(name)?;
        let reference = Reference::parse(reference)?;
        if reference.is_content_digest() {
            let key = StorageKey::Manifest(name, reference);
            if !self.inner.store.exists(&key).await? {
                return Err(Error::NotFound(format!("{:?}", key)));
            }
        }
        Ok(())
    }

    /// Manifest for a branch, `latest`, or a digest
    ///
    /// Branches are built fresh every time. Digests come from the store; a
    /// digest that isn't stored but was produced by a known branch is served
    /// by rebuilding that branch, if it still produces the same digest.
    pub async fn get_manifest(&self, name: &str, reference: &str) -> Result<ManifestResponse, Error> {
        let name = self.parse_name(name)?;
        let branch = match Reference::parse(reference)? {
            Reference::Latest => self.inner.resolver.default_branch().to_owned(),
            Reference::Branch(branch) => branch,
            Reference::ContentDigest(digest) => {
                return self.manifest_by_digest(name, digest).await;
            }
        };
        Ok(self.build(&name, &branch).await?.manifest())
    }

    async fn manifest_by_digest(
        &self,
        name: ResourceName,
        digest: ContentDigest,
    ) -> Result<ManifestResponse, Error> {
        let key = StorageKey::Manifest(name.clone(), Reference::ContentDigest(digest.clone()));
        if let Some(data) = self.inner.store.get(&key).await? {
            log::debug!("manifest cache hit, {:?}", key);
            return Ok(ManifestResponse {
                digest,
                media_type: media_types::MANIFEST,
                data,
            });
        }
        let branch = self.branch_of(&name, &digest).await?;
        let built = self.build(&name, &branch).await?;
        if built.rendered.manifest_digest == digest {
            Ok(built.manifest())
        } else {
            log::warn!("{} branch {} no longer builds {}", name, branch, digest);
            Err(Error::NotFound(format!("{:?}", key)))
        }
    }

    /// Check that a blob can be served, returning its size
    pub async fn head_blob(&self, name: &str, digest: &str) -> Result<u64, Error> {
        Ok(self.get_blob(name, digest).await?.data.len() as u64)
    }

    /// Config or layer blob, from the store or rebuilt from its branch
    pub async fn get_blob(&self, name: &str, digest: &str) -> Result<BlobResponse, Error> {
        let name = self.parse_name(name)?;
        let digest = ContentDigest::parse(digest)?;
        let key = StorageKey::Blob(name.clone(), digest.clone());
        if let Some(data) = self.inner.store.get(&key).await? {
            log::debug!("blob cache hit, {:?}", key);
            return Ok(BlobResponse { digest, data });
        }
        let branch = self.branch_of(&name, &digest).await?;
        let built = self.build(&name, &branch).await?;
        match built.blob(&digest) {
            Some(data) => Ok(BlobResponse { digest, data }),
            None => {
                log::warn!("{} branch {} no longer builds {}", name, branch, digest);
                Err(Error::NotFound(format!("{:?}", key)))
            }
        }
    }

    async fn branch_of(&self, name: &ResourceName, digest: &ContentDigest) -> Result<String, Error> {
        let key = StorageKey::Branch(name.clone(), digest.clone());
        match self.inner.store.get(&key).await? {
            Some(branch) => String::from_utf8(branch.to_vec())
                .map_err(|_| Error::InvalidArchive(format!("stored branch for {:?}", key))),
            None => Err(Error::NotFound(format!("{}@{}", name, digest))),
        }
    }

    fn flight(&self, key: FlightKey) -> Flight {
        let mut flights = self
            .inner
            .flights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        flights.retain(|_, flight| flight.strong_count() > 0);
        if let Some(flight) = flights.get(&key).and_then(Weak::upgrade) {
            return flight;
        }
        let flight = Arc::new(AsyncMutex::new(None));
        flights.insert(key, Arc::downgrade(&flight));
        flight
    }

    /// Build one branch, sharing the result with concurrent requests for it
    async fn build(&self, name: &ResourceName, branch: &str) -> Result<Arc<Built>, Error> {
        let flight = self.flight((name.clone(), branch.to_owned()));
        let mut slot = flight.lock().await;
        if let Some(built) = slot.as_ref() {
            log::debug!("{} branch {} was just built, sharing it", name, branch);
            return Ok(built.clone());
        }
        let built = Arc::new(self.build_uncached(name, branch).await?);
        *slot = Some(built.clone());
        Ok(built)
    }

    async fn build_uncached(&self, name: &ResourceName, branch: &str) -> Result<Built, Error> {
        let url = self.inner.resolver.resource_url(name, branch)?;
        log::info!("building {} branch {} from {}", name, branch, url);

        let stream = self.inner.openers.open(&url).await?;
        let builder = self.inner.layer_builder.clone();
        let layer = task::spawn_blocking(move || builder.build(stream)).await??;

        let mut image = self.inner.base.clone();
        let prefix = &self.inner.label_prefix;
        let labels = image.labels_mut();
        labels.insert(format!("{}.name", prefix), name.to_string());
        labels.insert(format!("{}.branch", prefix), branch.to_owned());
        labels.insert(format!("{}.url", prefix), url);
        image.append_layer(layer);

        let rendered = image.render()?;
        let built = Built { image, rendered };
        self.populate(name, branch, &built).await?;
        log::info!(
            "built {} branch {} as {}",
            name,
            branch,
            built.rendered.manifest_digest
        );
        Ok(built)
    }

    /// Store blobs, then branch mappings, then the manifest
    ///
    /// A stored manifest therefore always has its blobs stored or
    /// rebuildable.
    async fn populate(&self, name: &ResourceName, branch: &str, built: &Built) -> Result<(), Error> {
        let store = &self.inner.store;
        let blobs = built.blobs();

        try_join_all(blobs.iter().map(|(digest, data)| async move {
            let key = StorageKey::Blob(name.clone(), digest.clone());
            if !store.exists(&key).await? {
                store.put(&key, data.clone()).await?;
            }
            Ok::<(), Error>(())
        }))
        .await?;

        let branch_data = Bytes::from(branch.to_owned());
        let mapped = blobs
            .iter()
            .map(|(digest, _)| digest.clone())
            .chain(std::iter::once(built.rendered.manifest_digest.clone()));
        try_join_all(mapped.map(|digest| {
            let data = branch_data.clone();
            async move {
                let key = StorageKey::Branch(name.clone(), digest);
                store.put(&key, data).await
            }
        }))
        .await?;

        let key = StorageKey::Manifest(
            name.clone(),
            Reference::ContentDigest(built.rendered.manifest_digest.clone()),
        );
        if !store.exists(&key).await? {
            store.put(&key, built.rendered.manifest_bytes.clone()).await?;
        }
        Ok(())
    }
}
