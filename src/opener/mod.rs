//! Turning resource URLs into tar streams
//!
//! Every URL scheme is served by one [Opener]. An [OpenerRegistry] is built
//! once at startup and then shared read-only by everything that installs or
//! serves resources.

mod file;
mod http;
mod thunderstore;

pub use self::{
    file::FileOpener,
    http::HttpOpener,
    thunderstore::{Package, ThunderstoreOpener},
};

use crate::errors::Error;
use async_trait::async_trait;
use std::{collections::HashMap, fmt, io::Read, sync::Arc};
use url::Url;

/// Uncompressed tar archive of the files making up one resource
pub type ByteStream = Box<dyn Read + Send>;

/// Handler for one kind of resource URL
#[async_trait]
pub trait Opener: Send + Sync {
    /// Fetch the resource, as a tar stream
    async fn open(&self, url: &Url) -> Result<ByteStream, Error>;

    /// Cheap freshness marker for the resource
    ///
    /// Whenever the upstream content changes, so does this key. It's compared
    /// instead of content digests so that an unchanged resource never has to
    /// be downloaded and hashed again.
    async fn cache_key(&self, url: &Url) -> Result<String, Error>;
}

/// Builder for an [OpenerRegistry]
#[derive(Default)]
pub struct OpenerRegistryBuilder {
    openers: HashMap<String, Arc<dyn Opener>>,
}

impl OpenerRegistryBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Serve `scheme` and any `aliases` with this opener
    ///
    /// # Panics
    ///
    /// Registering a scheme twice is a programming error, and panics.
    pub fn register<O: Opener + 'static>(self, opener: O, scheme: &str, aliases: &[&str]) -> Self {
        self.register_arc(Arc::new(opener), scheme, aliases)
    }

    /// Like [OpenerRegistryBuilder::register], for an opener that's already shared
    pub fn register_arc(mut self, opener: Arc<dyn Opener>, scheme: &str, aliases: &[&str]) -> Self {
        for scheme in std::iter::once(&scheme).chain(aliases.iter()) {
            let scheme = scheme.to_ascii_lowercase();
            if self.openers.contains_key(&scheme) {
                panic!("attempt to register scheme {:?} twice", scheme);
            }
            self.openers.insert(scheme, opener.clone());
        }
        self
    }

    /// Register the openers that need nothing outside this crate
    ///
    /// That's `file`, `http` and `https` sharing one client, and
    /// `thunderstore` talking to the given server.
    pub fn register_builtin(self, client: reqwest::Client, thunderstore_url: Url) -> Self {
        self.register(FileOpener::new(), FileOpener::SCHEME, &[])
            .register(HttpOpener::new(client.clone()), "http", &["https"])
            .register(
                ThunderstoreOpener::new(client, thunderstore_url),
                ThunderstoreOpener::SCHEME,
                &[],
            )
    }

    pub fn build(self) -> OpenerRegistry {
        OpenerRegistry {
            openers: Arc::new(self.openers),
        }
    }
}

/// Scheme-keyed dispatch to [Opener]s
///
/// Cloning a registry shares it.
#[derive(Clone)]
pub struct OpenerRegistry {
    openers: Arc<HashMap<String, Arc<dyn Opener>>>,
}

impl OpenerRegistry {
    pub fn builder() -> OpenerRegistryBuilder {
        OpenerRegistryBuilder::new()
    }

    /// Is anything registered for this scheme?
    pub fn supports(&self, scheme: &str) -> bool {
        self.openers.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.openers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Parse a URL and find the opener for its scheme
    pub fn resolve(&self, url: &str) -> Result<(Url, Arc<dyn Opener>), Error> {
        let parsed = Url::parse(url).map_err(|_| Error::InvalidResourceId(url.to_owned()))?;
        match self.openers.get(&parsed.scheme().to_ascii_lowercase()) {
            Some(opener) => Ok((parsed, opener.clone())),
            None => Err(Error::UnsupportedScheme(parsed.scheme().to_owned())),
        }
    }

    /// Fetch a resource as a tar stream
    pub async fn open(&self, url: &str) -> Result<ByteStream, Error> {
        let (url, opener) = self.resolve(url)?;
        log::debug!("opening {}", url);
        opener.open(&url).await
    }

    /// Fetch a resource's freshness marker
    pub async fn cache_key(&self, url: &str) -> Result<String, Error> {
        let (url, opener) = self.resolve(url)?;
        let key = opener.cache_key(&url).await?;
        log::debug!("cache key for {} is {:?}", url, key);
        Ok(key)
    }
}

impl fmt::Debug for OpenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenerRegistry({:?})", self.schemes())
    }
}
