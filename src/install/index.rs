use crate::{errors::Error, image::ContentDigest};
use std::{
    borrow::Cow,
    collections::{btree_map, BTreeMap},
    fmt,
};
use url::Url;

const DIR_PARAM: &str = "dir";

/// One installed resource, and the layer currently holding its files
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Installation {
    /// Digest of the layer built from this resource
    pub digest: ContentDigest,
    /// Resource URL, with its query normalized
    pub url: Url,
    /// Freshness marker the layer was built under
    pub cache_key: String,
    /// Directory the files were placed in, relative to the image root
    pub dir: String,
}

impl Installation {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }
}

impl fmt::Display for Installation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {:?} ({})", self.url, self.dir, self.digest)
    }
}

/// Query parameters grouped by key, in key order, dropping keys with no
/// non-empty value
fn grouped_query<'a, I>(pairs: I) -> BTreeMap<String, Vec<String>>
where
    I: Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    grouped.retain(|_, values| values.iter().any(|v| !v.is_empty()));
    grouped
}

fn with_query(url: &Url, grouped: &BTreeMap<String, Vec<String>>) -> Url {
    let mut result = url.clone();
    if grouped.is_empty() {
        result.set_query(None);
    } else {
        let mut serializer = result.query_pairs_mut();
        serializer.clear();
        for (key, values) in grouped {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
    }
    result
}

/// Encode a resource URL and its directory as one string
///
/// This is the identity of an installation: the URL with `dir` added to its
/// query, empty parameters dropped, and parameters sorted by key.
pub fn label_value(url: &Url, dir: &str) -> String {
    let pairs = url
        .query_pairs()
        .filter(|(key, _)| key != DIR_PARAM)
        .chain(std::iter::once((Cow::Borrowed(DIR_PARAM), Cow::Borrowed(dir))));
    with_query(url, &grouped_query(pairs)).to_string()
}

/// Split a label value back into the resource URL and its directory
pub fn parse_label_value(value: &str) -> Result<(Url, String), Error> {
    let url = Url::parse(value).map_err(|_| Error::InvalidArchive(format!("bad label {:?}", value)))?;
    let mut grouped = grouped_query(url.query_pairs());
    let dir = grouped
        .remove(DIR_PARAM)
        .and_then(|values| values.into_iter().next())
        .unwrap_or_default();
    Ok((with_query(&url, &grouped), dir))
}

/// The installations recorded in an image's labels
///
/// Each installation is stored as one label: the key is
/// `{prefix}.{digest hex}.{cache key}` and the value is [label_value]. The
/// index is keyed by label value, so there is at most one installation per
/// URL and directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallationIndex {
    prefix: String,
    entries: BTreeMap<String, Installation>,
}

impl InstallationIndex {
    pub fn new(prefix: &str) -> Self {
        InstallationIndex {
            prefix: prefix.to_owned(),
            entries: BTreeMap::new(),
        }
    }

    /// Collect every installation label under our prefix
    pub fn from_labels(prefix: &str, labels: &BTreeMap<String, String>) -> Result<Self, Error> {
        let mut index = InstallationIndex::new(prefix);
        for (key, value) in labels {
            if index.owns_label(key) {
                let installation = index.parse_label(key, value)?;
                index.entries.insert(value.clone(), installation);
            }
        }
        Ok(index)
    }

    fn label_prefix(&self) -> String {
        format!("{}.", self.prefix)
    }

    fn owns_label(&self, key: &str) -> bool {
        key.starts_with(&self.label_prefix())
    }

    pub fn label_key(&self, installation: &Installation) -> String {
        format!(
            "{}.{}.{}",
            self.prefix,
            installation.digest.hex_str(),
            installation.cache_key
        )
    }

    pub fn parse_label(&self, key: &str, value: &str) -> Result<Installation, Error> {
        let rest = key
            .strip_prefix(&self.label_prefix())
            .ok_or_else(|| Error::InvalidArchive(format!("label {:?} is not ours", key)))?;
        let mut parts = rest.splitn(2, '.');
        let (hex, cache_key) = match (parts.next(), parts.next()) {
            (Some(hex), Some(cache_key)) => (hex, cache_key),
            _ => {
                return Err(Error::InvalidArchive(format!(
                    "invalid installation label {:?}",
                    key
                )))
            }
        };
        let (url, dir) = parse_label_value(value)?;
        Ok(Installation {
            digest: ContentDigest::from_sha256_hex(hex)?,
            url,
            cache_key: cache_key.to_owned(),
            dir,
        })
    }

    pub fn get(&self, url: &Url, dir: &str) -> Option<&Installation> {
        self.entries.get(&label_value(url, dir))
    }

    /// Record an installation, returning any it replaces
    ///
    /// Fails if a different URL or directory already holds the same label
    /// key, which happens when two spellings of one resource build the same
    /// layer under the same cache key.
    pub fn insert(&mut self, installation: Installation) -> Result<Option<Installation>, Error> {
        let value = label_value(&installation.url, &installation.dir);
        let key = self.label_key(&installation);
        if let Some((other, _)) = self
            .entries
            .iter()
            .find(|(other, existing)| **other != value && self.label_key(existing) == key)
        {
            return Err(Error::InstallationConflict {
                url: value,
                existing: other.clone(),
            });
        }
        Ok(self.entries.insert(value, installation))
    }

    pub fn remove(&mut self, url: &Url, dir: &str) -> Option<Installation> {
        self.entries.remove(&label_value(url, dir))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Installations, ordered by label value
    pub fn iter(&self) -> btree_map::Values<'_, String, Installation> {
        self.entries.values()
    }

    /// Replace every label under our prefix with the current entries
    pub fn write_labels(&self, labels: &mut BTreeMap<String, String>) {
        let prefix = self.label_prefix();
        labels.retain(|key, _| !key.starts_with(&prefix));
        for (value, installation) in &self.entries {
            labels.insert(self.label_key(installation), value.clone());
        }
    }
}

/// Build the [Installation] record for a freshly built layer
pub fn new_installation(url: &Url, dir: &str, digest: ContentDigest, cache_key: String) -> Result<Installation, Error> {
    let (url, dir) = parse_label_value(&label_value(url, dir))?;
    Ok(Installation {
        digest,
        url,
        cache_key,
        dir,
    })
}
