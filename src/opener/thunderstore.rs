use crate::{
    errors::Error,
    opener::{ByteStream, Opener},
};
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use std::{
    fmt,
    io::{Cursor, Read},
    path::{Component, Path, PathBuf},
};
use tar::{Builder, EntryType, Header};
use tokio::task;
use url::Url;

/// A package on a Thunderstore mod repository
///
/// Written as `namespace/name`, `namespace/name@version`, or as the
/// repository's own full names `namespace-name` and `namespace-name-version`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Package {
    pub namespace: String,
    pub name: String,
    pub version: Option<String>,
}

impl Package {
    pub fn parse(s: &str) -> Result<Self, Error> {
        lazy_static! {
            static ref SEPARATORS: Regex = Regex::new("[/@:]").unwrap();
        }
        let parts: Vec<&str> = SEPARATORS.split(s).collect();
        match Package::from_parts(&parts) {
            Some(package) => Ok(package),
            None => {
                let parts: Vec<&str> = s.split('-').collect();
                Package::from_parts(&parts).ok_or_else(|| Error::InvalidResourceId(s.to_owned()))
            }
        }
    }

    /// Package named by a `thunderstore://` URL's host and path
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let host = url.host_str().unwrap_or("");
        Package::parse(&format!("{}{}", host, url.path()))
    }

    fn from_parts(parts: &[&str]) -> Option<Self> {
        if parts.iter().any(|part| part.is_empty()) {
            return None;
        }
        match parts {
            [namespace, name] => Some(Package {
                namespace: (*namespace).to_owned(),
                name: (*name).to_owned(),
                version: None,
            }),
            [namespace, name, version] => Some(Package {
                namespace: (*namespace).to_owned(),
                name: (*name).to_owned(),
                version: Some((*version).to_owned()),
            }),
            _ => None,
        }
    }

    /// Same package, pinned to a version
    pub fn with_version(&self, version: &str) -> Self {
        Package {
            version: Some(version.to_owned()),
            ..self.clone()
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}-{}-{}", self.namespace, self.name, version),
            None => write!(f, "{}-{}", self.namespace, self.name),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageInfo {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    version_number: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    latest: Option<Box<PackageInfo>>,
    #[serde(default)]
    detail: Option<String>,
}

const NOT_FOUND_DETAIL: &str = "Not found.";

/// Opener for `thunderstore://` package URLs
///
/// Packages are downloaded as zip files and re-emitted as tar streams.
#[derive(Clone, Debug)]
pub struct ThunderstoreOpener {
    client: reqwest::Client,
    base: Url,
}

impl ThunderstoreOpener {
    pub const SCHEME: &'static str = "thunderstore";
    pub const DEFAULT_URL: &'static str = "https://thunderstore.io/";

    pub fn new(client: reqwest::Client, mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        ThunderstoreOpener { client, base }
    }

    fn api_url(&self, package: &Package) -> Result<Url, Error> {
        let mut path = format!("api/experimental/package/{}/{}/", package.namespace, package.name);
        if let Some(version) = &package.version {
            path.push_str(version);
            path.push('/');
        }
        Ok(self.base.join(&path)?)
    }

    fn download_url(&self, package: &Package, version: &str) -> Result<Url, Error> {
        Ok(self.base.join(&format!(
            "package/download/{}/{}/{}/",
            package.namespace, package.name, version
        ))?)
    }

    async fn package_info(&self, package: &Package) -> Result<PackageInfo, Error> {
        let url = self.api_url(package)?;
        log::debug!("fetching package info for {} from {}", package, url);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        log::trace!("raw package info, {}", String::from_utf8_lossy(&body));
        let info: Option<PackageInfo> = serde_json::from_slice(&body).ok();
        let not_found = info
            .as_ref()
            .and_then(|info| info.detail.as_deref())
            .map_or(false, |detail| detail == NOT_FOUND_DETAIL);
        if not_found {
            return Err(Error::NotFound(package.to_string()));
        }
        if !status.is_success() {
            return Err(Error::from_status(url.as_str(), status.as_u16()));
        }
        match info {
            Some(info) => Ok(info),
            None => Ok(serde_json::from_slice(&body)?),
        }
    }

    async fn download(&self, url: Url) -> Result<Bytes, Error> {
        log::info!("downloading {}", url);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(url.as_str(), status.as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl Opener for ThunderstoreOpener {
    async fn open(&self, url: &Url) -> Result<ByteStream, Error> {
        let package = Package::from_url(url)?;
        let download = match &package.version {
            Some(version) => self.download_url(&package, version)?,
            None => {
                let info = self.package_info(&package).await?;
                let latest = info.latest.ok_or_else(|| {
                    Error::InvalidArchive(format!("no latest version listed for {}", package))
                })?;
                match (latest.download_url, latest.version_number) {
                    (Some(download), _) => Url::parse(&download)?,
                    (None, Some(version)) => self.download_url(&package, &version)?,
                    (None, None) => {
                        return Err(Error::InvalidArchive(format!(
                            "no download for latest {}",
                            package
                        )))
                    }
                }
            }
        };
        let zip = self.download(download).await?;
        let name = package.name;
        let tar = task::spawn_blocking(move || tar_from_zip(zip, &name)).await??;
        Ok(Box::new(Cursor::new(tar)))
    }

    async fn cache_key(&self, url: &Url) -> Result<String, Error> {
        let package = Package::from_url(url)?;
        let info = self.package_info(&package).await?;
        let full_name = match info.latest {
            Some(latest) => latest.full_name,
            None => info.full_name,
        };
        if full_name.is_empty() {
            Err(Error::InvalidArchive(format!("no full_name listed for {}", package)))
        } else {
            Ok(full_name)
        }
    }
}

/// Relative path of a zip entry, `None` if it would land outside the root
fn zip_entry_path(name: &str) -> Option<PathBuf> {
    let name = name.replace('\\', "/");
    let mut result = PathBuf::new();
    for component in Path::new(&name).components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::CurDir | Component::RootDir => (),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if result.as_os_str().is_empty() {
        None
    } else {
        Some(result)
    }
}

/// Rewrite a zip archive as a tar, in the zip's own entry order
///
/// Packages often wrap their files in a folder named after the package.
/// That leading folder is dropped so its contents land at the root.
pub(crate) fn tar_from_zip(zip: Bytes, package_name: &str) -> Result<Vec<u8>, Error> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip))?;
    let mut builder = Builder::new(Vec::new());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let raw_name = file.name().to_owned();
        let path = match zip_entry_path(&raw_name) {
            Some(path) => path,
            None => {
                if raw_name.trim_matches(|c| c == '/' || c == '\\' || c == '.').is_empty() {
                    continue;
                }
                log::warn!("skipping zip entry that escapes its root, {:?}", raw_name);
                continue;
            }
        };
        let path = match path.strip_prefix(package_name) {
            Ok(inner) if inner.as_os_str().is_empty() => continue,
            Ok(inner) => inner.to_path_buf(),
            Err(_) => path,
        };
        let mut header = Header::new_gnu();
        if file.is_dir() || raw_name.ends_with('\\') {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(file.unix_mode().unwrap_or(0o755) & 0o7777);
            header.set_size(0);
            builder.append_data(&mut header, &path, std::io::empty())?;
        } else {
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            header.set_entry_type(EntryType::Regular);
            header.set_mode(file.unix_mode().unwrap_or(0o644) & 0o7777);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, &path, &data[..])?;
        }
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::tests::untar;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn parse_package() {
        let expect = |ns: &str, name: &str, version: Option<&str>| Package {
            namespace: ns.to_owned(),
            name: name.to_owned(),
            version: version.map(str::to_owned),
        };
        assert_eq!(
            Package::parse("denikson/BepInExPack_Valheim@5.4.21").unwrap(),
            expect("denikson", "BepInExPack_Valheim", Some("5.4.21"))
        );
        assert_eq!(
            Package::parse("denikson/BepInExPack_Valheim").unwrap(),
            expect("denikson", "BepInExPack_Valheim", None)
        );
        assert_eq!(
            Package::parse("denikson-BepInExPack_Valheim-5.4.21").unwrap(),
            expect("denikson", "BepInExPack_Valheim", Some("5.4.21"))
        );
        assert_eq!(
            Package::parse("denikson:BepInExPack_Valheim").unwrap(),
            expect("denikson", "BepInExPack_Valheim", None)
        );
        assert!(Package::parse("denikson").is_err());
        assert!(Package::parse("a//b").is_err());
        assert!(Package::parse("a/b/c/d").is_err());

        let url = Url::parse("thunderstore://denikson/BepInExPack_Valheim@5.4.21").unwrap();
        assert_eq!(
            Package::from_url(&url).unwrap().to_string(),
            "denikson-BepInExPack_Valheim-5.4.21"
        );
    }

    #[test]
    fn api_paths() {
        let opener = ThunderstoreOpener::new(
            reqwest::Client::new(),
            Url::parse("http://localhost:1234/mirror").unwrap(),
        );
        let package = Package::parse("ns/name").unwrap();
        assert_eq!(
            opener.api_url(&package).unwrap().as_str(),
            "http://localhost:1234/mirror/api/experimental/package/ns/name/"
        );
        assert_eq!(
            opener.api_url(&package.with_version("1.0.0")).unwrap().as_str(),
            "http://localhost:1234/mirror/api/experimental/package/ns/name/1.0.0/"
        );
        assert_eq!(
            opener.download_url(&package, "1.0.0").unwrap().as_str(),
            "http://localhost:1234/mirror/package/download/ns/name/1.0.0/"
        );
    }

    #[test]
    fn zip_to_tar() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.add_directory("plugins/", options).unwrap();
        zip.start_file("plugins\\mod.dll", options).unwrap();
        zip.write_all(b"dll").unwrap();
        zip.start_file("../evil", options).unwrap();
        zip.write_all(b"nope").unwrap();
        zip.start_file("manifest.json", options).unwrap();
        zip.write_all(b"{}").unwrap();
        zip.add_directory("BepInExPack_Valheim/", options).unwrap();
        zip.start_file("BepInExPack_Valheim\\winhttp.dll", options).unwrap();
        zip.write_all(b"proxy").unwrap();
        zip.start_file("BepInExPack_Valheim/BepInEx/core/BepInEx.dll", options)
            .unwrap();
        zip.write_all(b"core").unwrap();
        zip.start_file("BepInExPack_ValheimExtra/readme.txt", options).unwrap();
        zip.write_all(b"kept").unwrap();
        let zip = zip.finish().unwrap().into_inner();

        let entries = untar(&tar_from_zip(zip.into(), "BepInExPack_Valheim").unwrap());
        let paths: Vec<&str> = entries
            .iter()
            .map(|e| e.path.trim_end_matches('/'))
            .collect();
        assert_eq!(
            paths,
            vec![
                "plugins",
                "plugins/mod.dll",
                "manifest.json",
                "winhttp.dll",
                "BepInEx/core/BepInEx.dll",
                "BepInExPack_ValheimExtra/readme.txt",
            ]
        );
        assert_eq!(entries[1].data, b"dll");
        assert_eq!(entries[3].data, b"proxy");
    }
}
