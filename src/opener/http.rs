use crate::{
    errors::Error,
    image::ContentDigest,
    opener::{ByteStream, Opener},
};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::{header, header::HeaderMap, Response};
use std::io::Cursor;
use url::Url;

/// Opener for tarballs served over `http` and `https`
///
/// The response body may be a plain or a gzipped tar.
#[derive(Clone, Debug)]
pub struct HttpOpener {
    client: reqwest::Client,
}

impl HttpOpener {
    pub fn new(client: reqwest::Client) -> Self {
        HttpOpener { client }
    }

    async fn get(&self, url: &Url) -> Result<Response, Error> {
        log::info!("fetching {}", url);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(Error::from_status(url.as_str(), status.as_u16()))
        }
    }
}

pub(crate) fn tar_stream(body: Bytes) -> ByteStream {
    if body.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(Cursor::new(body)))
    } else {
        Box::new(Cursor::new(body))
    }
}

/// Usable part of an `ETag`, without the weak marker or quotes
fn etag_value(etag: &str) -> &str {
    etag.trim_start_matches("W/").trim_matches('"')
}

/// Freshness marker from response headers, preferring `ETag` to `Last-Modified`
fn header_cache_key(headers: &HeaderMap) -> Option<String> {
    let etag = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(etag_value)
        .filter(|etag| !etag.is_empty());
    let modified = headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok());
    etag.or(modified).map(str::to_owned)
}

#[async_trait]
impl Opener for HttpOpener {
    async fn open(&self, url: &Url) -> Result<ByteStream, Error> {
        let body = self.get(url).await?.bytes().await?;
        log::debug!("downloaded {} bytes from {}", body.len(), url);
        Ok(tar_stream(body))
    }

    /// Ask with `HEAD` first, and only download and hash the body when the
    /// server offers no freshness headers
    async fn cache_key(&self, url: &Url) -> Result<String, Error> {
        let head = self.client.head(url.clone()).send().await?;
        if head.status().is_success() {
            if let Some(key) = header_cache_key(head.headers()) {
                return Ok(key);
            }
        } else {
            log::debug!("HEAD {} returned {}, trying GET", url, head.status());
        }
        let response = self.get(url).await?;
        if let Some(key) = header_cache_key(response.headers()) {
            return Ok(key);
        }
        let body = response.bytes().await?;
        Ok(ContentDigest::from_content(&body).hex_str().to_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn etag_cleanup() {
        assert_eq!(etag_value("\"abc\""), "abc");
        assert_eq!(etag_value("W/\"abc\""), "abc");
        assert_eq!(etag_value("abc"), "abc");
    }

    #[test]
    fn header_preference() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_cache_key(&headers), None);
        headers.insert(
            header::LAST_MODIFIED,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(
            header_cache_key(&headers).as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
        headers.insert(header::ETAG, "\"\"".parse().unwrap());
        assert_eq!(
            header_cache_key(&headers).as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
        headers.insert(header::ETAG, "W/\"v2\"".parse().unwrap());
        assert_eq!(header_cache_key(&headers).as_deref(), Some("v2"));
    }
}
