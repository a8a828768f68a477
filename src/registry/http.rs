use crate::{
    errors::{Error, ErrorKind},
    registry::PullRegistry,
};
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderValue, Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;

pub const DOCKER_DISTRIBUTION_API_VERSION: &str = "docker-distribution-api-version";
pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

const API_VERSION: &str = "registry/2.0";
const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// HTTP front end for a [PullRegistry]
///
/// Everything is routed by hand from the request path, since names may hold
/// any number of `/`-separated segments. With no registry, every request is
/// answered with 404, including the `/v2/` version check.
pub fn router(registry: Option<PullRegistry>) -> Router {
    Router::new().fallback(handle).with_state(registry)
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    errors: Vec<ErrorDetail>,
}

/// An error on its way to becoming a registry error response
#[derive(Debug)]
struct RegistryError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl RegistryError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        RegistryError {
            status,
            code,
            message: message.into(),
        }
    }

    fn from_error(err: &Error, kind: Kind) -> Self {
        let (status, code) = match err.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, kind.unknown_code()),
            ErrorKind::UnsupportedScheme => (StatusCode::NOT_FOUND, "UNSUPPORTED"),
            ErrorKind::InvalidResourceId => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
            ErrorKind::ProtocolError => (StatusCode::BAD_REQUEST, "UNSUPPORTED"),
            ErrorKind::AuthRequired
            | ErrorKind::UpstreamFailure
            | ErrorKind::PersistenceFailure => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
        };
        RegistryError::new(status, code, err.to_string())
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            errors: vec![ErrorDetail {
                code: self.code,
                message: self.message,
            }],
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Kind {
    Manifests,
    Blobs,
}

impl Kind {
    fn parse(s: &str) -> Option<Kind> {
        match s {
            "manifests" => Some(Kind::Manifests),
            "blobs" => Some(Kind::Blobs),
            _ => None,
        }
    }

    fn unknown_code(self) -> &'static str {
        match self {
            Kind::Manifests => "MANIFEST_UNKNOWN",
            Kind::Blobs => "BLOB_UNKNOWN",
        }
    }
}

fn not_found() -> Response {
    RegistryError::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "not found").into_response()
}

async fn handle(State(registry): State<Option<PullRegistry>>, method: Method, uri: Uri) -> Response {
    let path = uri.path();
    let registry = match registry {
        Some(registry) if path == "/v2" || path.starts_with("/v2/") => registry,
        _ => return not_found(),
    };
    if path == "/v2" || path == "/v2/" {
        return version_check();
    }
    if path == "/v2/_catalog" || path.starts_with("/v2/_catalog/") {
        return not_found();
    }

    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 5 {
        return RegistryError::new(
            StatusCode::BAD_REQUEST,
            "NAME_INVALID",
            format!("invalid path {:?}", path),
        )
        .into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return RegistryError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            format!("method {} is not supported", method),
        )
        .into_response();
    }
    let name = segments[2..segments.len() - 2].join("/");
    let reference = segments[segments.len() - 1];
    let kind = match Kind::parse(segments[segments.len() - 2]) {
        Some(kind) => kind,
        None => return not_found(),
    };
    log::info!("{} {:?} {} {}", method, kind, name, reference);

    let head = method == Method::HEAD;
    let result = match kind {
        Kind::Manifests => manifest(&registry, &name, reference, head).await,
        Kind::Blobs => blob(&registry, &name, reference, head).await,
    };
    match result {
        Ok(response) => response,
        Err(err) => {
            log::error!("{} {} {}, {}", method, name, reference, err);
            RegistryError::from_error(&err, kind).into_response()
        }
    }
}

fn version_check() -> Response {
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(
        DOCKER_DISTRIBUTION_API_VERSION,
        HeaderValue::from_static(API_VERSION),
    );
    response
}

fn content_response(digest: &str, content_type: &str, len: u64, body: Option<Bytes>) -> Result<Response, Error> {
    let body = match body {
        Some(data) => Body::from(data),
        None => Body::empty(),
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    let header = |value: &str| {
        HeaderValue::from_str(value).map_err(|_| Error::Protocol(format!("bad header value {:?}", value)))
    };
    headers.insert(DOCKER_CONTENT_DIGEST, header(digest)?);
    headers.insert(CONTENT_TYPE, header(content_type)?);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}

async fn manifest(registry: &PullRegistry, name: &str, reference: &str, head: bool) -> Result<Response, Error> {
    if head {
        // Digests answer from the cache; branches are only checked, not built
        registry.head_manifest(name, reference).await?;
        if reference.contains(':') {
            let manifest = registry.get_manifest(name, reference).await?;
            return content_response(
                manifest.digest.as_str(),
                manifest.media_type,
                manifest.data.len() as u64,
                None,
            );
        }
        return Ok(StatusCode::OK.into_response());
    }
    let manifest = registry.get_manifest(name, reference).await?;
    let len = manifest.data.len() as u64;
    content_response(manifest.digest.as_str(), manifest.media_type, len, Some(manifest.data))
}

async fn blob(registry: &PullRegistry, name: &str, digest: &str, head: bool) -> Result<Response, Error> {
    let blob = registry.get_blob(name, digest).await?;
    let len = blob.data.len() as u64;
    let body = if head { None } else { Some(blob.data) };
    content_response(blob.digest.as_str(), BLOB_CONTENT_TYPE, len, body)
}
