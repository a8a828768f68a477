//! Error types you might see while installing or serving resources

use std::path::PathBuf;
use thiserror::Error;

/// Errors from opening, building, installing, and serving resources
#[derive(Error, Debug)]
pub enum Error {
    /// no opener is registered for this URL scheme
    #[error("no opener registered for scheme {0:?}")]
    UnsupportedScheme(String),

    /// malformed resource name, URL, digest, or branch
    #[error("invalid resource identifier: {0:?}")]
    InvalidResourceId(String),

    /// upstream resource needs credentials that were not supplied
    #[error("upstream resource requires authentication: {0}")]
    AuthRequired(String),

    /// unknown digest, branch, or reference
    #[error("not found: {0}")]
    NotFound(String),

    /// network request error
    #[error("network request error: {0}")]
    Network(#[from] reqwest::Error),

    /// upstream server answered with an unexpected status
    #[error("upstream server returned {status} for {url}")]
    UpstreamStatus { url: String, status: u16 },

    /// zip archive from upstream could not be read
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// writing or renaming the database file failed
    #[error("failed to persist {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        source: std::io::Error,
    },

    /// no database path was configured, and none of `$HOARD_DB`,
    /// `$XDG_DATA_HOME`, or `$HOME` are set
    #[error("can't determine a default installation database path")]
    NoDefaultDatabasePath,

    /// malformed request path or method
    #[error("protocol error: {0}")]
    Protocol(String),

    /// archive or image contents are not in the expected format
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// layer destination directory is not a relative path
    #[error("layer destination must be a relative path, found {0:?}")]
    InvalidDestination(String),

    /// another installation already owns the label this one needs
    #[error("{url} would share its layer and cache key with {existing}, which is already installed")]
    InstallationConflict { url: String, existing: String },

    /// extraction needs at least one non-empty scheme
    #[error("no non-empty schemes provided")]
    NoSchemes,

    /// calculated digest of stored content is not what we expected
    #[error("calculated digest of stored content is not what we expected, expected {expected}, found {found}")]
    ContentDigestMismatch {
        expected: crate::image::ContentDigest,
        found: crate::image::ContentDigest,
    },

    /// url parse error
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// asynchronous task failed
    #[error("asynchronous task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Coarse classification of an [Error]
///
/// Every error collapses onto one of these, which is what callers (and the
/// HTTP layer) decide on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    UnsupportedScheme,
    InvalidResourceId,
    AuthRequired,
    NotFound,
    UpstreamFailure,
    PersistenceFailure,
    ProtocolError,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedScheme(_) => ErrorKind::UnsupportedScheme,
            Error::InvalidResourceId(_) | Error::Url(_) => ErrorKind::InvalidResourceId,
            Error::InvalidDestination(_) | Error::NoSchemes | Error::InstallationConflict { .. } => {
                ErrorKind::InvalidResourceId
            }
            Error::AuthRequired(_) => ErrorKind::AuthRequired,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Persistence { .. } | Error::NoDefaultDatabasePath => {
                ErrorKind::PersistenceFailure
            }
            Error::Protocol(_) => ErrorKind::ProtocolError,
            Error::Network(_)
            | Error::UpstreamStatus { .. }
            | Error::Zip(_)
            | Error::InvalidArchive(_)
            | Error::ContentDigestMismatch { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::TaskJoin(_) => ErrorKind::UpstreamFailure,
        }
    }

    pub(crate) fn persistence(path: &std::path::Path, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Map an upstream HTTP status onto the error taxonomy
    pub(crate) fn from_status(url: &str, status: u16) -> Self {
        match status {
            401 | 403 => Error::AuthRequired(url.to_owned()),
            404 => Error::NotFound(url.to_owned()),
            _ => Error::UpstreamStatus {
                url: url.to_owned(),
                status,
            },
        }
    }
}
