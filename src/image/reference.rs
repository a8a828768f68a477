use crate::{errors::Error, image::ContentDigest};
use regex::Regex;
use std::{fmt, str, str::FromStr};

static LATEST_STR: &str = "latest";

/// The `{reference}` part of a manifest request
///
/// Either the special name `latest`, a branch name, or a content digest.
/// Branches are up to 128 characters long, including alphanumeric characters
/// and underscores appearing anywhere in the string, and dots or dashes
/// appearing anywhere except the beginning. Anything containing a colon is
/// parsed as a digest.
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum Reference {
    Latest,
    Branch(String),
    ContentDigest(ContentDigest),
}

impl Reference {
    /// Returns a reference to the existing string representation of a
    /// [Reference]
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Latest => LATEST_STR,
            Reference::Branch(branch) => branch,
            Reference::ContentDigest(content_digest) => content_digest.as_str(),
        }
    }

    /// Parse a [prim@str] as a [Reference]
    pub fn parse(s: &str) -> Result<Self, Error> {
        lazy_static! {
            static ref RE: Regex = Regex::new(&format!("^{}$", Reference::branch_regex_str())).unwrap();
        }
        if s == LATEST_STR {
            Ok(Reference::Latest)
        } else if s.contains(':') {
            Ok(Reference::ContentDigest(ContentDigest::parse(s)?))
        } else if RE.is_match(s) {
            Ok(Reference::Branch(s.to_owned()))
        } else {
            Err(Error::InvalidResourceId(s.to_owned()))
        }
    }

    /// Parse a branch name, rejecting digests
    ///
    /// `latest` is allowed here and comes back as [Reference::Latest].
    pub fn branch(s: &str) -> Result<Self, Error> {
        match Reference::parse(s)? {
            Reference::ContentDigest(_) => Err(Error::InvalidResourceId(s.to_owned())),
            other => Ok(other),
        }
    }

    /// Is this reference a content digest?
    pub fn is_content_digest(&self) -> bool {
        matches!(self, Reference::ContentDigest(_))
    }

    /// Is this the special reference `latest`?
    pub fn is_latest(&self) -> bool {
        matches!(self, Reference::Latest)
    }

    pub(crate) fn branch_regex_str() -> &'static str {
        "(?P<branch>[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127})"
    }
}

impl FromStr for Reference {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
