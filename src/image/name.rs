use crate::errors::Error;
use regex::Regex;
use std::{
    cmp::{Ord, Ordering, PartialOrd},
    fmt,
    hash::{Hash, Hasher},
    str,
    str::FromStr,
};

/// Name of a resource served by the registry
///
/// This is the `{name}` part of `/v2/{name}/manifests/{reference}`. Names are
/// path-like groupings of lowercase alphanumeric segments separated by
/// slashes. Each grouping may also contain internal separator characters:
/// single periods, single underscores, double underscores, or any number of
/// dashes. No segment can be `.` or `..`, so a name is always safe to use as
/// a relative storage path.
#[derive(Clone)]
pub struct ResourceName {
    serialized: String,
}

impl ResourceName {
    /// Returns a reference to the existing string representation of a
    /// [ResourceName]
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a [prim@str] as a [ResourceName]
    ///
    /// ```
    /// # use hoard::image::ResourceName;
    /// let name = ResourceName::parse("denikson/bepinexpack_valheim").unwrap();
    /// let parts: Vec<&str> = name.iter().collect();
    /// assert_eq!(parts, vec!["denikson", "bepinexpack_valheim"])
    /// ```
    pub fn parse(s: &str) -> Result<Self, Error> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(&format!("^{}$", ResourceName::regex_str(),)).unwrap();
        }
        match RE.is_match(s) {
            false => Err(Error::InvalidResourceId(s.to_owned())),
            true => Ok(ResourceName {
                serialized: s.to_owned(),
            }),
        }
    }

    /// Iterate over the slash-separated parts of this name
    pub fn iter(&self) -> str::Split<'_, char> {
        self.serialized.split('/')
    }

    pub(crate) fn regex_str() -> &'static str {
        concat!(
            "(?P<name>", // Resource name match group
            /*  */ "(?:", // Main name component
            /* -- */ "[a-z0-9]+",
            /* -- */ "(?:",
            /* -- -- */ "(?:[._]|__|[-]*)", // allowed separators
            /* -- -- */ "[a-z0-9]+",
            /* -- */ ")*", // multiple separator groups
            /*  */ ")", // end first name component
            /*  */ "(?:", // Optional additional name components
            /* -- */ "/",
            /* -- */ "[a-z0-9]+",
            /* -- */ "(?:",
            /* -- -- */ "(?:[._]|__|[-]*)", // allowed separators
            /* -- -- */ "[a-z0-9]+",
            /* -- */ ")*", // multiple separator groups
            /*  */ ")*", // multiple additional name components
            ")"
        )
    }
}

impl Eq for ResourceName {}

impl PartialEq for ResourceName {
    fn eq(&self, other: &Self) -> bool {
        self.serialized.eq(&other.serialized)
    }
}

impl FromStr for ResourceName {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceName::parse(s)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Hash for ResourceName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl Ord for ResourceName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialized.cmp(&other.serialized)
    }
}

impl PartialOrd for ResourceName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
