use crate::errors::Error;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{
    cmp::{Ord, Ordering, PartialOrd},
    fmt,
    hash::{Hash, Hasher},
    ops::Range,
    str,
    str::FromStr,
};

/// A digest securely identifies the specific contents of a binary object
///
/// Layers, configs, and manifests are all addressed by digest. Digests we
/// create are always `sha256`, but any well-formed `algorithm:hex` digest is
/// accepted when parsing a client's request.
#[derive(Clone)]
pub struct ContentDigest {
    serialized: String,
    format_pos: Range<usize>,
    hex_pos: Range<usize>,
}

impl Eq for ContentDigest {}

impl PartialEq for ContentDigest {
    fn eq(&self, other: &Self) -> bool {
        self.serialized.eq(&other.serialized)
    }
}

impl FromStr for ContentDigest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentDigest::parse(s)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Hash for ContentDigest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl Ord for ContentDigest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialized.cmp(&other.serialized)
    }
}

impl PartialOrd for ContentDigest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentDigest::parse(&s).map_err(de::Error::custom)
    }
}

impl ContentDigest {
    /// Returns a reference to the existing string representation of a
    /// [ContentDigest]
    ///
    /// This string always has a single colon. After the colon is 32 or more
    /// lowercase hexadecimal digits.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Create a new ContentDigest from parts
    pub fn from_parts<T: fmt::LowerHex>(format_part: &str, hex_part: &T) -> Result<Self, Error> {
        ContentDigest::parse(&format!("{}:{:x}", format_part, hex_part))
    }

    /// Finish a running `sha256` hash
    pub fn from_hasher(hasher: Sha256) -> Self {
        let hex = format!("{:x}", hasher.finalize());
        let serialized = format!("sha256:{}", hex);
        ContentDigest {
            format_pos: 0..6,
            hex_pos: 7..serialized.len(),
            serialized,
        }
    }

    /// Create a new ContentDigest from content data
    ///
    /// ```
    /// # use hoard::image::ContentDigest;
    /// let digest = ContentDigest::from_content(b"cat");
    /// assert_eq!(digest.as_str(), "sha256:77af778b51abd4a3c51c5ddd97204a9c3ae614ebccb75a606c3b6865aed6744e");
    /// ```
    pub fn from_content(content_bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content_bytes);
        ContentDigest::from_hasher(hasher)
    }

    /// Rebuild a `sha256` digest from just its hex part
    ///
    /// Installation labels only carry the hex, this puts the algorithm back.
    pub fn from_sha256_hex(hex: &str) -> Result<Self, Error> {
        ContentDigest::parse(&format!("sha256:{}", hex))
    }

    /// Parse a [prim@str] as a [ContentDigest]
    ///
    /// ```
    /// # use hoard::image::ContentDigest;
    /// let digest = ContentDigest::parse("format:00112233445566778899aabbccddeeff").unwrap();
    /// assert_eq!(digest.format_str(), "format");
    /// assert_eq!(digest.hex_str(), "00112233445566778899aabbccddeeff")
    /// ```
    pub fn parse(s: &str) -> Result<Self, Error> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(&format!("^{}$", ContentDigest::regex_str(),)).unwrap();
        }
        match RE.captures(s) {
            None => Err(Error::InvalidResourceId(s.to_owned())),
            Some(captures) => match (captures.name("dig_f"), captures.name("dig_h")) {
                (Some(format), Some(hex)) => Ok(ContentDigest {
                    serialized: s.to_owned(),
                    format_pos: format.range(),
                    hex_pos: hex.range(),
                }),
                _ => Err(Error::InvalidResourceId(s.to_owned())),
            },
        }
    }

    /// Return a reference to the format string portion of this digest.
    pub fn format_str(&self) -> &str {
        &self.serialized[self.format_pos.clone()]
    }

    /// Return a reference to the hexadecimal string portion of this digest.
    ///
    /// This is guaranteed to be a string of at least 32 hex digits.
    pub fn hex_str(&self) -> &str {
        &self.serialized[self.hex_pos.clone()]
    }

    /// Does this digest describe `data`?
    ///
    /// Only `sha256` can be checked; other algorithms never match.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.format_str() == "sha256" && &ContentDigest::from_content(data) == self
    }

    pub(crate) fn regex_str() -> &'static str {
        concat!(
            "(?P<dig>", // digest group
            /*  */ "(?P<dig_f>", // digest format group
            /* -- */ "(?:", // first format component
            /* -- -- */ "[a-zA-Z]",
            /* -- -- */ "[a-zA-Z0-9]*",
            /* -- */ ")",
            /* -- */ "(?:", // Additional format component
            /* -- -- */ "[-_+.]", // separators allowed in the digest format
            /* -- -- */ "[a-zA-Z]",
            /* -- -- */ "[a-zA-Z0-9]*",
            /* -- */ ")*",
            /*  */ ")", // end digest format group
            /*  */ "[:]", // Main separator
            /*  */ "(?P<dig_h>", // digest hex group
            /* -- */ "[a-f0-9]{32,}",
            /*  */ ")",
            ")",
        )
    }
}
