use crate::{errors::Error, image::ResourceName};
use url::Url;

/// Maps registry names onto resource URLs
///
/// The registry knows nothing about what a name means. A resolver checks
/// that a name makes sense, picks the branch `latest` stands for, and turns
/// a name plus branch into a URL for the [OpenerRegistry](crate::opener::OpenerRegistry).
pub trait Resolver: Send + Sync {
    /// Reject names this resolver can never build
    fn validate(&self, name: &ResourceName) -> Result<(), Error>;

    /// Branch used when a client asks for `latest`
    fn default_branch(&self) -> &str;

    /// Resource URL for one branch of a name
    fn resource_url(&self, name: &ResourceName, branch: &str) -> Result<String, Error>;
}

/// Resolver for resources identified by positive integers
///
/// Names like `896660` become `{scheme}://896660?branch={branch}`.
#[derive(Clone, Debug)]
pub struct NumericResolver {
    scheme: String,
    default_branch: String,
}

impl NumericResolver {
    pub const DEFAULT_BRANCH: &'static str = "public";

    pub fn new(scheme: &str) -> Self {
        NumericResolver {
            scheme: scheme.to_ascii_lowercase(),
            default_branch: NumericResolver::DEFAULT_BRANCH.to_owned(),
        }
    }

    pub fn with_default_branch(mut self, branch: &str) -> Self {
        self.default_branch = branch.to_owned();
        self
    }

    fn id(&self, name: &ResourceName) -> Result<u64, Error> {
        match name.as_str().parse::<u64>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(Error::InvalidResourceId(name.to_string())),
        }
    }
}

impl Resolver for NumericResolver {
    fn validate(&self, name: &ResourceName) -> Result<(), Error> {
        self.id(name).map(|_| ())
    }

    fn default_branch(&self) -> &str {
        &self.default_branch
    }

    fn resource_url(&self, name: &ResourceName, branch: &str) -> Result<String, Error> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme, self.id(name)?))?;
        url.query_pairs_mut().append_pair("branch", branch);
        Ok(url.to_string())
    }
}

/// Resolver for `namespace/name` packages, where the branch is a version
///
/// The default branch `latest` asks for the newest version.
#[derive(Clone, Debug)]
pub struct ThunderstoreResolver {
    scheme: String,
}

impl ThunderstoreResolver {
    pub const DEFAULT_BRANCH: &'static str = "latest";

    pub fn new() -> Self {
        ThunderstoreResolver {
            scheme: crate::opener::ThunderstoreOpener::SCHEME.to_owned(),
        }
    }

    fn parts<'a>(&self, name: &'a ResourceName) -> Result<(&'a str, &'a str), Error> {
        let mut parts = name.iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(package), None) => Ok((namespace, package)),
            _ => Err(Error::InvalidResourceId(name.to_string())),
        }
    }
}

impl Default for ThunderstoreResolver {
    fn default() -> Self {
        ThunderstoreResolver::new()
    }
}

impl Resolver for ThunderstoreResolver {
    fn validate(&self, name: &ResourceName) -> Result<(), Error> {
        self.parts(name).map(|_| ())
    }

    fn default_branch(&self) -> &str {
        ThunderstoreResolver::DEFAULT_BRANCH
    }

    fn resource_url(&self, name: &ResourceName, branch: &str) -> Result<String, Error> {
        let (namespace, package) = self.parts(name)?;
        if branch == ThunderstoreResolver::DEFAULT_BRANCH {
            Ok(format!("{}://{}/{}", self.scheme, namespace, package))
        } else {
            Ok(format!("{}://{}/{}@{}", self.scheme, namespace, package, branch))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn name(s: &str) -> ResourceName {
        ResourceName::parse(s).unwrap()
    }

    #[test]
    fn numeric_names() {
        let resolver = NumericResolver::new("steamapp");
        assert!(resolver.validate(&name("896660")).is_ok());
        assert!(resolver.validate(&name("0")).is_err());
        assert!(resolver.validate(&name("abc")).is_err());
        assert!(resolver.validate(&name("1/2")).is_err());
        assert_eq!(resolver.default_branch(), "public");
        assert_eq!(
            resolver.resource_url(&name("896660"), "public").unwrap(),
            "steamapp://896660?branch=public"
        );
        assert_eq!(
            resolver
                .with_default_branch("stable")
                .default_branch(),
            "stable"
        );
    }

    #[test]
    fn thunderstore_names() {
        let resolver = ThunderstoreResolver::new();
        assert!(resolver.validate(&name("denikson/bepinexpack_valheim")).is_ok());
        assert!(resolver.validate(&name("denikson")).is_err());
        assert!(resolver.validate(&name("a/b/c")).is_err());
        assert_eq!(
            resolver
                .resource_url(&name("denikson/bepinexpack_valheim"), "latest")
                .unwrap(),
            "thunderstore://denikson/bepinexpack_valheim"
        );
        assert_eq!(
            resolver
                .resource_url(&name("denikson/bepinexpack_valheim"), "5.4.2100")
                .unwrap(),
            "thunderstore://denikson/bepinexpack_valheim@5.4.2100"
        );
    }
}
