//! Fully-qualified function names: `namespace#name@version`.

use std::fmt;

/// Namespace assumed when a name carries none.
pub const NAMESPACE_DEFAULT: &str = "default";

/// A parsed function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fqfn {
    pub namespace: String,
    pub name: String,
    /// Empty when the name did not carry a version.
    pub version: String,
}

impl Fqfn {
    /// Parse `name`, `namespace#name`, `name@version` or
    /// `namespace#name@version`. A missing namespace is [`NAMESPACE_DEFAULT`].
    pub fn parse(text: &str) -> Self {
        let (namespace, rest) = match text.split_once('#') {
            Some((namespace, rest)) if !namespace.is_empty() => (namespace, rest),
            Some((_, rest)) => (NAMESPACE_DEFAULT, rest),
            None => (NAMESPACE_DEFAULT, text),
        };
        let (name, version) = rest.split_once('@').unwrap_or((rest, ""));

        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    pub fn from_parts(namespace: &str, name: &str, version: &str) -> String {
        format!("{namespace}#{name}@{version}")
    }

    pub fn is_default_namespace(&self) -> bool {
        self.namespace == NAMESPACE_DEFAULT
    }
}

impl fmt::Display for Fqfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.name)?;
        if !self.version.is_empty() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let fqfn = Fqfn::parse("hello");
        assert_eq!(fqfn.namespace, "default");
        assert_eq!(fqfn.name, "hello");
        assert!(fqfn.version.is_empty());
        assert!(fqfn.is_default_namespace());
    }

    #[test]
    fn test_parse_full() {
        let fqfn = Fqfn::parse("users#get-user@v1.2.0");
        assert_eq!(fqfn.namespace, "users");
        assert_eq!(fqfn.name, "get-user");
        assert_eq!(fqfn.version, "v1.2.0");
        assert_eq!(fqfn.to_string(), "users#get-user@v1.2.0");
    }

    #[test]
    fn test_parse_empty_namespace_defaults() {
        assert_eq!(Fqfn::parse("#echo").namespace, "default");
        assert_eq!(Fqfn::parse("echo@1.0.0").version, "1.0.0");
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(Fqfn::from_parts("default", "A", "1.0.0"), "default#A@1.0.0");
    }
}
