//! XMPP addresses (`local@domain/resource`).

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::JidError;

/// An immutable XMPP address.
///
/// Equality and hashing follow the full string form, which is also what the
/// IQ correlation table keys on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }
        if local.is_some_and(str::is_empty) {
            return Err(JidError::EmptyLocal);
        }
        if resource.is_some_and(str::is_empty) {
            return Err(JidError::EmptyResource);
        }
        Ok(Self {
            local: local.map(str::to_string),
            domain: domain.to_string(),
            resource: resource.map(str::to_string),
        })
    }

    /// A domain-only address, e.g. the server itself.
    pub fn from_domain(domain: &str) -> Result<Self, JidError> {
        Self::new(None, domain, None)
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// The server address this one belongs to.
    pub fn domain_jid(&self) -> Jid {
        Jid {
            local: None,
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        Jid::new(self.local(), self.domain(), Some(resource))
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The resource may itself contain '@' or '/', so split it off first.
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match rest.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, rest),
        };
        Jid::new(local, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "alice@example.com/phone".parse().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("phone"));
        assert_eq!(jid.to_string(), "alice@example.com/phone");
    }

    #[test]
    fn test_parse_domain_only() {
        let jid: Jid = "example.com".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.resource(), None);
        assert_eq!(jid, Jid::from_domain("example.com").unwrap());
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid: Jid = "room@muc.example.com/nick@home/desk".parse().unwrap();
        assert_eq!(jid.local(), Some("room"));
        assert_eq!(jid.domain(), "muc.example.com");
        assert_eq!(jid.resource(), Some("nick@home/desk"));
    }

    #[test]
    fn test_bare_and_with_resource() {
        let jid: Jid = "bob@x/work".parse().unwrap();
        assert_eq!(jid.to_bare().to_string(), "bob@x");
        assert_eq!(jid.to_bare().with_resource("home").unwrap().to_string(), "bob@x/home");
        assert_eq!(jid.domain_jid().to_string(), "x");
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert_eq!("".parse::<Jid>(), Err(JidError::EmptyDomain));
        assert_eq!("@example.com".parse::<Jid>(), Err(JidError::EmptyLocal));
        assert_eq!("alice@example.com/".parse::<Jid>(), Err(JidError::EmptyResource));
        assert_eq!("alice@".parse::<Jid>(), Err(JidError::EmptyDomain));
    }

    #[test]
    fn test_serializes_as_string() {
        let jid: Jid = "alice@example.com".parse().unwrap();
        assert_eq!(serde_json::to_string(&jid).unwrap(), "\"alice@example.com\"");
    }
}
