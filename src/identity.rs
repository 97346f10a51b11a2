//! Application identity used to tag every log event.
//!
//! The identity is a constant chosen by the entry point at build time
//! (`APP_NAMESPACE`), never derived at runtime.

use std::fmt;

/// Name reported as `ApplicationContext` on every log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplicationIdentity(&'static str);

impl ApplicationIdentity {
    /// Use `name` verbatim.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Derive the identity from a dotted namespace by keeping its last two
    /// segments, e.g. `Company.Services.Catalog.API` becomes `Catalog.API`.
    ///
    /// Namespaces with fewer than two separators are used as-is.
    pub fn from_namespace(namespace: &'static str) -> Self {
        let mut separators = namespace.rmatch_indices('.');
        let _last = separators.next();
        match separators.next() {
            Some((index, _)) => Self(&namespace[index + 1..]),
            None => Self(namespace),
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ApplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_two_segments() {
        let identity =
            ApplicationIdentity::from_namespace("Microsoft.eShopOnContainers.Services.Catalog.API");
        assert_eq!(identity.as_str(), "Catalog.API");
    }

    #[test]
    fn short_namespaces_are_kept_whole() {
        assert_eq!(ApplicationIdentity::from_namespace("Catalog.API").as_str(), "Catalog.API");
        assert_eq!(ApplicationIdentity::from_namespace("catalog").as_str(), "catalog");
    }
}
