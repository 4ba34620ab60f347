//! Registry keys.

use std::fmt;

/// Identifies a registry entry by connector and connection name.
///
/// Displays as `connector:name`. The two parts are compared separately, so
/// `("a:b", "c")` and `("a", "b:c")` are different keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    connector: String,
    name: String,
}

impl ConnectionKey {
    pub fn new(connector: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            name: name.into(),
        }
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connector, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn display_joins_with_colon() {
        let key = ConnectionKey::new("db", "orders");
        assert_eq!(key.to_string(), "db:orders");
        assert_eq!(key.connector(), "db");
        assert_eq!(key.name(), "orders");
    }

    #[test]
    fn colon_in_parts_does_not_collide() {
        let a = ConnectionKey::new("a:b", "c");
        let b = ConnectionKey::new("a", "b:c");
        assert_eq!(a.to_string(), b.to_string());
        assert_ne!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn keys_are_case_sensitive() {
        assert_ne!(ConnectionKey::new("DB", "x"), ConnectionKey::new("db", "x"));
    }
}
