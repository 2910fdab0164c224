//! Logical destination keys.

use std::fmt;

/// Logical backend target used to select a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKey {
    /// The single shared destination, or "any open connection" when resolving.
    Any,
    /// A specific destination, typically a document identifier.
    Doc(String),
}

impl DestinationKey {
    /// Destination for a document id.
    pub fn doc(id: impl Into<String>) -> Self {
        DestinationKey::Doc(id.into())
    }

    /// Build a key from an optional id (`None` means [`DestinationKey::Any`]).
    pub fn from_option(id: Option<impl Into<String>>) -> Self {
        match id {
            Some(id) => DestinationKey::Doc(id.into()),
            None => DestinationKey::Any,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, DestinationKey::Any)
    }

    /// Whether a request addressed to `self` belongs to a connection keyed `conn`.
    ///
    /// Keys match when equal or when either side is [`DestinationKey::Any`].
    pub fn matches(&self, conn: &DestinationKey) -> bool {
        self == conn || self.is_any() || conn.is_any()
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKey::Any => write!(f, "<any>"),
            DestinationKey::Doc(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for DestinationKey {
    fn from(id: &str) -> Self {
        DestinationKey::doc(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let doc1 = DestinationKey::doc("doc1");
        let doc2 = DestinationKey::doc("doc2");

        assert!(doc1.matches(&doc1));
        assert!(!doc1.matches(&doc2));
        assert!(doc1.matches(&DestinationKey::Any));
        assert!(DestinationKey::Any.matches(&doc2));
    }

    #[test]
    fn test_from_option() {
        assert_eq!(DestinationKey::from_option(None::<String>), DestinationKey::Any);
        assert_eq!(
            DestinationKey::from_option(Some("doc1")),
            DestinationKey::doc("doc1")
        );
    }
}
