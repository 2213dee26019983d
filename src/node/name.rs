/// A qualified name, with an optional prefix and the namespace it resolves to:
/// `prefix:local`
///
/// Two names are the same if their namespace, local part and prefix all agree.
/// Use [`QName::matches`] to compare by namespace and local part only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QName {
    /// The prefix of the name.
    pub prefix: Option<String>,

    /// The local portion of the name.
    pub local: String,

    /// The namespace URI the name is bound to, if any.
    pub namespace: Option<String>,
}
impl QName {
    /// Create a name with no prefix and no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
            namespace: None,
        }
    }

    /// Create a name in a namespace.
    pub fn new<T: Into<String>>(namespace: Option<T>, prefix: Option<T>, local: T) -> Self {
        Self {
            prefix: prefix.map(Into::into),
            local: local.into(),
            namespace: namespace.map(Into::into),
        }
    }

    /// Compare the name with a namespace and local name, ignoring the prefix.
    #[must_use]
    pub fn matches(&self, namespace: Option<&str>, local: &str) -> bool {
        self.namespace.as_deref() == namespace && self.local == local
    }

    /// Compare the name with a prefix and local name.
    #[must_use]
    pub fn equals(&self, prefix: Option<&str>, local: &str) -> bool {
        self.prefix.as_deref() == prefix && self.local == local
    }
}
impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, "{prefix}:{local}", local = self.local)
        } else {
            write!(f, "{local}", local = self.local)
        }
    }
}
impl PartialEq<&str> for QName {
    fn eq(&self, other: &&str) -> bool {
        self.to_string().as_str() == *other
    }
}
impl PartialEq<str> for QName {
    fn eq(&self, other: &str) -> bool {
        self.to_string().as_str() == other
    }
}

/// Splits `prefix:local` into its parts. Names with no colon have no prefix.
impl From<&str> for QName {
    fn from(name: &str) -> Self {
        match name.split_once(':') {
            Some((prefix, local)) => QName::new(None, Some(prefix), local),
            None => QName::local(name),
        }
    }
}
impl From<String> for QName {
    fn from(name: String) -> Self {
        QName::from(name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let name = QName::from("soap:Envelope");
        assert_eq!(name.prefix.as_deref(), Some("soap"));
        assert_eq!(name.local, "Envelope");
        assert_eq!(name, "soap:Envelope");

        assert_eq!(QName::from("plain"), "plain");
    }

    #[test]
    fn test_matches_ignores_prefix() {
        let a = QName::new(Some("urn:x"), Some("a"), "item");
        let b = QName::new(Some("urn:x"), Some("b"), "item");
        assert!(a.matches(Some("urn:x"), "item"));
        assert!(b.matches(Some("urn:x"), "item"));
        assert_ne!(a, b);
    }
}
