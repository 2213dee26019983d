use super::QName;

/// The data carried by an element node: its name, the namespaces it declares, and its attributes.
/// `<prefix:name xmlns:prefix="uri" attr="value">`
///
/// Duplicate attributes are allowed (searches use the last attribute with the same name).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    /// The name of the element.
    pub name: QName,

    /// Namespace declarations made on this element.
    pub namespaces: Vec<NamespaceDecl>,

    /// The attributes of the element.
    pub attributes: Vec<Attribute>,
}
impl Element {
    /// Create an element with no attributes.
    #[must_use]
    pub fn new(name: impl Into<QName>) -> Self {
        Self {
            name: name.into(),
            namespaces: vec![],
            attributes: vec![],
        }
    }

    /// Get an attribute by namespace and local name.
    ///
    /// Searches the attributes in reverse order, so the last attribute with the same name is returned.
    #[must_use]
    pub fn get_attribute(&self, namespace: Option<&str>, local: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .rev()
            .find(|a| a.name.matches(namespace, local))
    }

    /// Get an attribute by namespace and local name.
    ///
    /// Searches the attributes in reverse order, so the last attribute with the same name is returned.
    #[must_use]
    pub fn get_attribute_mut(
        &mut self,
        namespace: Option<&str>,
        local: &str,
    ) -> Option<&mut Attribute> {
        self.attributes
            .iter_mut()
            .rev()
            .find(|a| a.name.matches(namespace, local))
    }

    /// Sets an attribute, replacing the value of an existing one with the same name.
    pub fn set_attribute(&mut self, name: impl Into<QName>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.get_attribute_mut(name.namespace.as_deref(), &name.local) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }

    /// Returns the namespace URI bound to a prefix by this element's own declarations.
    #[must_use]
    pub fn declared_namespace(&self, prefix: Option<&str>) -> Option<&str> {
        self.namespaces
            .iter()
            .rev()
            .find(|ns| ns.prefix.as_deref() == prefix)
            .map(|ns| ns.uri.as_str())
    }
}

/// An attribute set on an element, with a name and value:
/// `name="value"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// The name of the attribute.
    pub name: QName,

    /// The value of the attribute.
    pub value: String,
}
impl Attribute {
    /// Create a new attribute.
    pub fn new(name: impl Into<QName>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A namespace declaration: `xmlns:prefix="uri"`, or `xmlns="uri"` when there is no prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    /// The declared prefix; `None` for the default namespace.
    pub prefix: Option<String>,

    /// The namespace URI.
    pub uri: String,
}
impl NamespaceDecl {
    /// Create a new namespace declaration.
    pub fn new(prefix: Option<impl Into<String>>, uri: impl Into<String>) -> Self {
        Self {
            prefix: prefix.map(Into::into),
            uri: uri.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_attribute_wins() {
        let mut element = Element::new("item");
        element.attributes.push(Attribute::new("id", "1"));
        element.attributes.push(Attribute::new("id", "2"));
        assert_eq!(element.get_attribute(None, "id").unwrap().value, "2");
    }

    #[test]
    fn test_set_attribute_replaces() {
        let mut element = Element::new("item");
        element.set_attribute("id", "1");
        element.set_attribute("id", "2");
        assert_eq!(element.attributes.len(), 1);
        assert_eq!(element.attributes[0].value, "2");
    }

    #[test]
    fn test_declared_namespace() {
        let mut element = Element::new("item");
        element.namespaces.push(NamespaceDecl::new(Some("x"), "urn:x"));
        element.namespaces.push(NamespaceDecl::new(None::<String>, "urn:default"));
        assert_eq!(element.declared_namespace(Some("x")), Some("urn:x"));
        assert_eq!(element.declared_namespace(None), Some("urn:default"));
        assert_eq!(element.declared_namespace(Some("y")), None);
    }
}
