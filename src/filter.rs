//! Filters decorate an event source or sink with a transformation, without
//! either end knowing about it. Filters stack in order, by wrapping.
use crate::{
    error::XmlResult,
    event::{EventSource, XmlEvent, XmlSink},
    node::{CharacterContent, NamespaceDecl, QName},
};
use std::collections::HashSet;

/// A boxed source, as passed through a filter chain.
pub type BoxedSource<'a> = Box<dyn EventSource + 'a>;

/// A boxed sink, as passed through a filter chain.
pub type BoxedSink<'a> = Box<dyn XmlSink + 'a>;

/// Wraps a source with a transforming source.
pub trait SourceFilter {
    /// Returns a source that reads from `source` and transforms its events.
    fn wrap_source<'a>(&self, source: BoxedSource<'a>) -> BoxedSource<'a>;
}

/// Wraps a sink with a transforming sink.
pub trait SinkFilter {
    /// Returns a sink that transforms events before handing them to `sink`.
    fn wrap_sink<'a>(&self, sink: BoxedSink<'a>) -> BoxedSink<'a>;
}

/// An ordered stack of filters.
///
/// The first filter added sits closest to the raw endpoint: on the read side
/// it sees the parser's events first, on the write side it is the last to see
/// events before the writer.
#[derive(Default)]
pub struct FilterChain {
    source_filters: Vec<Box<dyn SourceFilter>>,
    sink_filters: Vec<Box<dyn SinkFilter>>,
}
impl FilterChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter to the read side.
    #[must_use]
    pub fn with_source_filter(mut self, filter: impl SourceFilter + 'static) -> Self {
        self.source_filters.push(Box::new(filter));
        self
    }

    /// Adds a filter to the write side.
    #[must_use]
    pub fn with_sink_filter(mut self, filter: impl SinkFilter + 'static) -> Self {
        self.sink_filters.push(Box::new(filter));
        self
    }

    /// Applies every read-side filter to a source.
    pub fn wrap_source<'a>(&self, source: impl EventSource + 'a) -> BoxedSource<'a> {
        let source: BoxedSource<'a> = Box::new(source);
        self.source_filters
            .iter()
            .fold(source, |source, filter| filter.wrap_source(source))
    }

    /// Applies every write-side filter to a sink.
    pub fn wrap_sink<'a>(&self, sink: impl XmlSink + 'a) -> BoxedSink<'a> {
        let sink: BoxedSink<'a> = Box::new(sink);
        self.sink_filters
            .iter()
            .fold(sink, |sink, filter| filter.wrap_sink(sink))
    }
}

/// Hides declarations of the given namespace URIs from the events that pass through.
///
/// Element and attribute names keep their resolved namespaces; only the
/// declarations themselves are masked. Useful when a fragment is lifted out of
/// an envelope whose declarations should not travel with it.
#[derive(Debug, Clone, Default)]
pub struct NamespaceMask {
    masked: HashSet<String>,
}
impl NamespaceMask {
    /// Creates a mask for the given namespace URIs.
    pub fn new<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            masked: uris.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if declarations of this URI are hidden.
    #[must_use]
    pub fn is_masked(&self, uri: &str) -> bool {
        self.masked.contains(uri)
    }
}
impl SourceFilter for NamespaceMask {
    fn wrap_source<'a>(&self, source: BoxedSource<'a>) -> BoxedSource<'a> {
        Box::new(MaskedSource {
            inner: source,
            mask: self.clone(),
        })
    }
}
impl SinkFilter for NamespaceMask {
    fn wrap_sink<'a>(&self, sink: BoxedSink<'a>) -> BoxedSink<'a> {
        Box::new(MaskedSink::new(sink, self.clone()))
    }
}

/// Read side of [`NamespaceMask`].
pub struct MaskedSource<S> {
    inner: S,
    mask: NamespaceMask,
}
impl<S: EventSource> MaskedSource<S> {
    /// Wraps a source.
    pub fn new(inner: S, mask: NamespaceMask) -> Self {
        Self { inner, mask }
    }
}
impl<S: EventSource> EventSource for MaskedSource<S> {
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
        let mut event = self.inner.next_event()?;
        if let Some(XmlEvent::StartElement { namespaces, .. }) = &mut event {
            namespaces.retain(|ns| {
                let keep = !self.mask.is_masked(&ns.uri);
                if !keep {
                    log::trace!("masking declaration of {}", ns.uri);
                }
                keep
            });
        }
        Ok(event)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Write side of [`NamespaceMask`].
///
/// A masked declaration is held back rather than dropped: if an element or
/// attribute name further in still uses it, it is declared again on that element.
pub struct MaskedSink<K> {
    inner: K,
    mask: NamespaceMask,
    scopes: Vec<Vec<(NamespaceDecl, bool)>>,
    start: Option<QName>,
}
impl<K: XmlSink> MaskedSink<K> {
    /// Wraps a sink.
    pub fn new(inner: K, mask: NamespaceMask) -> Self {
        Self {
            inner,
            mask,
            scopes: vec![],
            start: None,
        }
    }

    /// Unwraps the inner sink.
    pub fn into_inner(self) -> K {
        self.inner
    }

    /// Ends the open start tag, declaring the element's namespace again if it was held back.
    fn settle(&mut self) -> XmlResult<()> {
        match self.start.take() {
            Some(name) => self.restore(&name),
            None => Ok(()),
        }
    }

    /// Declares a held-back binding on the current element if `name` resolves through it.
    fn restore(&mut self, name: &QName) -> XmlResult<()> {
        let Some(namespace) = name.namespace.as_deref() else {
            return Ok(());
        };
        let prefix = name.prefix.as_deref();
        let held = self
            .scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(ns, _)| ns.prefix.as_deref() == prefix)
            .is_some_and(|(ns, visible)| !visible && ns.uri == namespace);
        if !held {
            return Ok(());
        }

        log::trace!("declaring {namespace} again where it is still used");
        self.inner.namespace_declaration(prefix, namespace)?;
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((NamespaceDecl::new(prefix, namespace), true));
        }
        Ok(())
    }
}
impl<K: XmlSink> XmlSink for MaskedSink<K> {
    fn start_document(&mut self) -> XmlResult<()> {
        self.inner.start_document()
    }

    fn end_document(&mut self) -> XmlResult<()> {
        self.settle()?;
        self.inner.end_document()
    }

    fn start_element(&mut self, name: &QName) -> XmlResult<()> {
        self.settle()?;
        self.scopes.push(vec![]);
        self.start = Some(name.clone());
        self.inner.start_element(name)
    }

    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()> {
        let visible = !self.mask.is_masked(uri);
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((NamespaceDecl::new(prefix, uri), visible));
        }
        if !visible {
            log::trace!("holding back declaration of {uri}");
            return Ok(());
        }
        self.inner.namespace_declaration(prefix, uri)
    }

    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()> {
        self.settle()?;
        // Unprefixed attributes are never in the default namespace
        if name.prefix.is_some() {
            self.restore(name)?;
        }
        self.inner.attribute(name, value)
    }

    fn end_element(&mut self) -> XmlResult<()> {
        self.settle()?;
        self.scopes.pop();
        self.inner.end_element()
    }

    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()> {
        self.settle()?;
        self.inner.characters(content)
    }

    fn comment(&mut self, text: &str) -> XmlResult<()> {
        self.settle()?;
        self.inner.comment(text)
    }

    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        self.settle()?;
        self.inner.processing_instruction(target, data)
    }

    fn doctype(&mut self, text: &str) -> XmlResult<()> {
        self.settle()?;
        self.inner.doctype(text)
    }
}
