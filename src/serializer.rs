//! XML formatting module
//!
//! Use [`Document::to_xml`] unless you need to write the XML to a file or other writer,
//! or to route the events through a filter chain.
use crate::{
    Document,
    error::{XmlErrorKind, XmlResult, bail},
    event::XmlSink,
    filter::FilterChain,
    node::{Attribute, CharacterContent, NamespaceDecl, NodeId, NodeKind, QName},
    writer::{Escape, PushWriter, WriterOptions},
};
use std::io::Write;

/// A sink that writes the events it receives as XML text.
///
/// Elements with no content are written as empty-element tags. Binary content
/// is written inline as base64; use an attachment encoder in front of the
/// writer to move it out of band instead.
///
/// The writer keeps track of the namespace bindings in scope, and adds the
/// declarations an element or attribute name needs when they are missing, so a
/// subtree written on its own, or moved away from its declarations, still
/// reads back with the same names.
pub struct XmlWriter<W: Write> {
    out: PushWriter<W>,
    options: WriterOptions,
    open: Vec<QName>,
    scopes: Vec<Vec<NamespaceDecl>>,
    start: Option<StartTag>,
}

/// A start tag whose declarations and attributes are still arriving.
struct StartTag {
    name: QName,
    namespaces: Vec<NamespaceDecl>,
    attributes: Vec<Attribute>,
}

impl<W: Write> XmlWriter<W> {
    /// Creates a writer with default options.
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, WriterOptions::default())
    }

    /// Creates a writer with the given options.
    pub fn with_options(inner: W, options: WriterOptions) -> Self {
        Self {
            out: PushWriter::new(inner, &options),
            options,
            open: vec![],
            scopes: vec![],
            start: None,
        }
    }

    /// Flushes and returns the underlying writer.
    ///
    /// # Errors
    /// Fails if elements are still open, or if the writer fails.
    pub fn finish(self) -> XmlResult<W> {
        if let Some(tag) = &self.start {
            bail!(XmlErrorKind::UnclosedTag(tag.name.to_string()));
        }
        if let Some(name) = self.open.last() {
            bail!(XmlErrorKind::UnclosedTag(name.to_string()));
        }
        self.out.finish()
    }

    /// Writes the pending start tag, if any, with the declarations its names need.
    fn close_start_tag(&mut self, empty: bool) -> XmlResult<()> {
        let Some(tag) = self.start.take() else {
            return Ok(());
        };

        let mut bindings = tag.namespaces;
        let name = bind_name(&self.scopes, &mut bindings, &tag.name, false);
        let attributes: Vec<Attribute> = tag
            .attributes
            .into_iter()
            .map(|attr| Attribute {
                name: bind_name(&self.scopes, &mut bindings, &attr.name, true),
                value: attr.value,
            })
            .collect();

        self.out.write_bytes(b"<")?;
        self.write_name(&name)?;
        for ns in &bindings {
            self.write_declaration(ns)?;
        }
        for attr in &attributes {
            self.out.write_bytes(b" ")?;
            self.write_name(&attr.name)?;
            self.out.write_bytes(b"=\"")?;
            self.out.write_str(&attr.value, Escape::Attribute)?;
            self.out.write_bytes(b"\"")?;
        }

        if empty {
            return self.out.write_bytes(b"/>");
        }
        self.out.write_bytes(b">")?;
        self.open.push(name);
        self.scopes.push(bindings);
        Ok(())
    }

    fn write_name(&mut self, name: &QName) -> XmlResult<()> {
        if let Some(prefix) = &name.prefix {
            self.out.write_str(prefix, Escape::None)?;
            self.out.write_bytes(b":")?;
        }
        self.out.write_str(&name.local, Escape::None)
    }

    fn write_declaration(&mut self, ns: &NamespaceDecl) -> XmlResult<()> {
        match &ns.prefix {
            Some(prefix) => {
                self.out.write_bytes(b" xmlns:")?;
                self.out.write_str(prefix, Escape::None)?;
            }
            None => self.out.write_bytes(b" xmlns")?,
        }
        self.out.write_bytes(b"=\"")?;
        self.out.write_str(&ns.uri, Escape::Attribute)?;
        self.out.write_bytes(b"\"")
    }

    fn start_tag(&mut self, what: &str) -> XmlResult<&mut StartTag> {
        match self.start.as_mut() {
            Some(tag) => Ok(tag),
            None => bail!(XmlErrorKind::Structural(format!(
                "{what} written outside of a start tag"
            ))),
        }
    }
}
impl<W: Write> XmlSink for XmlWriter<W> {
    fn start_document(&mut self) -> XmlResult<()> {
        if self.options.declaration {
            let encoding = self.options.encoding.name();
            self.out.write_bytes(
                format!(r#"<?xml version="1.0" encoding="{encoding}"?>"#).as_bytes(),
            )?;
        }
        Ok(())
    }

    fn end_document(&mut self) -> XmlResult<()> {
        self.close_start_tag(false)?;
        self.out.flush()
    }

    fn start_element(&mut self, name: &QName) -> XmlResult<()> {
        self.close_start_tag(false)?;
        self.start = Some(StartTag {
            name: name.clone(),
            namespaces: vec![],
            attributes: vec![],
        });
        Ok(())
    }

    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()> {
        let tag = self.start_tag("namespace declaration")?;
        tag.namespaces.push(NamespaceDecl::new(prefix, uri));
        Ok(())
    }

    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()> {
        let tag = self.start_tag("attribute")?;
        tag.attributes.push(Attribute::new(name.clone(), value));
        Ok(())
    }

    fn end_element(&mut self) -> XmlResult<()> {
        if self.start.is_some() {
            return self.close_start_tag(true);
        }

        let Some(name) = self.open.pop() else {
            bail!(XmlErrorKind::UnbalancedEnd);
        };
        self.scopes.pop();

        self.out.write_bytes(b"</")?;
        self.write_name(&name)?;
        self.out.write_bytes(b">")
    }

    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()> {
        self.close_start_tag(false)?;
        match content {
            CharacterContent::Text(text) => self.out.write_str(text, Escape::Text),
            CharacterContent::Binary(binary) => {
                let encoded = binary.to_base64()?;
                self.out.write_bytes(encoded.as_bytes())
            }
        }
    }

    fn comment(&mut self, text: &str) -> XmlResult<()> {
        self.close_start_tag(false)?;
        self.out.write_bytes(b"<!--")?;
        self.out.write_str(text, Escape::None)?;
        self.out.write_bytes(b"-->")
    }

    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        self.close_start_tag(false)?;
        self.out.write_bytes(b"<?")?;
        self.out.write_str(target, Escape::None)?;
        if let Some(data) = data {
            self.out.write_bytes(b" ")?;
            self.out.write_str(data, Escape::None)?;
        }
        self.out.write_bytes(b"?>")
    }

    fn doctype(&mut self, text: &str) -> XmlResult<()> {
        self.close_start_tag(false)?;
        self.out.write_str(text, Escape::None)
    }
}

/// The namespace `prefix` resolves to, looking at the tag being written first.
/// An empty default namespace resolves to `None`.
fn in_scope<'a>(
    scopes: &'a [Vec<NamespaceDecl>],
    tag: &'a [NamespaceDecl],
    prefix: Option<&str>,
) -> Option<&'a str> {
    tag.iter()
        .rev()
        .chain(scopes.iter().rev().flat_map(|scope| scope.iter().rev()))
        .find(|ns| ns.prefix.as_deref() == prefix)
        .map(|ns| ns.uri.as_str())
        .filter(|uri| !uri.is_empty())
}

/// Returns the name to write for `name`, adding to `tag` any declaration it needs.
///
/// A prefix already declared differently on the same tag is replaced by a fresh one.
fn bind_name(
    scopes: &[Vec<NamespaceDecl>],
    tag: &mut Vec<NamespaceDecl>,
    name: &QName,
    attribute: bool,
) -> QName {
    let prefix = name.prefix.as_deref();
    let Some(namespace) = name.namespace.as_deref() else {
        // Unprefixed attributes never take the default namespace
        let undeclare = !attribute && prefix.is_none() && in_scope(scopes, tag, None).is_some();
        if undeclare && !tag.iter().any(|ns| ns.prefix.is_none()) {
            tag.push(NamespaceDecl::new(None::<&str>, ""));
        }
        return name.clone();
    };

    if prefix == Some("xml") {
        return name.clone();
    }

    if attribute && prefix.is_none() {
        let declared: &[NamespaceDecl] = tag;
        let existing = declared
            .iter()
            .rev()
            .chain(scopes.iter().rev().flat_map(|scope| scope.iter().rev()))
            .filter(|ns| ns.uri == namespace)
            .filter_map(|ns| ns.prefix.as_deref())
            .find(|p| in_scope(scopes, declared, Some(*p)) == Some(namespace))
            .map(str::to_string);
        let prefix = match existing {
            Some(prefix) => prefix,
            None => declare_fresh(scopes, tag, namespace),
        };
        return QName::new(Some(namespace), Some(prefix.as_str()), name.local.as_str());
    }

    if in_scope(scopes, tag, prefix) == Some(namespace) {
        return name.clone();
    }
    if !tag.iter().any(|ns| ns.prefix.as_deref() == prefix) {
        tag.push(NamespaceDecl::new(prefix, namespace));
        return name.clone();
    }

    let prefix = declare_fresh(scopes, tag, namespace);
    QName::new(Some(namespace), Some(prefix.as_str()), name.local.as_str())
}

/// Declares `namespace` on `tag` under a prefix that is unbound so far.
fn declare_fresh(
    scopes: &[Vec<NamespaceDecl>],
    tag: &mut Vec<NamespaceDecl>,
    namespace: &str,
) -> String {
    let mut n = 0usize;
    loop {
        let prefix = format!("ns{n}");
        let bound = tag.iter().any(|ns| ns.prefix.as_deref() == Some(prefix.as_str()))
            || in_scope(scopes, tag, Some(prefix.as_str())).is_some();
        if !bound {
            tag.push(NamespaceDecl::new(Some(prefix.as_str()), namespace));
            return prefix;
        }
        n += 1;
    }
}

/// Flatten a document as XML using the given writer, building it completely.
///
/// # Errors
/// Returns an error if the document cannot be built, or if the writer fails.
pub fn write_xml(
    writer: &mut dyn Write,
    document: &mut Document<'_>,
    options: WriterOptions,
) -> XmlResult<()> {
    let mut sink = XmlWriter::with_options(writer, options);
    document.serialize(NodeId::DOCUMENT, &mut sink)?;
    sink.finish()?;
    Ok(())
}

impl Document<'_> {
    /// Flatten the document as an XML string, building it completely.
    ///
    /// # Errors
    /// Returns an error if the document cannot be built, or binary content cannot be read.
    pub fn to_xml(&mut self) -> XmlResult<String> {
        let mut buffer = Vec::new();
        write_xml(&mut buffer, self, WriterOptions::default())?;
        String::from_utf8(buffer)
            .map_err(|e| XmlErrorKind::Structural(e.to_string()).into())
    }

    /// Pushes a node and its subtree into a sink, building it as it goes.
    ///
    /// The document node is framed by `start_document` and `end_document`.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed, or errors from the sink unchanged.
    pub fn serialize(&mut self, root: NodeId, sink: &mut dyn XmlSink) -> XmlResult<()> {
        self.walk(root, sink, false)
    }

    /// Like [`Document::serialize`], but the unbuilt remainder of the subtree
    /// is streamed from the source straight into the sink, without building it.
    ///
    /// Nodes whose remainder was streamed are left [`crate::BuildState::Discarded`].
    ///
    /// # Errors
    /// Returns the build error if the source is malformed, or errors from the sink unchanged.
    pub fn serialize_and_consume(&mut self, root: NodeId, sink: &mut dyn XmlSink) -> XmlResult<()> {
        self.walk(root, sink, true)
    }

    /// Serializes through the write-side filters of a chain.
    ///
    /// # Errors
    /// See [`Document::serialize`].
    pub fn serialize_with(
        &mut self,
        root: NodeId,
        sink: &mut dyn XmlSink,
        filters: &FilterChain,
    ) -> XmlResult<()> {
        let mut sink = filters.wrap_sink(sink);
        self.serialize(root, &mut sink)
    }

    /// Depth-first walk from `root`, emitting start events on the way down and
    /// end events on the way up.
    fn walk(&mut self, root: NodeId, sink: &mut dyn XmlSink, consume: bool) -> XmlResult<()> {
        self.emit_start(root, sink)?;

        let mut current = root;
        let mut descend = true;
        loop {
            if descend {
                if let Some(child) = self.child_for_walk(current, consume)? {
                    self.emit_start(child, sink)?;
                    current = child;
                    continue;
                }
                if consume {
                    self.consume_rest(current, sink)?;
                }
                self.emit_end(current, sink)?;
            }

            if current == root {
                return Ok(());
            }

            if let Some(sibling) = self.sibling_for_walk(current, consume)? {
                self.emit_start(sibling, sink)?;
                current = sibling;
                descend = true;
                continue;
            }

            let Some(parent) = self.parent(current) else {
                bail!(XmlErrorKind::Structural(
                    "node was detached during serialization".into()
                ));
            };
            current = parent;
            if consume {
                self.consume_rest(current, sink)?;
            }
            self.emit_end(current, sink)?;
            descend = false;
        }
    }

    fn child_for_walk(&mut self, id: NodeId, consume: bool) -> XmlResult<Option<NodeId>> {
        if consume {
            Ok(self.node(id).first_child)
        } else {
            self.first_child(id)
        }
    }

    fn sibling_for_walk(&mut self, id: NodeId, consume: bool) -> XmlResult<Option<NodeId>> {
        if consume {
            Ok(self.node(id).next_sibling)
        } else {
            self.next_sibling(id)
        }
    }

    fn consume_rest(&mut self, id: NodeId, sink: &mut dyn XmlSink) -> XmlResult<()> {
        if self.is_complete(id) {
            return Ok(());
        }
        log::trace!(
            "streaming the rest of a {} from the source",
            self.kind(id).label()
        );
        self.pump_rest(id, sink)
    }

    fn emit_start(&self, id: NodeId, sink: &mut dyn XmlSink) -> XmlResult<()> {
        match self.kind(id) {
            NodeKind::Document => sink.start_document(),
            NodeKind::Element(element) => {
                sink.start_element(&element.name)?;
                for ns in &element.namespaces {
                    sink.namespace_declaration(ns.prefix.as_deref(), &ns.uri)?;
                }
                for attr in &element.attributes {
                    sink.attribute(&attr.name, &attr.value)?;
                }
                Ok(())
            }
            NodeKind::Text(content) => sink.characters(content),
            NodeKind::Comment(text) => sink.comment(text),
            NodeKind::ProcessingInstruction(pi) => {
                sink.processing_instruction(&pi.target, pi.data.as_deref())
            }
            NodeKind::DocType(text) => sink.doctype(text),
        }
    }

    fn emit_end(&self, id: NodeId, sink: &mut dyn XmlSink) -> XmlResult<()> {
        match self.kind(id) {
            NodeKind::Document => sink.end_document(),
            NodeKind::Element(_) => sink.end_element(),
            _ => Ok(()),
        }
    }
}
