//! The arena that holds a document's nodes, and the navigation and editing
//! operations on it. Navigation builds the tree from its source on demand.
use crate::{
    builder::Builder,
    error::{XmlError, XmlErrorKind, XmlResult, bail},
    event::EventSource,
    filter::FilterChain,
    node::{
        BinaryContent, BuildState, CharacterContent, Element, NamespaceDecl, NodeId, NodeKind,
        ProcessingInstruction, QName,
    },
    source::ParserSource,
};

/// Storage for one node of the arena, with its structural links.
#[derive(Debug, Clone)]
pub(crate) struct NodeData {
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) last_child: Option<NodeId>,
    pub(crate) prev_sibling: Option<NodeId>,
    pub(crate) next_sibling: Option<NodeId>,
    pub(crate) state: BuildState,
}
impl NodeData {
    fn new(kind: NodeKind, state: BuildState) -> Self {
        Self {
            kind,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
            state,
        }
    }
}

/// An XML tree, built on demand from an event source.
///
/// Nodes live in an arena owned by the document and are addressed by [`NodeId`].
/// A document created from a source starts with only its document node; further
/// nodes are pulled from the source as navigation asks for them, so the cost of
/// building is proportional to what is visited.
///
/// Things to note:
/// - Navigation that may build (`first_child`, `next_sibling`, ...) takes `&mut self`
/// - Moving or detaching a node that is still being built completes it first
/// - [`Document::discard`] skips an unwanted subtree in the source without building it
/// - After a build error every building operation returns the same error
/// - Detached nodes stay in the arena until the document is dropped
///
/// # Example
/// ```rust
/// use xmlom::Document;
///
/// let mut doc = Document::parse_str("<a><b/><c>text</c></a>");
/// let root = doc.document_element().unwrap().unwrap();
/// let c = doc.nth_child(root, 1).unwrap().unwrap();
/// assert_eq!(doc.text(c).unwrap(), "text");
/// ```
pub struct Document<'src> {
    pub(crate) nodes: Vec<NodeData>,
    pub(crate) builder: Option<Builder<'src>>,
    pub(crate) poison: Option<XmlError>,
    pub(crate) advances: usize,
}
impl<'src> Document<'src> {
    /// Creates an empty, complete document.
    ///
    /// # Example
    /// ```rust
    /// use xmlom::{Document, NodeId};
    ///
    /// let mut doc = Document::new();
    /// let root = doc.create_element("root");
    /// doc.append_child(NodeId::DOCUMENT, root).unwrap();
    /// assert_eq!(doc.to_xml().unwrap(), "<root/>");
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData::new(NodeKind::Document, BuildState::Complete)],
            builder: None,
            poison: None,
            advances: 0,
        }
    }

    /// Creates a document that will be built from the given source as it is navigated.
    #[must_use]
    pub fn from_source(source: impl EventSource + 'src) -> Self {
        Self {
            nodes: vec![NodeData::new(NodeKind::Document, BuildState::Building)],
            builder: Some(Builder::new(Box::new(source))),
            poison: None,
            advances: 0,
        }
    }

    /// Creates a document that will be built from the given XML text as it is navigated.
    ///
    /// Nothing is parsed until the tree is first navigated, so malformed input
    /// is only reported once the builder reaches it.
    #[must_use]
    pub fn parse_str(src: &'src str) -> Self {
        Self::from_source(ParserSource::new(src))
    }

    /// Like [`Document::parse_str`], with the read-side filters of a chain applied.
    #[must_use]
    pub fn parse_str_with(src: &'src str, filters: &FilterChain) -> Self {
        Self::from_source(filters.wrap_source(ParserSource::new(src)))
    }

    //
    // Accessors; these never build

    pub(crate) fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0]
    }

    /// Returns the payload of a node.
    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    /// Returns the payload of a node for modification.
    #[must_use]
    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.node_mut(id).kind
    }

    /// Returns the element data of an element node.
    #[must_use]
    pub fn element(&self, id: NodeId) -> Option<&Element> {
        self.kind(id).as_element()
    }

    /// Returns the name of an element node.
    #[must_use]
    pub fn name(&self, id: NodeId) -> Option<&QName> {
        self.element(id).map(|e| &e.name)
    }

    /// Returns the value of an attribute of an element node.
    #[must_use]
    pub fn attribute(&self, id: NodeId, namespace: Option<&str>, local: &str) -> Option<&str> {
        self.element(id)?
            .get_attribute(namespace, local)
            .map(|a| a.value.as_str())
    }

    /// Returns the parent of a node; `None` for the document node and detached nodes.
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Returns the previous sibling of a node. Earlier siblings are always built.
    #[must_use]
    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).prev_sibling
    }

    /// Returns how far a node has been built.
    #[must_use]
    pub fn build_state(&self, id: NodeId) -> BuildState {
        self.node(id).state
    }

    /// Returns true once every child of the node has been built, or skipped.
    #[must_use]
    pub fn is_complete(&self, id: NodeId) -> bool {
        self.node(id).state.is_complete()
    }

    /// Returns the number of events pulled from the source so far.
    #[must_use]
    pub fn advances(&self) -> usize {
        self.advances
    }

    /// Returns the error that stopped the builder, if any.
    #[must_use]
    pub fn build_error(&self) -> Option<&XmlError> {
        self.poison.as_ref()
    }

    /// Returns true while the document still holds its source.
    #[must_use]
    pub fn is_building(&self) -> bool {
        self.builder.is_some()
    }

    /// Returns the number of nodes in the arena, including detached ones.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    //
    // Navigation; these build as far as needed

    /// Returns the first child of a node, building it if needed.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn first_child(&mut self, id: NodeId) -> XmlResult<Option<NodeId>> {
        self.check_poison()?;
        loop {
            let node = self.node(id);
            if node.first_child.is_some() || node.state.is_complete() {
                return Ok(node.first_child);
            }

            if !self.advance()? {
                return Ok(None);
            }
        }
    }

    /// Returns the last child of a node, building the node completely.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn last_child(&mut self, id: NodeId) -> XmlResult<Option<NodeId>> {
        self.build(id)?;
        Ok(self.node(id).last_child)
    }

    /// Returns the next sibling of a node, building it if needed.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn next_sibling(&mut self, id: NodeId) -> XmlResult<Option<NodeId>> {
        self.check_poison()?;
        loop {
            let node = self.node(id);
            if node.next_sibling.is_some() {
                return Ok(node.next_sibling);
            }

            let Some(parent) = node.parent else {
                return Ok(None);
            };
            if self.node(parent).state.is_complete() {
                return Ok(None);
            }

            if !self.advance()? {
                return Ok(None);
            }
        }
    }

    /// Returns the child at index `n`, building only as far as that child.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn nth_child(&mut self, id: NodeId, n: usize) -> XmlResult<Option<NodeId>> {
        let mut child = self.first_child(id)?;
        for _ in 0..n {
            let Some(current) = child else {
                return Ok(None);
            };
            child = self.next_sibling(current)?;
        }
        Ok(child)
    }

    /// Returns every child of a node, building the node's child list completely.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn children(&mut self, id: NodeId) -> XmlResult<Vec<NodeId>> {
        let mut children = vec![];
        let mut child = self.first_child(id)?;
        while let Some(current) = child {
            children.push(current);
            child = self.next_sibling(current)?;
        }
        Ok(children)
    }

    /// Returns the element children of a node with the given namespace and local name.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn children_named(
        &mut self,
        id: NodeId,
        namespace: Option<&str>,
        local: &str,
    ) -> XmlResult<Vec<NodeId>> {
        let children = self.children(id)?;
        Ok(children
            .into_iter()
            .filter(|c| self.name(*c).is_some_and(|n| n.matches(namespace, local)))
            .collect())
    }

    /// Returns the first element child of the document node.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn document_element(&mut self) -> XmlResult<Option<NodeId>> {
        let mut child = self.first_child(NodeId::DOCUMENT)?;
        while let Some(current) = child {
            if self.element(current).is_some() {
                return Ok(Some(current));
            }
            child = self.next_sibling(current)?;
        }
        Ok(None)
    }

    /// Returns the text of a node: its own content for a text node, or the
    /// concatenated text children of a document or element. Binary content is
    /// returned as base64.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed, or an error if
    /// binary content cannot be resolved.
    pub fn text(&mut self, id: NodeId) -> XmlResult<String> {
        match self.kind(id) {
            NodeKind::Text(content) => return Ok(content.text()?.into_owned()),
            NodeKind::Comment(text) | NodeKind::DocType(text) => return Ok(text.clone()),
            NodeKind::ProcessingInstruction(pi) => return Ok(pi.data.clone().unwrap_or_default()),
            NodeKind::Document | NodeKind::Element(_) => {}
        }

        let mut text = String::new();
        for child in self.children(id)? {
            if let NodeKind::Text(content) = self.kind(child) {
                text.push_str(&content.text()?);
            }
        }
        Ok(text)
    }

    /// Builds the subtree rooted at a node completely.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn build(&mut self, id: NodeId) -> XmlResult<()> {
        self.check_poison()?;
        while !self.is_complete(id) {
            if !self.advance()? {
                break;
            }
        }
        Ok(())
    }

    /// Builds the whole document and releases the source.
    ///
    /// # Errors
    /// Returns the build error if the source is malformed.
    pub fn build_all(&mut self) -> XmlResult<()> {
        self.build(NodeId::DOCUMENT)
    }

    //
    // Node creation; new nodes are complete and detached

    fn alloc(&mut self, kind: NodeKind, state: BuildState) -> NodeId {
        self.nodes.push(NodeData::new(kind, state));
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn alloc_building(&mut self, kind: NodeKind) -> NodeId {
        self.alloc(kind, BuildState::Building)
    }

    /// Creates a detached node with the given payload.
    ///
    /// # Errors
    /// Fails for document nodes; a tree has exactly one.
    pub fn create_node(&mut self, kind: NodeKind) -> XmlResult<NodeId> {
        if matches!(kind, NodeKind::Document) {
            bail!(XmlErrorKind::Structural(
                "a tree has exactly one document node".into()
            ));
        }
        Ok(self.alloc(kind, BuildState::Complete))
    }

    /// Creates a detached element.
    pub fn create_element(&mut self, name: impl Into<QName>) -> NodeId {
        self.alloc(NodeKind::Element(Element::new(name)), BuildState::Complete)
    }

    /// Creates a detached text node.
    pub fn create_text(&mut self, content: impl Into<CharacterContent>) -> NodeId {
        self.alloc(NodeKind::Text(content.into()), BuildState::Complete)
    }

    /// Creates a detached text node carrying binary content.
    pub fn create_binary(&mut self, content: BinaryContent) -> NodeId {
        self.create_text(content)
    }

    /// Creates a detached comment.
    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Comment(text.into()), BuildState::Complete)
    }

    /// Creates a detached processing instruction.
    pub fn create_processing_instruction(
        &mut self,
        target: impl Into<String>,
        data: Option<impl Into<String>>,
    ) -> NodeId {
        let pi = ProcessingInstruction::new(target, data);
        self.alloc(NodeKind::ProcessingInstruction(pi), BuildState::Complete)
    }

    /// Creates a detached document type declaration.
    pub fn create_doctype(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::DocType(text.into()), BuildState::Complete)
    }

    //
    // Mutation

    /// Sets an attribute on an element.
    ///
    /// # Errors
    /// Fails if the node is not an element.
    pub fn set_attribute(
        &mut self,
        id: NodeId,
        name: impl Into<QName>,
        value: impl Into<String>,
    ) -> XmlResult<()> {
        let Some(element) = self.kind_mut(id).as_element_mut() else {
            bail!(XmlErrorKind::Structural("only elements have attributes".into()));
        };
        element.set_attribute(name, value);
        Ok(())
    }

    /// Declares a namespace on an element.
    ///
    /// # Errors
    /// Fails if the node is not an element.
    pub fn declare_namespace(
        &mut self,
        id: NodeId,
        prefix: Option<&str>,
        uri: impl Into<String>,
    ) -> XmlResult<()> {
        let Some(element) = self.kind_mut(id).as_element_mut() else {
            bail!(XmlErrorKind::Structural(
                "only elements declare namespaces".into()
            ));
        };
        element.namespaces.push(NamespaceDecl::new(prefix, uri));
        Ok(())
    }

    /// Moves `child` to the end of `parent`'s children.
    ///
    /// An incomplete parent is built first, so the new child really is last.
    /// A child still being built is completed before it moves.
    ///
    /// # Errors
    /// Fails if `parent` cannot have children, if the move would create a
    /// cycle, or if building fails.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> XmlResult<()> {
        self.check_poison()?;
        self.check_insert(parent, child)?;

        self.build(parent)?;
        self.detach(child)?;
        self.link_last(parent, child);
        Ok(())
    }

    /// Moves `new` to just before `reference`.
    ///
    /// # Errors
    /// Fails if `reference` has no parent, if the move would create a cycle,
    /// or if building fails.
    pub fn insert_before(&mut self, reference: NodeId, new: NodeId) -> XmlResult<()> {
        self.check_poison()?;
        let Some(parent) = self.parent(reference) else {
            bail!(XmlErrorKind::Structural(
                "cannot insert a sibling of a node with no parent".into()
            ));
        };
        if reference == new {
            return Ok(());
        }
        self.check_insert(parent, new)?;
        self.detach(new)?;

        let prev = self.node(reference).prev_sibling;
        {
            let node = self.node_mut(new);
            node.parent = Some(parent);
            node.prev_sibling = prev;
            node.next_sibling = Some(reference);
        }
        self.node_mut(reference).prev_sibling = Some(new);
        match prev {
            Some(prev) => self.node_mut(prev).next_sibling = Some(new),
            None => self.node_mut(parent).first_child = Some(new),
        }
        Ok(())
    }

    /// Moves `new` to just after `reference`.
    ///
    /// # Errors
    /// Fails if `reference` has no parent, if the move would create a cycle,
    /// or if building fails.
    pub fn insert_after(&mut self, reference: NodeId, new: NodeId) -> XmlResult<()> {
        self.check_poison()?;
        let Some(parent) = self.parent(reference) else {
            bail!(XmlErrorKind::Structural(
                "cannot insert a sibling of a node with no parent".into()
            ));
        };
        if reference == new {
            return Ok(());
        }
        self.check_insert(parent, new)?;
        self.detach(new)?;

        let next = self.node(reference).next_sibling;
        {
            let node = self.node_mut(new);
            node.parent = Some(parent);
            node.prev_sibling = Some(reference);
            node.next_sibling = next;
        }
        self.node_mut(reference).next_sibling = Some(new);
        match next {
            Some(next) => self.node_mut(next).prev_sibling = Some(new),
            None => self.node_mut(parent).last_child = Some(new),
        }
        Ok(())
    }

    /// Removes a node from its parent. The node keeps its own subtree.
    ///
    /// A node still being built is completed first, so the source stays in step.
    ///
    /// # Errors
    /// Fails for the document node, or if building fails.
    pub fn detach(&mut self, id: NodeId) -> XmlResult<()> {
        if id == NodeId::DOCUMENT {
            bail!(XmlErrorKind::Structural(
                "the document node cannot be detached".into()
            ));
        }

        self.build(id)?;
        self.unlink(id);
        Ok(())
    }

    /// Detaches a node, giving up on any part of it that has not been built yet.
    ///
    /// If the node is complete this is the same as [`Document::detach`].
    /// Otherwise the source is fast-forwarded past the node's end without
    /// building anything, and the node and its unfinished descendants are
    /// marked [`BuildState::Discarded`].
    ///
    /// # Errors
    /// Fails for the document node, or if the source is malformed.
    pub fn discard(&mut self, id: NodeId) -> XmlResult<()> {
        if id == NodeId::DOCUMENT {
            bail!(XmlErrorKind::Structural(
                "the document node cannot be discarded".into()
            ));
        }

        self.check_poison()?;
        if !self.is_complete(id) {
            self.skip_subtree(id)?;
        }
        self.unlink(id);
        Ok(())
    }

    fn check_poison(&self) -> XmlResult<()> {
        match &self.poison {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Rejects insertions that would put a node inside itself.
    fn check_insert(&self, parent: NodeId, child: NodeId) -> XmlResult<()> {
        if !self.kind(parent).can_have_children() {
            bail!(XmlErrorKind::Structural(format!(
                "a {} cannot have children",
                self.kind(parent).label()
            )));
        }
        if child == NodeId::DOCUMENT {
            bail!(XmlErrorKind::Structural(
                "the document node cannot be a child".into()
            ));
        }

        let mut ancestor = Some(parent);
        while let Some(current) = ancestor {
            if current == child {
                bail!(XmlErrorKind::Cycle);
            }
            ancestor = self.parent(current);
        }
        Ok(())
    }

    pub(crate) fn link_last(&mut self, parent: NodeId, child: NodeId) {
        let last = self.node(parent).last_child;
        {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.prev_sibling = last;
            node.next_sibling = None;
        }
        match last {
            Some(last) => self.node_mut(last).next_sibling = Some(child),
            None => self.node_mut(parent).first_child = Some(child),
        }
        self.node_mut(parent).last_child = Some(child);
    }

    fn unlink(&mut self, id: NodeId) {
        let NodeData {
            parent,
            prev_sibling,
            next_sibling,
            ..
        } = *self.node(id);
        let Some(parent) = parent else {
            return;
        };

        match prev_sibling {
            Some(prev) => self.node_mut(prev).next_sibling = next_sibling,
            None => self.node_mut(parent).first_child = next_sibling,
        }
        match next_sibling {
            Some(next) => self.node_mut(next).prev_sibling = prev_sibling,
            None => self.node_mut(parent).last_child = prev_sibling,
        }

        let node = self.node_mut(id);
        node.parent = None;
        node.prev_sibling = None;
        node.next_sibling = None;
    }
}
impl Default for Document<'_> {
    fn default() -> Self {
        Self::new()
    }
}
impl std::fmt::Debug for Document<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.nodes.len())
            .field("building", &self.builder.is_some())
            .field("advances", &self.advances)
            .field("poison", &self.poison)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorCategory,
        event::{ReplaySource, XmlEvent, tests::Counting, tests::start},
    };
    use std::{cell::Cell, rc::Rc};

    fn names(doc: &Document, ids: &[NodeId]) -> Vec<String> {
        ids.iter()
            .map(|id| doc.name(*id).map(ToString::to_string).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_new_document() {
        let mut doc = Document::new();
        assert!(doc.is_complete(NodeId::DOCUMENT));
        assert_eq!(doc.first_child(NodeId::DOCUMENT).unwrap(), None);
        assert_eq!(doc.document_element().unwrap(), None);
    }

    #[test]
    fn test_lazy_navigation() {
        let mut doc = Document::parse_str("<a><b>1</b><c>2</c><d>3</d></a>");
        assert_eq!(doc.node_count(), 1);

        let a = doc.document_element().unwrap().unwrap();
        assert_eq!(doc.name(a).unwrap(), "a");
        assert!(!doc.is_complete(a));

        let b = doc.first_child(a).unwrap().unwrap();
        assert_eq!(doc.name(b).unwrap(), "b");
        // Nothing after <b> has been built yet
        assert_eq!(doc.node(a).last_child, Some(b));

        let children = doc.children(a).unwrap();
        assert_eq!(names(&doc, &children), vec!["b", "c", "d"]);
        assert!(doc.is_complete(a));
    }

    #[test]
    fn test_second_child_costs_three_advances() {
        let count = Rc::new(Cell::new(0));
        let source = Counting {
            inner: ReplaySource::new(vec![
                XmlEvent::StartDocument,
                start("a"),
                start("b"),
                XmlEvent::EndElement,
                start("c"),
                XmlEvent::EndElement,
                XmlEvent::EndElement,
                XmlEvent::EndDocument,
            ]),
            count: count.clone(),
        };

        let mut doc = Document::from_source(source);
        let a = doc.document_element().unwrap().unwrap();
        let before = count.get();
        assert_eq!(doc.advances(), before);

        let c = doc.nth_child(a, 1).unwrap().unwrap();
        assert_eq!(doc.name(c).unwrap(), "c");
        assert_eq!(count.get() - before, 3);
    }

    #[test]
    fn test_sibling_cost_is_independent_of_length() {
        let mut events = vec![XmlEvent::StartDocument, start("root")];
        for _ in 0..10_000 {
            events.push(start("item"));
            events.push(XmlEvent::EndElement);
        }
        events.push(XmlEvent::EndElement);
        events.push(XmlEvent::EndDocument);

        let mut doc = Document::from_source(ReplaySource::new(events));
        let root = doc.document_element().unwrap().unwrap();
        let before = doc.advances();
        doc.nth_child(root, 4).unwrap().unwrap();
        assert_eq!(doc.advances() - before, 9);
    }

    #[test]
    fn test_discard_in_progress_skips_subtree() {
        let mut doc = Document::parse_str("<a><b><x/><y/><z/></b><c/></a>");
        let a = doc.document_element().unwrap().unwrap();
        let b = doc.first_child(a).unwrap().unwrap();
        let x = doc.first_child(b).unwrap().unwrap();
        let built = doc.node_count();

        doc.discard(b).unwrap();
        assert_eq!(doc.build_state(b), BuildState::Discarded);
        assert_eq!(doc.build_state(x), BuildState::Discarded);
        assert_eq!(doc.parent(b), None);
        // y and z were never built
        assert_eq!(doc.node_count(), built);

        // The source resumes right after </b>
        let c = doc.first_child(a).unwrap().unwrap();
        assert_eq!(doc.name(c).unwrap(), "c");
        assert_eq!(doc.children(a).unwrap(), vec![c]);
    }

    #[test]
    fn test_discard_complete_is_detach() {
        let mut doc = Document::parse_str("<a><b/><c/></a>");
        let a = doc.document_element().unwrap().unwrap();
        let b = doc.first_child(a).unwrap().unwrap();
        let c = doc.next_sibling(b).unwrap().unwrap();
        assert!(doc.is_complete(b));

        doc.discard(b).unwrap();
        assert_eq!(doc.build_state(b), BuildState::Complete);
        assert_eq!(doc.children(a).unwrap(), vec![c]);
    }

    #[test]
    fn test_detach_incomplete_builds_it() {
        let mut doc = Document::parse_str("<a><b><x/><y/></b><c/></a>");
        let a = doc.document_element().unwrap().unwrap();
        let b = doc.first_child(a).unwrap().unwrap();

        doc.detach(b).unwrap();
        assert!(doc.is_complete(b));
        assert_eq!(doc.children(b).unwrap().len(), 2);

        let remaining = doc.children(a).unwrap();
        assert_eq!(names(&doc, &remaining), vec!["c"]);
    }

    #[test]
    fn test_build_error_poisons_tree() {
        let mut doc = Document::parse_str("<a><b></c></a>");
        let a = doc.document_element().unwrap().unwrap();

        let first = doc.children(a).unwrap_err();
        assert_eq!(first.category(), ErrorCategory::Structural);
        assert_eq!(first.context.node.as_deref(), Some("b"));

        let second = doc.first_child(a).unwrap_err();
        assert_eq!(second.to_string(), first.to_string());
        assert!(doc.build_error().is_some());
        assert!(doc.append_child(a, NodeId::DOCUMENT).is_err());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut doc = Document::parse_str("<a><b><c/></b></a>");
        let a = doc.document_element().unwrap().unwrap();
        let b = doc.first_child(a).unwrap().unwrap();
        let c = doc.first_child(b).unwrap().unwrap();

        let err = doc.append_child(c, a).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::Cycle));
        let err = doc.insert_after(c, b).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::Cycle));
        assert!(doc.append_child(b, b).is_err());

        // Tree is unchanged
        assert_eq!(doc.parent(b), Some(a));
        assert_eq!(doc.parent(c), Some(b));
    }

    #[test]
    fn test_reparent_is_atomic() {
        let mut doc = Document::parse_str("<a><b/><c/></a>");
        let a = doc.document_element().unwrap().unwrap();
        let b = doc.first_child(a).unwrap().unwrap();
        let c = doc.next_sibling(b).unwrap().unwrap();

        doc.append_child(c, b).unwrap();
        assert_eq!(doc.parent(b), Some(c));
        assert_eq!(doc.children(a).unwrap(), vec![c]);
        assert_eq!(doc.children(c).unwrap(), vec![b]);
        assert_eq!(doc.previous_sibling(b), None);
    }

    #[test]
    fn test_insert_before_and_after() {
        let mut doc = Document::parse_str("<a><m/></a>");
        let a = doc.document_element().unwrap().unwrap();
        let m = doc.first_child(a).unwrap().unwrap();

        let first = doc.create_element("first");
        let last = doc.create_element("last");
        doc.insert_before(m, first).unwrap();
        doc.insert_after(m, last).unwrap();

        let children = doc.children(a).unwrap();
        assert_eq!(names(&doc, &children), vec!["first", "m", "last"]);
        assert_eq!(doc.previous_sibling(last), Some(m));
    }

    #[test]
    fn test_append_to_incomplete_parent_goes_last() {
        let mut doc = Document::parse_str("<a><b/><c/></a>");
        let a = doc.document_element().unwrap().unwrap();
        let new = doc.create_element("new");

        doc.append_child(a, new).unwrap();
        let children = doc.children(a).unwrap();
        assert_eq!(names(&doc, &children), vec!["b", "c", "new"]);
    }

    #[test]
    fn test_text_and_attributes() {
        let mut doc = Document::parse_str(r#"<a id="7">x<b/>y</a>"#);
        let a = doc.document_element().unwrap().unwrap();
        assert_eq!(doc.attribute(a, None, "id"), Some("7"));
        assert_eq!(doc.text(a).unwrap(), "xy");

        doc.set_attribute(a, "id", "8").unwrap();
        assert_eq!(doc.attribute(a, None, "id"), Some("8"));

        let text = doc.first_child(a).unwrap().unwrap();
        assert!(doc.set_attribute(text, "id", "9").is_err());
    }

    #[test]
    fn test_build_all_releases_source() {
        let mut doc = Document::parse_str("<!--c--><a/><?pi?>");
        doc.build_all().unwrap();
        assert!(!doc.is_building());
        assert_eq!(doc.children(NodeId::DOCUMENT).unwrap().len(), 3);
    }

    #[test]
    fn test_unbalanced_source_fails() {
        let mut doc = Document::from_source(ReplaySource::new(vec![
            XmlEvent::StartDocument,
            start("a"),
            XmlEvent::EndElement,
            XmlEvent::EndElement,
        ]));
        let err = doc.build_all().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnbalancedEnd));

        let mut doc =
            Document::from_source(ReplaySource::new(vec![XmlEvent::StartDocument, start("a")]));
        let err = doc.build_all().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnclosedTag(_)));
    }
}
