//! The kinds of nodes, and the data they carry, that can appear in a tree.
mod name;
pub use name::*;

mod text;
pub use text::*;

mod element;
pub use element::*;

mod pi;
pub use pi::*;

/// A handle to a node in a [`crate::Document`].
///
/// Handles are only meaningful for the document that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);
impl NodeId {
    /// The document node of every tree.
    pub const DOCUMENT: NodeId = NodeId(0);

    /// Returns the arena index of this handle.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// The payload of a node. Can be any of:
/// - `Document` - the root of every tree
/// - `Element` - a named node with attributes and children
/// - `Text` - character or binary content
/// - `Comment` - a comment
/// - `ProcessingInstruction` - a processing instruction
/// - `DocType` - a document type declaration, kept verbatim
///
/// Only documents and elements have children.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// The document node.
    Document,

    /// An element node.
    Element(Element),

    /// A text node.
    Text(CharacterContent),

    /// A comment node.
    Comment(String),

    /// A processing instruction node.
    ProcessingInstruction(ProcessingInstruction),

    /// A document type declaration.
    DocType(String),
}
impl NodeKind {
    /// Returns true for kinds that can contain other nodes.
    #[must_use]
    pub fn can_have_children(&self) -> bool {
        matches!(self, Self::Document | Self::Element(_))
    }

    /// Returns the element data, for element nodes.
    #[must_use]
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Self::Element(element) => Some(element),
            _ => None,
        }
    }

    /// Returns the element data, for element nodes.
    #[must_use]
    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Self::Element(element) => Some(element),
            _ => None,
        }
    }

    /// Returns the character content, for text nodes.
    #[must_use]
    pub fn as_text(&self) -> Option<&CharacterContent> {
        match self {
            Self::Text(content) => Some(content),
            _ => None,
        }
    }

    /// A short label for the kind, used in messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Element(_) => "element",
            Self::Text(_) => "text",
            Self::Comment(_) => "comment",
            Self::ProcessingInstruction(_) => "processing instruction",
            Self::DocType(_) => "doctype",
        }
    }
}

/// How far a node has been built from its source.
///
/// Moves only forward: `Building` to `Complete` or `Discarded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Children are still being pulled from the source.
    Building,

    /// Every child has been built.
    Complete,

    /// The rest of the subtree was skipped in the source and will never be built.
    Discarded,
}
impl BuildState {
    /// True once no more children will be added by the builder.
    #[must_use]
    pub fn is_complete(self) -> bool {
        !matches!(self, Self::Building)
    }
}
