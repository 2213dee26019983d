//! Error handling for tree building, serialization and attachment handling
use std::sync::Arc;

/// A result type for this crate, which can be either a successful value or an error.
pub type XmlResult<T> = std::result::Result<T, XmlError>;

/// Returns early with an error built from the given kind.
///
/// `bail!(kind)` or `bail!(kind, at = offset, src)` to attach a source position.
macro_rules! bail {
    ($kind:expr) => {
        return Err($crate::error::XmlError::from($kind))
    };

    ($kind:expr, at = $offset:expr, $src:expr) => {
        return Err($crate::error::XmlError::from($kind).at($src, $offset))
    };
}
pub(crate) use bail;

/// An error raised while building, navigating or writing a tree.
///
/// Errors are cheap to clone, so that a failed builder can hand the same cause
/// to every later caller.
#[derive(Debug, Clone)]
pub struct XmlError {
    /// The context of the error
    pub context: Box<ErrorContext>,

    /// The kind of error that occurred
    pub kind: XmlErrorKind,
}
impl XmlError {
    /// Creates a new `XmlError`
    #[must_use]
    pub fn new(kind: XmlErrorKind, context: ErrorContext) -> Self {
        Self {
            context: Box::new(context),
            kind,
        }
    }

    /// Adds a source position to the error context, from a byte offset into `src`.
    #[must_use]
    pub fn at(mut self, src: &str, offset: usize) -> Self {
        self.context.position = Some(position(src, offset));
        self
    }

    /// Records the element that was under construction when the error occurred.
    #[must_use]
    pub fn while_building(mut self, node: impl Into<String>) -> Self {
        if self.context.node.is_none() {
            self.context.node = Some(node.into());
        }
        self
    }

    /// Returns the broad category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}
impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.context)?;

        for line in self.kind.to_string().lines() {
            writeln!(f, "= {line}")?;
        }
        Ok(())
    }
}
impl std::error::Error for XmlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}
impl From<XmlErrorKind> for XmlError {
    fn from(kind: XmlErrorKind) -> Self {
        Self::new(kind, ErrorContext::default())
    }
}
impl From<xmlparser::Error> for XmlError {
    fn from(err: xmlparser::Error) -> Self {
        XmlErrorKind::Xml(err).into()
    }
}

/// Which side of a copy failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The source being read from
    Read,

    /// The destination being written to
    Write,
}
impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Broad classification of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed event sequence or misplaced include; fatal to the tree under construction
    Structural,

    /// Invalid surrogate sequencing or unmappable characters; fatal to the current write
    Encoding,

    /// I/O failure while streaming content
    Resource,

    /// Unknown content-ID or unsupported attachment
    Configuration,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, thiserror::Error)]
pub enum XmlErrorKind {
    /// A malformed event sequence
    #[error("Malformed event sequence: {0}")]
    Structural(String),

    /// An end tag did not match the open element
    #[error("Mismatched end tag: expected </{expected}>, found </{found}>")]
    MismatchedEndTag {
        /// The open element
        expected: String,

        /// The name found on the end tag
        found: String,
    },

    /// Input ended with open elements
    #[error("End of input reached with <{0}> still open")]
    UnclosedTag(String),

    /// An end event arrived with no element open
    #[error("End element without a matching start element")]
    UnbalancedEnd,

    /// A prefix was used without a declaration in scope
    #[error("Unbound namespace prefix: {0}")]
    UnboundPrefix(String),

    /// An `xop:Include` element was not the sole child of its parent
    #[error("Misplaced xop:Include: {0}")]
    MisplacedInclude(String),

    /// A structural mutation would make a node its own ancestor
    #[error("Inserting this node would create a cycle")]
    Cycle,

    /// Tokenizing failed
    #[error("XML parser error: {0}")]
    Xml(xmlparser::Error),

    /// A low surrogate arrived with no pending high surrogate
    #[error("Unpaired low surrogate U+{0:04X}")]
    UnpairedLowSurrogate(u16),

    /// A high surrogate was not followed by a low surrogate
    #[error("Unpaired high surrogate U+{0:04X}")]
    UnpairedHighSurrogate(u16),

    /// Text read back as binary was not valid base64
    #[error("Invalid base64 content: {0}")]
    InvalidBase64(base64::DecodeError),

    /// A code point cannot be represented in the output encoding
    #[error("U+{code_point:04X} cannot be represented in {encoding} here")]
    Unmappable {
        /// The offending code point
        code_point: u32,

        /// Name of the output encoding
        encoding: &'static str,
    },

    /// Copying bytes failed
    #[error("I/O error on the {endpoint} side: {source}")]
    Stream {
        /// The failing side of the copy
        endpoint: Endpoint,

        /// The original cause
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The attachment provider has no part for this content-ID
    #[error("Unknown content-ID: {0}")]
    UnknownContentId(String),

    /// An attachment could not be interpreted
    #[error("Unsupported attachment: {0}")]
    UnsupportedAttachment(String),

    /// A blob was used outside the states that allow the operation
    #[error("Blob is {state}; cannot {operation}")]
    BlobState {
        /// The current blob state
        state: &'static str,

        /// The rejected operation
        operation: &'static str,
    },
}
impl XmlErrorKind {
    /// Wraps an I/O error with the endpoint that raised it.
    #[must_use]
    pub fn stream(endpoint: Endpoint, source: std::io::Error) -> Self {
        Self::Stream {
            endpoint,
            source: Arc::new(source),
        }
    }

    /// Returns the broad category of this error kind.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Structural(_)
            | Self::MismatchedEndTag { .. }
            | Self::UnclosedTag(_)
            | Self::UnbalancedEnd
            | Self::UnboundPrefix(_)
            | Self::MisplacedInclude(_)
            | Self::Cycle
            | Self::Xml(_) => ErrorCategory::Structural,

            Self::UnpairedLowSurrogate(_)
            | Self::UnpairedHighSurrogate(_)
            | Self::Unmappable { .. }
            | Self::InvalidBase64(_) => ErrorCategory::Encoding,

            Self::Stream { .. } | Self::BlobState { .. } => ErrorCategory::Resource,

            Self::UnknownContentId(_) | Self::UnsupportedAttachment(_) => {
                ErrorCategory::Configuration
            }
        }
    }
}

/// Context describing where an error happened.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Row and column (1-based) in the parsed source, if known.
    pub position: Option<(usize, usize)>,

    /// The element that was under construction, if any.
    pub node: Option<String>,
}
impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(node) = &self.node {
            writeln!(f, "| while building <{node}>")?;
        }

        if let Some((row, col)) = self.position {
            writeln!(f, "= At {row}:{col}")?;
        }
        Ok(())
    }
}

/// Returns the 1-based row and column of a byte offset in `src`.
fn position(src: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(src.len());
    let before = &src.as_bytes()[..offset];

    let row = before.iter().filter(|b| **b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let col = String::from_utf8_lossy(&before[line_start..]).chars().count() + 1;
    (row, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_position() {
        assert_eq!(position("abc", 0), (1, 1));
        assert_eq!(position("ab\ncd", 4), (2, 2));
        assert_eq!(position("ab\n", 100), (2, 1));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            XmlError::from(XmlErrorKind::Cycle).category(),
            ErrorCategory::Structural
        );
        assert_eq!(
            XmlError::from(XmlErrorKind::UnknownContentId("a".into())).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            XmlError::from(XmlErrorKind::UnpairedLowSurrogate(0xDC00)).category(),
            ErrorCategory::Encoding
        );
    }

    #[test]
    fn test_stream_error_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = XmlError::from(XmlErrorKind::stream(Endpoint::Write, io));
        assert_eq!(err.category(), ErrorCategory::Resource);

        let source = err.source().expect("cause is preserved");
        assert!(source.to_string().contains("pipe closed"));
        assert!(err.to_string().contains("write side"));
    }

    #[test]
    fn test_display_with_context() {
        let err = XmlError::from(XmlErrorKind::Structural("boom".into()))
            .at("<a>\n<b>", 5)
            .while_building("b");
        let text = err.to_string();
        assert!(text.contains("while building <b>"));
        assert!(text.contains("At 2:2"));
        assert!(text.contains("= Malformed event sequence: boom"));
    }
}
