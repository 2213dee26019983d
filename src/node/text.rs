use crate::{
    attachments::AttachmentProvider,
    blob::{Blob, BlobOptions, ByteSource},
    error::{XmlErrorKind, XmlResult},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use std::{borrow::Cow, cell::OnceCell, io::Read, rc::Rc};

/// The payload of a text node: either plain characters, or binary content
/// that is written as base64 unless an attachment codec moves it out of band.
#[derive(Debug, Clone)]
pub enum CharacterContent {
    /// Plain character data.
    Text(String),

    /// Binary content, possibly stored in an attachment.
    Binary(BinaryContent),
}
impl CharacterContent {
    /// Returns the content as text. Binary content is base64 encoded.
    ///
    /// # Errors
    /// Fails if binary content has to be resolved and resolution fails.
    pub fn text(&self) -> XmlResult<Cow<'_, str>> {
        match self {
            Self::Text(text) => Ok(Cow::Borrowed(text)),
            Self::Binary(binary) => Ok(Cow::Owned(binary.to_base64()?)),
        }
    }

    /// Returns the content as bytes. Text is read as base64, which is how inline
    /// binary content comes back after a round trip through XML text.
    ///
    /// # Errors
    /// Fails if text is not valid base64, or binary content cannot be resolved or read.
    pub fn to_bytes(&self) -> XmlResult<Vec<u8>> {
        match self {
            Self::Binary(binary) => binary.to_vec(),
            Self::Text(text) => {
                let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                BASE64_STANDARD
                    .decode(compact)
                    .map_err(|e| XmlErrorKind::InvalidBase64(e).into())
            }
        }
    }

    /// Returns the binary content, if this is binary.
    #[must_use]
    pub fn as_binary(&self) -> Option<&BinaryContent> {
        match self {
            Self::Binary(binary) => Some(binary),
            Self::Text(_) => None,
        }
    }

    /// Returns true for binary content.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}
impl From<&str> for CharacterContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}
impl From<String> for CharacterContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}
impl From<BinaryContent> for CharacterContent {
    fn from(binary: BinaryContent) -> Self {
        Self::Binary(binary)
    }
}

#[derive(Clone)]
enum Loader {
    Eager(Rc<Blob>),
    Deferred {
        provider: Rc<dyn AttachmentProvider>,
        resolved: Rc<OnceCell<Rc<Blob>>>,
    },
}

/// Binary content carried by a text node.
///
/// Deferred content is fetched from its attachment provider the first time it
/// is needed; clones share the resolved payload, so the provider sees one
/// request per content item no matter how often it is read.
#[derive(Clone)]
pub struct BinaryContent {
    content_id: Option<String>,
    optimize: bool,
    loader: Loader,
}
impl BinaryContent {
    /// Wraps a loaded blob.
    #[must_use]
    pub fn new(blob: Rc<Blob>) -> Self {
        Self {
            content_id: None,
            optimize: true,
            loader: Loader::Eager(blob),
        }
    }

    /// Copies bytes into a new blob.
    ///
    /// # Errors
    /// Fails if the bytes cannot be stored.
    pub fn from_bytes(bytes: &[u8]) -> XmlResult<Self> {
        let blob = Blob::from_bytes(BlobOptions::default(), bytes)?;
        Ok(Self::new(Rc::new(blob)))
    }

    /// Refers to an attachment that will be fetched from `provider` on first access.
    pub fn deferred(content_id: impl Into<String>, provider: Rc<dyn AttachmentProvider>) -> Self {
        Self {
            content_id: Some(content_id.into()),
            optimize: true,
            loader: Loader::Deferred {
                provider,
                resolved: Rc::new(OnceCell::new()),
            },
        }
    }

    /// Sets the content-ID this content is known by.
    #[must_use]
    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    /// Sets whether this content may be moved out of band when encoding.
    #[must_use]
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// The content-ID this content is known by, if any.
    #[must_use]
    pub fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    /// Whether this content may be moved out of band when encoding.
    #[must_use]
    pub fn optimize(&self) -> bool {
        self.optimize
    }

    /// Returns true if the bytes are available without asking the provider.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        match &self.loader {
            Loader::Eager(_) => true,
            Loader::Deferred { resolved, .. } => resolved.get().is_some(),
        }
    }

    fn resolve(&self) -> XmlResult<&Rc<Blob>> {
        match &self.loader {
            Loader::Eager(blob) => Ok(blob),
            Loader::Deferred { provider, resolved } => {
                if let Some(blob) = resolved.get() {
                    return Ok(blob);
                }

                let content_id = self.content_id.as_deref().unwrap_or_default();
                log::trace!("resolving attachment <{content_id}>");
                let blob = provider.payload(content_id)?;
                Ok(resolved.get_or_init(|| blob))
            }
        }
    }

    /// Returns the payload, resolving it through the provider on first access.
    ///
    /// # Errors
    /// Fails if the provider does not know the content-ID or cannot load it.
    pub fn blob(&self) -> XmlResult<&Blob> {
        self.resolve().map(AsRef::as_ref)
    }

    /// Returns a shared handle to the payload, resolving it on first access.
    ///
    /// # Errors
    /// Fails if the provider does not know the content-ID or cannot load it.
    pub fn payload(&self) -> XmlResult<Rc<Blob>> {
        self.resolve().cloned()
    }

    /// Reads the whole payload.
    ///
    /// # Errors
    /// Fails if the payload cannot be resolved or read.
    pub fn to_vec(&self) -> XmlResult<Vec<u8>> {
        self.blob()?.to_vec()
    }

    /// Returns the payload encoded as base64.
    ///
    /// # Errors
    /// Fails if the payload cannot be resolved or read.
    pub fn to_base64(&self) -> XmlResult<String> {
        Ok(BASE64_STANDARD.encode(self.to_vec()?))
    }

    /// Returns true if both values share the same underlying payload.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        match (&self.loader, &other.loader) {
            (Loader::Eager(a), Loader::Eager(b)) => Rc::ptr_eq(a, b),
            (Loader::Deferred { resolved: a, .. }, Loader::Deferred { resolved: b, .. }) => {
                Rc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}
impl ByteSource for BinaryContent {
    fn known_size(&self) -> Option<u64> {
        match &self.loader {
            Loader::Eager(blob) => Some(blob.size()),
            Loader::Deferred { .. } => self.resolve().ok().map(|blob| blob.size()),
        }
    }

    fn open_bytes(&self) -> XmlResult<Box<dyn Read + '_>> {
        self.blob()?.open()
    }
}
impl std::fmt::Debug for BinaryContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryContent")
            .field("content_id", &self.content_id)
            .field("optimize", &self.optimize)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attachments::MemoryAttachments,
        blob::{BlobState, is_larger_than},
        error::ErrorCategory,
    };
    use std::cell::Cell;

    struct CountingProvider {
        inner: MemoryAttachments,
        lookups: Cell<usize>,
    }
    impl AttachmentProvider for CountingProvider {
        fn is_loaded(&self, content_id: &str) -> bool {
            self.inner.is_loaded(content_id)
        }

        fn payload(&self, content_id: &str) -> XmlResult<Rc<Blob>> {
            self.lookups.set(self.lookups.get() + 1);
            self.inner.payload(content_id)
        }
    }

    #[test]
    fn test_text_content() {
        let content = CharacterContent::from("hello");
        assert_eq!(content.text().unwrap(), "hello");
        assert!(!content.is_binary());
    }

    #[test]
    fn test_binary_as_text_is_base64() {
        let content = CharacterContent::from(BinaryContent::from_bytes(b"hello").unwrap());
        assert_eq!(content.text().unwrap(), "aGVsbG8=");
    }

    #[test]
    fn test_deferred_resolves_once() {
        let provider = Rc::new(CountingProvider {
            inner: MemoryAttachments::new(),
            lookups: Cell::new(0),
        });
        provider.inner.insert_bytes("part1", b"payload").unwrap();

        let content = BinaryContent::deferred("part1", provider.clone());
        let copy = content.clone();
        assert!(!content.is_loaded());

        assert_eq!(content.to_vec().unwrap(), b"payload");
        assert_eq!(copy.to_vec().unwrap(), b"payload");
        assert!(copy.is_loaded());
        assert_eq!(copy.known_size(), Some(7));
        assert_eq!(provider.lookups.get(), 1);
        assert!(content.same_payload(&copy));
    }

    #[test]
    fn test_deferred_size_check_never_reads() {
        let provider = Rc::new(CountingProvider {
            inner: MemoryAttachments::new(),
            lookups: Cell::new(0),
        });
        provider.inner.insert_bytes("part1", b"payload").unwrap();

        let content = BinaryContent::deferred("part1", provider.clone());
        assert!(is_larger_than(&content, 3).unwrap());
        assert!(!is_larger_than(&content, 7).unwrap());
        assert_eq!(content.known_size(), Some(7));
        assert_eq!(provider.lookups.get(), 1);

        // The size came from the resolved blob, not from a reader
        assert_eq!(content.blob().unwrap().state(), BlobState::Loaded);
    }

    #[test]
    fn test_text_to_bytes() {
        let content = CharacterContent::from("aGVs\nbG8=");
        assert_eq!(content.to_bytes().unwrap(), b"hello");

        let binary = CharacterContent::from(BinaryContent::from_bytes(b"hello").unwrap());
        assert_eq!(binary.to_bytes().unwrap(), b"hello");

        let err = CharacterContent::from("not base64!").to_bytes().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Encoding);
    }

    #[test]
    fn test_deferred_unknown_id() {
        let provider = Rc::new(MemoryAttachments::new());
        let content = BinaryContent::deferred("nope", provider);
        let err = content.to_vec().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
