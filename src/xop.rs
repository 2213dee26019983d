//! XOP: binary content carried out of band, referenced from the XML by an
//! `xop:Include` placeholder.
//!
//! [`XopDecoder`] replaces each placeholder in a source with binary character
//! content that is fetched from an [`AttachmentProvider`] on first access.
//! [`XopEncoder`] does the reverse on the write side, deciding per value
//! whether to move it into an attachment or leave it inline as base64.
use crate::{
    attachments::{AttachmentProvider, MemoryAttachments},
    blob::is_larger_than,
    error::{XmlErrorKind, XmlResult, bail},
    event::{EventSource, XmlEvent, XmlSink},
    filter::{BoxedSink, BoxedSource, SinkFilter, SourceFilter},
    node::{Attribute, BinaryContent, CharacterContent, QName},
};
use std::rc::Rc;

/// The XOP namespace.
pub const XOP_NAMESPACE: &str = "http://www.w3.org/2004/08/xop/include";

/// Local name of the placeholder element.
pub const XOP_INCLUDE: &str = "Include";

/// Prefix used for the placeholder element when encoding.
pub const XOP_PREFIX: &str = "xop";

/// Scheme of placeholder `href` values.
pub const CID_SCHEME: &str = "cid:";

/// Default size above which binary content is externalized.
pub const DEFAULT_THRESHOLD: u64 = 1024;

/// Turns a content-ID into a `cid:` URL, percent-encoding characters a URL cannot carry.
#[must_use]
pub fn content_id_to_href(content_id: &str) -> String {
    let mut href = String::with_capacity(CID_SCHEME.len() + content_id.len());
    href.push_str(CID_SCHEME);
    for byte in content_id.bytes() {
        let plain = byte.is_ascii_alphanumeric() || b"-._~@!$&'()*+,;=:".contains(&byte);
        if plain {
            href.push(char::from(byte));
        } else {
            href.push_str(&format!("%{byte:02X}"));
        }
    }
    href
}

/// Turns a `cid:` URL back into the content-ID it names.
///
/// # Errors
/// Fails if the URL does not use the `cid:` scheme, or its escapes are invalid.
pub fn href_to_content_id(href: &str) -> XmlResult<String> {
    let scheme = href.get(..CID_SCHEME.len());
    if !scheme.is_some_and(|s| s.eq_ignore_ascii_case(CID_SCHEME)) {
        bail!(XmlErrorKind::UnsupportedAttachment(format!(
            "reference {href:?} is not a cid: URL"
        )));
    }

    let encoded = href[CID_SCHEME.len()..].as_bytes();
    let mut decoded = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if encoded[i] == b'%' {
            let byte = encoded
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            let Some(byte) = byte else {
                bail!(XmlErrorKind::UnsupportedAttachment(format!(
                    "invalid escape in {href:?}"
                )));
            };
            decoded.push(byte);
            i += 3;
        } else {
            decoded.push(encoded[i]);
            i += 1;
        }
    }

    String::from_utf8(decoded).map_err(|_| {
        XmlErrorKind::UnsupportedAttachment(format!("{href:?} is not valid UTF-8")).into()
    })
}

/// When binary content is moved out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationPolicy {
    /// Every binary value that allows it.
    Always,

    /// Never; everything is written inline.
    Never,

    /// Values larger than this many bytes.
    Threshold(u64),
}
impl Default for OptimizationPolicy {
    fn default() -> Self {
        Self::Threshold(DEFAULT_THRESHOLD)
    }
}
impl OptimizationPolicy {
    /// Decides whether a value should become an attachment.
    ///
    /// Values whose optimize flag is off are always inlined.
    ///
    /// # Errors
    /// Fails if the size of the content has to be measured and reading it fails.
    pub fn should_externalize(&self, content: &BinaryContent) -> XmlResult<bool> {
        if !content.optimize() {
            return Ok(false);
        }

        match self {
            Self::Always => Ok(true),
            Self::Never => Ok(false),
            Self::Threshold(limit) => is_larger_than(content, *limit),
        }
    }
}

/// Mints content-IDs for new attachments.
pub trait ContentIdGenerator {
    /// Returns the content-ID for a value. `existing` is the ID the value
    /// already carries, if it was decoded from an attachment.
    fn generate(&self, existing: Option<&str>) -> String;
}

/// Random content-IDs of the form `<uuid>@<domain>`.
#[derive(Debug, Clone)]
pub struct UuidContentIds {
    domain: String,
}
impl UuidContentIds {
    /// Creates a generator using the given domain part.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}
impl Default for UuidContentIds {
    fn default() -> Self {
        Self::new("xmlom")
    }
}
impl ContentIdGenerator for UuidContentIds {
    fn generate(&self, _existing: Option<&str>) -> String {
        format!("{}@{}", uuid::Uuid::new_v4(), self.domain)
    }
}

/// Keeps the content-ID a value already has, and falls back to another generator otherwise.
#[derive(Debug, Clone, Default)]
pub struct ReuseContentIds<G> {
    fallback: G,
}
impl<G: ContentIdGenerator> ReuseContentIds<G> {
    /// Wraps a generator.
    pub fn new(fallback: G) -> Self {
        Self { fallback }
    }
}
impl<G: ContentIdGenerator> ContentIdGenerator for ReuseContentIds<G> {
    fn generate(&self, existing: Option<&str>) -> String {
        match existing {
            Some(content_id) => content_id.to_string(),
            None => self.fallback.generate(None),
        }
    }
}

/// Settings for the encoding side.
#[derive(Clone)]
pub struct XopConfig {
    /// Which values become attachments.
    pub policy: OptimizationPolicy,

    /// Where content-IDs come from.
    pub generator: Rc<dyn ContentIdGenerator>,
}
impl Default for XopConfig {
    fn default() -> Self {
        Self {
            policy: OptimizationPolicy::default(),
            generator: Rc::new(ReuseContentIds::new(UuidContentIds::default())),
        }
    }
}
impl XopConfig {
    /// Default settings with the given policy.
    #[must_use]
    pub fn with_policy(policy: OptimizationPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }
}
impl std::fmt::Debug for XopConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XopConfig")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

//
// Decoding

/// Where an open element is, with respect to a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AfterStartElement,
    ContentSeen,
    InXopInclude,
    AfterXopInclude,
}

/// Replaces `xop:Include` placeholders with binary content that resolves
/// through an attachment provider on first access.
///
/// A placeholder must be the only content of its parent element; comments and
/// processing instructions beside it are allowed, text and elements are not.
pub struct XopDecoder<S> {
    inner: S,
    provider: Rc<dyn AttachmentProvider>,
    states: Vec<DecodeState>,
}
impl<S: EventSource> XopDecoder<S> {
    /// Wraps a source.
    pub fn new(inner: S, provider: Rc<dyn AttachmentProvider>) -> Self {
        Self {
            inner,
            provider,
            states: vec![],
        }
    }

    /// Records that the current element has ordinary content.
    fn content_seen(&mut self, what: &str) -> XmlResult<()> {
        if let Some(state) = self.states.last_mut() {
            match state {
                DecodeState::AfterXopInclude => bail!(XmlErrorKind::MisplacedInclude(format!(
                    "{what} after an include in the same element"
                ))),
                DecodeState::AfterStartElement => *state = DecodeState::ContentSeen,
                DecodeState::ContentSeen | DecodeState::InXopInclude => {}
            }
        }
        Ok(())
    }

    fn include(&mut self, attributes: &[Attribute]) -> XmlResult<XmlEvent> {
        let Some(state) = self.states.last_mut() else {
            bail!(XmlErrorKind::MisplacedInclude(
                "an include cannot be the document element".into()
            ));
        };
        match state {
            DecodeState::AfterStartElement => *state = DecodeState::InXopInclude,
            DecodeState::ContentSeen => bail!(XmlErrorKind::MisplacedInclude(
                "an include after other content in the same element".into()
            )),
            DecodeState::AfterXopInclude => bail!(XmlErrorKind::MisplacedInclude(
                "more than one include in the same element".into()
            )),
            DecodeState::InXopInclude => bail!(XmlErrorKind::MisplacedInclude(
                "an include inside an include".into()
            )),
        }

        let Some(href) = attributes.iter().find(|a| a.name.matches(None, "href")) else {
            bail!(XmlErrorKind::MisplacedInclude(
                "an include without an href attribute".into()
            ));
        };
        let content_id = href_to_content_id(&href.value)?;

        // Skip the placeholder's own content; only extension elements may appear there
        let mut depth = 0usize;
        loop {
            match self.inner.next_event()? {
                Some(XmlEvent::StartElement { .. }) => depth += 1,
                Some(XmlEvent::EndElement) if depth == 0 => break,
                Some(XmlEvent::EndElement) => depth -= 1,
                Some(_) => {}
                None => bail!(XmlErrorKind::UnclosedTag(format!(
                    "{XOP_PREFIX}:{XOP_INCLUDE}"
                ))),
            }
        }

        if let Some(state) = self.states.last_mut() {
            *state = DecodeState::AfterXopInclude;
        }
        log::trace!("decoded include of <{content_id}>");
        let binary = BinaryContent::deferred(content_id, self.provider.clone());
        Ok(XmlEvent::Characters(CharacterContent::Binary(binary)))
    }
}
impl<S: EventSource> EventSource for XopDecoder<S> {
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
        let Some(event) = self.inner.next_event()? else {
            return Ok(None);
        };
        let event = match event {
            XmlEvent::StartElement {
                ref name,
                ref attributes,
                ..
            } if name.matches(Some(XOP_NAMESPACE), XOP_INCLUDE) => self.include(attributes)?,

            XmlEvent::StartElement { .. } => {
                self.content_seen("an element")?;
                self.states.push(DecodeState::AfterStartElement);
                event
            }

            XmlEvent::EndElement => {
                self.states.pop();
                event
            }

            XmlEvent::Characters(_) => {
                self.content_seen("text")?;
                event
            }

            _ => event,
        };
        Ok(Some(event))
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Source filter that decodes placeholders through a provider.
#[derive(Clone)]
pub struct XopDecoding {
    provider: Rc<dyn AttachmentProvider>,
}
impl XopDecoding {
    /// Creates the filter.
    pub fn new(provider: Rc<dyn AttachmentProvider>) -> Self {
        Self { provider }
    }
}
impl SourceFilter for XopDecoding {
    fn wrap_source<'a>(&self, source: BoxedSource<'a>) -> BoxedSource<'a> {
        Box::new(XopDecoder::new(source, self.provider.clone()))
    }
}

//
// Encoding

/// Moves binary content into attachments as it passes, leaving placeholders behind.
///
/// Collected attachments are available from [`XopEncoder::attachments`].
pub struct XopEncoder<K> {
    inner: K,
    config: XopConfig,
    attachments: Rc<MemoryAttachments>,
}
impl<K: XmlSink> XopEncoder<K> {
    /// Wraps a sink, collecting attachments into a new set.
    pub fn new(inner: K, config: XopConfig) -> Self {
        Self::with_attachments(inner, config, Rc::new(MemoryAttachments::new()))
    }

    /// Wraps a sink, collecting attachments into the given set.
    pub fn with_attachments(
        inner: K,
        config: XopConfig,
        attachments: Rc<MemoryAttachments>,
    ) -> Self {
        Self {
            inner,
            config,
            attachments,
        }
    }

    /// The attachments collected so far.
    #[must_use]
    pub fn attachments(&self) -> Rc<MemoryAttachments> {
        self.attachments.clone()
    }

    /// Unwraps the inner sink.
    pub fn into_inner(self) -> K {
        self.inner
    }

    fn externalize(&mut self, binary: &BinaryContent) -> XmlResult<()> {
        let content_id = self.config.generator.generate(binary.content_id());
        let payload = binary.payload()?;
        log::debug!(
            "moving {} bytes into attachment <{content_id}>",
            payload.size()
        );
        self.attachments.insert(content_id.clone(), payload);

        let name = QName::new(Some(XOP_NAMESPACE), Some(XOP_PREFIX), XOP_INCLUDE);
        self.inner.start_element(&name)?;
        self.inner
            .namespace_declaration(Some(XOP_PREFIX), XOP_NAMESPACE)?;
        self.inner
            .attribute(&QName::local("href"), &content_id_to_href(&content_id))?;
        self.inner.end_element()
    }
}
impl<K: XmlSink> XmlSink for XopEncoder<K> {
    fn start_document(&mut self) -> XmlResult<()> {
        self.inner.start_document()
    }

    fn end_document(&mut self) -> XmlResult<()> {
        self.inner.end_document()
    }

    fn start_element(&mut self, name: &QName) -> XmlResult<()> {
        self.inner.start_element(name)
    }

    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()> {
        self.inner.namespace_declaration(prefix, uri)
    }

    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()> {
        self.inner.attribute(name, value)
    }

    fn end_element(&mut self) -> XmlResult<()> {
        self.inner.end_element()
    }

    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()> {
        if let CharacterContent::Binary(binary) = content {
            if self.config.policy.should_externalize(binary)? {
                return self.externalize(binary);
            }
        }
        self.inner.characters(content)
    }

    fn comment(&mut self, text: &str) -> XmlResult<()> {
        self.inner.comment(text)
    }

    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        self.inner.processing_instruction(target, data)
    }

    fn doctype(&mut self, text: &str) -> XmlResult<()> {
        self.inner.doctype(text)
    }
}

/// Sink filter that encodes binary content into a shared attachment set.
#[derive(Debug, Clone, Default)]
pub struct XopEncoding {
    config: XopConfig,
    attachments: Rc<MemoryAttachments>,
}
impl XopEncoding {
    /// Creates the filter.
    #[must_use]
    pub fn new(config: XopConfig) -> Self {
        Self {
            config,
            attachments: Rc::new(MemoryAttachments::new()),
        }
    }

    /// The attachments collected by every sink this filter has wrapped.
    #[must_use]
    pub fn attachments(&self) -> Rc<MemoryAttachments> {
        self.attachments.clone()
    }
}
impl SinkFilter for XopEncoding {
    fn wrap_sink<'a>(&self, sink: BoxedSink<'a>) -> BoxedSink<'a> {
        Box::new(XopEncoder::with_attachments(
            sink,
            self.config.clone(),
            self.attachments.clone(),
        ))
    }
}
