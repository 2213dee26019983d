//! An event source over XML text, built on the `xmlparser` tokenizer.
use crate::{
    error::{XmlError, XmlErrorKind, XmlResult},
    event::{EventSource, XmlEvent},
    node::{Attribute, CharacterContent, NamespaceDecl, QName},
};
use htmlentity::entity::Entity;
use std::collections::VecDeque;
use xmlparser::{ElementEnd, Token};

/// The namespace bound to the `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Pulls events from an XML string.
///
/// - Namespace prefixes are resolved against the declarations in scope
/// - Entity and character references in text and attribute values are decoded
/// - CDATA sections are reported as characters
/// - The XML declaration is consumed and not reported
///
/// The parser will not attempt to recover from invalid closing tags, or unclosed tags.
pub struct ParserSource<'src> {
    src: &'src str,
    tokenizer: xmlparser::Tokenizer<'src>,
    state: ParserState,
    pending: VecDeque<XmlEvent>,

    /// Names of the open elements, as written in the source
    open: Vec<(Option<&'src str>, &'src str)>,

    /// Declarations made by each open element
    scopes: Vec<Vec<NamespaceDecl>>,

    start: Option<PendingStart<'src>>,
    dtd_start: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    NotStarted,
    Running,
    Finished,
}

/// A start tag whose attributes are still arriving.
struct PendingStart<'src> {
    offset: usize,
    prefix: Option<&'src str>,
    local: &'src str,
    namespaces: Vec<NamespaceDecl>,
    attributes: Vec<(Option<&'src str>, &'src str, String, usize)>,
}

impl<'src> ParserSource<'src> {
    /// Creates a source over the given XML text.
    #[must_use]
    pub fn new(src: &'src str) -> Self {
        Self {
            src,
            tokenizer: xmlparser::Tokenizer::from(src),
            state: ParserState::NotStarted,
            pending: VecDeque::new(),
            open: vec![],
            scopes: vec![],
            start: None,
            dtd_start: None,
        }
    }

    /// Returns the text being parsed.
    #[must_use]
    pub fn source(&self) -> &'src str {
        self.src
    }

    fn fail(&mut self, kind: XmlErrorKind, offset: usize) -> XmlError {
        self.state = ParserState::Finished;
        self.pending.clear();
        XmlError::from(kind).at(self.src, offset)
    }

    /// Pulls tokens until at least one event is queued, or input ends.
    fn fill(&mut self) -> XmlResult<()> {
        while self.pending.is_empty() {
            let Some(token) = self.tokenizer.next() else {
                return self.finish();
            };

            let token = match token {
                Ok(token) => token,
                Err(e) => {
                    self.state = ParserState::Finished;
                    let pos = e.pos();
                    let mut err = XmlError::from(e);
                    err.context.position = Some((pos.row as usize, pos.col as usize));
                    return Err(err);
                }
            };

            self.token(token)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> XmlResult<()> {
        if let Some((prefix, local)) = self.open.last() {
            let name = qualified(*prefix, local);
            return Err(self.fail(XmlErrorKind::UnclosedTag(name), self.src.len()));
        }

        self.state = ParserState::Finished;
        self.pending.push_back(XmlEvent::EndDocument);
        Ok(())
    }

    fn token(&mut self, token: Token<'src>) -> XmlResult<()> {
        match token {
            Token::Declaration { .. } => {}

            Token::ProcessingInstruction {
                target, content, ..
            } => {
                self.pending.push_back(XmlEvent::ProcessingInstruction {
                    target: target.as_str().to_string(),
                    data: content.map(|c| c.as_str().to_string()),
                });
            }

            Token::Comment { text, .. } => {
                self.pending
                    .push_back(XmlEvent::Comment(text.as_str().to_string()));
            }

            Token::EmptyDtd { span, .. } => {
                self.pending
                    .push_back(XmlEvent::DocType(span.as_str().to_string()));
            }

            Token::DtdStart { span, .. } => self.dtd_start = Some(span.start()),
            Token::EntityDeclaration { .. } => {}
            Token::DtdEnd { span } => {
                let start = self.dtd_start.take().unwrap_or(span.start());
                let text = &self.src[start..span.end()];
                self.pending.push_back(XmlEvent::DocType(text.to_string()));
            }

            Token::ElementStart {
                prefix,
                local,
                span,
            } => {
                self.start = Some(PendingStart {
                    offset: span.start(),
                    prefix: non_empty(prefix.as_str()),
                    local: local.as_str(),
                    namespaces: vec![],
                    attributes: vec![],
                });
            }

            Token::Attribute {
                prefix,
                local,
                value,
                span,
            } => {
                let value = decode_references(value.as_str())
                    .map_err(|(kind, at)| self.fail(kind, value.start() + at))?;
                let Some(start) = self.start.as_mut() else {
                    return Err(self.fail(
                        XmlErrorKind::Structural("attribute outside of a start tag".into()),
                        span.start(),
                    ));
                };

                match (prefix.as_str(), local.as_str()) {
                    ("xmlns", prefix) => start
                        .namespaces
                        .push(NamespaceDecl::new(Some(prefix), value)),
                    ("", "xmlns") => start
                        .namespaces
                        .push(NamespaceDecl::new(None::<&str>, value)),
                    (prefix, local) => {
                        start
                            .attributes
                            .push((non_empty(prefix), local, value, span.start()));
                    }
                }
            }

            Token::ElementEnd {
                end: ElementEnd::Open,
                ..
            } => self.open_element(false)?,

            Token::ElementEnd {
                end: ElementEnd::Empty,
                ..
            } => self.open_element(true)?,

            Token::ElementEnd {
                end: ElementEnd::Close(prefix, local),
                span,
            } => {
                let found = (non_empty(prefix.as_str()), local.as_str());
                match self.open.pop() {
                    Some(expected) if expected == found => {}
                    Some((prefix, local)) => {
                        let kind = XmlErrorKind::MismatchedEndTag {
                            expected: qualified(prefix, local),
                            found: qualified(found.0, found.1),
                        };
                        return Err(self.fail(kind, span.start()));
                    }
                    None => return Err(self.fail(XmlErrorKind::UnbalancedEnd, span.start())),
                }

                self.scopes.pop();
                self.pending.push_back(XmlEvent::EndElement);
            }

            Token::Text { text } => {
                let content = decode_references(text.as_str())
                    .map_err(|(kind, at)| self.fail(kind, text.start() + at))?;
                self.pending
                    .push_back(XmlEvent::Characters(CharacterContent::Text(content)));
            }

            Token::Cdata { text, .. } => {
                self.pending.push_back(XmlEvent::Characters(CharacterContent::Text(
                    text.as_str().to_string(),
                )));
            }
        }

        Ok(())
    }

    fn open_element(&mut self, empty: bool) -> XmlResult<()> {
        let Some(start) = self.start.take() else {
            return Err(self.fail(
                XmlErrorKind::Structural("end of a start tag that was never opened".into()),
                self.src.len(),
            ));
        };

        self.scopes.push(start.namespaces.clone());

        let namespace = self
            .resolve(start.prefix)
            .map_err(|kind| self.fail(kind, start.offset))?;
        let name = QName::new(
            namespace,
            start.prefix.map(str::to_string),
            start.local.to_string(),
        );

        let mut attributes = Vec::with_capacity(start.attributes.len());
        for (prefix, local, value, offset) in start.attributes {
            // Unprefixed attributes are in no namespace
            let namespace = match prefix {
                Some(_) => self
                    .resolve(prefix)
                    .map_err(|kind| self.fail(kind, offset))?,
                None => None,
            };
            let name = QName::new(
                namespace,
                prefix.map(str::to_string),
                local.to_string(),
            );
            attributes.push(Attribute { name, value });
        }

        log::trace!("start element <{name}>");
        self.pending.push_back(XmlEvent::StartElement {
            name,
            namespaces: start.namespaces,
            attributes,
        });

        if empty {
            self.scopes.pop();
            self.pending.push_back(XmlEvent::EndElement);
        } else {
            self.open.push((start.prefix, start.local));
        }
        Ok(())
    }

    /// Finds the namespace bound to a prefix, innermost declaration first.
    fn resolve(&self, prefix: Option<&str>) -> Result<Option<String>, XmlErrorKind> {
        if prefix == Some("xml") {
            return Ok(Some(XML_NAMESPACE.to_string()));
        }

        let declared = self
            .scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|ns| ns.prefix.as_deref() == prefix);

        match (declared, prefix) {
            // xmlns="" undeclares the default namespace
            (Some(ns), _) if ns.uri.is_empty() && prefix.is_none() => Ok(None),
            (Some(ns), _) => Ok(Some(ns.uri.clone())),
            (None, None) => Ok(None),
            (None, Some(prefix)) => Err(XmlErrorKind::UnboundPrefix(prefix.to_string())),
        }
    }
}
impl EventSource for ParserSource<'_> {
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        match self.state {
            ParserState::Finished => Ok(None),
            ParserState::NotStarted => {
                self.state = ParserState::Running;
                Ok(Some(XmlEvent::StartDocument))
            }
            ParserState::Running => {
                self.fill()?;
                Ok(self.pending.pop_front())
            }
        }
    }

    fn close(&mut self) {
        self.state = ParserState::Finished;
        self.pending.clear();
    }
}
fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}

fn qualified(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

/// Replaces the predefined entity references and character references with the text they
/// stand for. Any other reference is an error, reported with its offset into `raw`.
fn decode_references(raw: &str) -> Result<String, (XmlErrorKind, usize)> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }

    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        let offset = raw.len() - rest.len() + amp;
        let tail = &rest[amp + 1..];
        let Some(end) = tail.find(';') else {
            let kind = XmlErrorKind::Structural("unterminated reference".into());
            return Err((kind, offset));
        };

        let name = &tail[..end];
        match name {
            "lt" => decoded.push('<'),
            "gt" => decoded.push('>'),
            "amp" => decoded.push('&'),
            "apos" => decoded.push('\''),
            "quot" => decoded.push('"'),
            _ => match decode_char_reference(name) {
                Some(c) => decoded.push(c),
                None => {
                    let kind = XmlErrorKind::Structural(format!("undefined reference &{name};"));
                    return Err((kind, offset));
                }
            },
        }
        rest = &tail[end + 1..];
    }

    decoded.push_str(rest);
    Ok(decoded)
}

/// Decodes `#N` or `#xN` into a character allowed in XML 1.0 content.
fn decode_char_reference(name: &str) -> Option<char> {
    let digits = name.strip_prefix('#')?;
    let (digits, radix) = match digits.strip_prefix('x') {
        Some(hex) => (hex, 16),
        None => (digits, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()?;

    let c = Entity::decode(name.as_bytes()).ok()?;
    let allowed = matches!(
        c,
        '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..
    );
    allowed.then_some(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn collect(src: &str) -> XmlResult<Vec<XmlEvent>> {
        let mut source = ParserSource::new(src);
        let mut events = vec![];
        while let Some(event) = source.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    fn labels(events: &[XmlEvent]) -> Vec<&'static str> {
        events.iter().map(XmlEvent::label).collect()
    }

    #[test]
    fn test_simple_document() {
        let events = collect("<a><b/>text</a>").unwrap();
        assert_eq!(
            labels(&events),
            vec![
                "start of document",
                "start element",
                "start element",
                "end element",
                "characters",
                "end element",
                "end of document"
            ]
        );
    }

    #[test]
    fn test_namespaces_resolve() {
        let events = collect(
            r#"<s:env xmlns:s="urn:soap" xmlns="urn:default"><body s:id="1" plain="2"/></s:env>"#,
        )
        .unwrap();

        let XmlEvent::StartElement {
            name, namespaces, ..
        } = &events[1]
        else {
            panic!("expected start element");
        };
        assert!(name.matches(Some("urn:soap"), "env"));
        assert_eq!(namespaces.len(), 2);

        let XmlEvent::StartElement {
            name, attributes, ..
        } = &events[2]
        else {
            panic!("expected start element");
        };
        assert!(name.matches(Some("urn:default"), "body"));
        assert!(attributes[0].name.matches(Some("urn:soap"), "id"));
        assert!(attributes[1].name.matches(None, "plain"));
    }

    #[test]
    fn test_unbound_prefix() {
        let err = collect("<x:a/>").unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnboundPrefix(ref p) if p == "x"));
    }

    #[test]
    fn test_references_are_decoded() {
        let events = collect(r#"<a t="&lt;&amp;">1 &lt; 2 &#65;</a>"#).unwrap();
        let XmlEvent::StartElement { attributes, .. } = &events[1] else {
            panic!("expected start element");
        };
        assert_eq!(attributes[0].value, "<&");

        let XmlEvent::Characters(content) = &events[2] else {
            panic!("expected characters");
        };
        assert_eq!(content.text().unwrap(), "1 < 2 A");
    }

    #[test]
    fn test_only_xml_references_are_decoded() {
        let events = collect("<a>&#x42;&apos;&quot;&gt;</a>").unwrap();
        let XmlEvent::Characters(content) = &events[2] else {
            panic!("expected characters");
        };
        assert_eq!(content.text().unwrap(), "B'\">");

        for src in [
            "<a>&nbsp;</a>",
            "<a>x &copy;</a>",
            "<a>&foo;</a>",
            "<a t=\"&nbsp;\"/>",
            "<a>&#0;</a>",
            "<a>&#xD800;</a>",
            "<a>&#X41;</a>",
            "<a>&#;</a>",
        ] {
            let err = collect(src).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Structural, "{src}");
            assert!(err.context.position.is_some(), "{src}");
        }
    }

    #[test]
    fn test_reference_error_points_at_reference() {
        let err = collect("<a>ok &foo;</a>").unwrap_err();
        assert!(err.to_string().contains("&foo;"));
        assert_eq!(err.context.position, Some((1, 7)));
    }

    #[test]
    fn test_cdata_comment_pi_doctype() {
        let events =
            collect("<!DOCTYPE a><?pi data?><a><![CDATA[<raw>]]><!--c--></a>").unwrap();
        assert_eq!(
            labels(&events),
            vec![
                "start of document",
                "doctype",
                "processing instruction",
                "start element",
                "characters",
                "comment",
                "end element",
                "end of document"
            ]
        );

        let XmlEvent::DocType(text) = &events[1] else {
            panic!("expected doctype");
        };
        assert_eq!(text, "<!DOCTYPE a>");
    }

    #[test]
    fn test_mismatched_end_tag() {
        let err = collect("<a><b></a>").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Structural);
        assert!(err.context.position.is_some());
    }

    #[test]
    fn test_unclosed_tag() {
        let err = collect("<a><b></b>").unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnclosedTag(ref n) if n == "a"));
    }

    #[test]
    fn test_close_stops_events() {
        let mut source = ParserSource::new("<a><b/></a>");
        assert!(source.next_event().unwrap().is_some());
        source.close();
        source.close();
        assert!(source.next_event().unwrap().is_none());
    }
}
