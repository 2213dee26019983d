//! MTOM messages: a `multipart/related` body whose root part is XML with
//! `xop:Include` placeholders, and whose other parts carry the binary payloads.
//!
//! Parts are read lazily. Asking for a content-ID reads the body only as far
//! as the part carrying it; earlier parts are buffered on the way.
use crate::{
    Document,
    attachments::{AttachmentProvider, MemoryAttachments},
    blob::{Blob, BlobOptions},
    error::{Endpoint, XmlErrorKind, XmlResult, bail},
    node::NodeId,
    serializer::XmlWriter,
    source::ParserSource,
    xop::{XopConfig, XopDecoder, XopEncoder},
};
use memchr::memmem;
use std::{
    cell::RefCell,
    io::{Read, Write},
    rc::Rc,
};

/// Media type of the root part of an MTOM message.
pub const XOP_MEDIA_TYPE: &str = "application/xop+xml";

const READ_CHUNK: usize = 8 * 1024;

/// Returns a parameter of a `Content-Type` value, without quotes.
#[must_use]
pub fn content_type_parameter(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

/// Returns the boundary of a multipart `Content-Type` value.
///
/// # Errors
/// Fails if the value has no boundary parameter.
pub fn boundary_from_content_type(content_type: &str) -> XmlResult<String> {
    match content_type_parameter(content_type, "boundary") {
        Some(boundary) if !boundary.is_empty() => Ok(boundary),
        _ => bail!(XmlErrorKind::UnsupportedAttachment(format!(
            "no boundary in content type {content_type:?}"
        ))),
    }
}

fn strip_angle_brackets(content_id: &str) -> &str {
    let trimmed = content_id.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
}

/// One part of a multipart body.
#[derive(Debug, Clone)]
pub struct MimePart {
    /// The part's headers, in order, with names as written.
    pub headers: Vec<(String, String)>,

    /// The part's content.
    pub body: Rc<Blob>,
}
impl MimePart {
    /// Searches the headers for a name, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The part's content-ID, without angle brackets.
    #[must_use]
    pub fn content_id(&self) -> Option<&str> {
        self.header("Content-ID").map(strip_angle_brackets)
    }

    /// The part's media type.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

/// Splits a multipart body into parts, one at a time.
struct PartScanner<R> {
    reader: R,
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    options: BlobOptions,
    started: bool,
    finished: bool,
    eof: bool,
}
impl<R: Read> PartScanner<R> {
    fn new(reader: R, boundary: &str, options: BlobOptions) -> Self {
        Self {
            reader,
            delimiter: format!("\r\n--{boundary}").into_bytes(),
            // A boundary on the very first line has no line break before it
            buffer: b"\r\n".to_vec(),
            options,
            started: false,
            finished: false,
            eof: false,
        }
    }

    /// Reads another chunk. Returns false at the end of input.
    fn fill(&mut self) -> XmlResult<bool> {
        if self.eof {
            return Ok(false);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => bail!(XmlErrorKind::stream(Endpoint::Read, e)),
            }
        };

        self.eof = n == 0;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }

    /// Position of `needle` in the buffer, reading more input as needed.
    fn find(&mut self, needle: &[u8]) -> XmlResult<Option<usize>> {
        loop {
            if let Some(pos) = memmem::find(&self.buffer, needle) {
                return Ok(Some(pos));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    fn truncated() -> XmlErrorKind {
        XmlErrorKind::UnsupportedAttachment("multipart body ends inside a part".into())
    }

    fn next_part(&mut self) -> XmlResult<Option<MimePart>> {
        if self.finished {
            return Ok(None);
        }

        if !self.started {
            let delimiter = self.delimiter.clone();
            let Some(pos) = self.find(&delimiter)? else {
                bail!(XmlErrorKind::UnsupportedAttachment(
                    "multipart body has no boundary".into()
                ));
            };
            self.buffer.drain(..pos + delimiter.len());
            self.started = true;
        }

        // The delimiter is followed by "--" on the last one, then padding to the end of the line
        while self.buffer.len() < 2 && self.fill()? {}
        if self.buffer.starts_with(b"--") {
            self.finished = true;
            return Ok(None);
        }
        let Some(eol) = self.find(b"\r\n")? else {
            bail!(Self::truncated());
        };
        self.buffer.drain(..eol + 2);

        let headers = self.headers()?;
        let body = self.body()?;
        Ok(Some(MimePart {
            headers,
            body: Rc::new(body),
        }))
    }

    fn headers(&mut self) -> XmlResult<Vec<(String, String)>> {
        while self.buffer.len() < 2 && self.fill()? {}
        if self.buffer.starts_with(b"\r\n") {
            self.buffer.drain(..2);
            return Ok(vec![]);
        }

        let Some(end) = self.find(b"\r\n\r\n")? else {
            bail!(Self::truncated());
        };
        let block: Vec<u8> = self.buffer.drain(..end + 4).collect();
        let block = String::from_utf8_lossy(&block[..end]);

        let mut headers: Vec<(String, String)> = vec![];
        for line in block.split("\r\n") {
            // Folded continuation of the previous header
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                bail!(XmlErrorKind::UnsupportedAttachment(format!(
                    "malformed part header {line:?}"
                )));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(headers)
    }

    fn body(&mut self) -> XmlResult<Blob> {
        let mut blob = Blob::new(self.options);
        let keep = self.delimiter.len() - 1;
        loop {
            if let Some(pos) = memmem::find(&self.buffer, &self.delimiter) {
                blob.write_all(&self.buffer[..pos])
                    .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
                self.buffer.drain(..pos + self.delimiter.len());
                return Ok(blob);
            }

            // Hold back anything that could be the start of a delimiter
            if self.buffer.len() > keep {
                let n = self.buffer.len() - keep;
                blob.write_all(&self.buffer[..n])
                    .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
                self.buffer.drain(..n);
            }

            if !self.fill()? {
                bail!(Self::truncated());
            }
        }
    }
}

/// Attachments read lazily from a multipart body.
pub struct MultipartAttachments<R> {
    scanner: RefCell<PartScanner<R>>,
    parts: MemoryAttachments,
}
impl<R: Read> MultipartAttachments<R> {
    /// Reads parts from `reader`, which is positioned at the start of the body.
    pub fn new(reader: R, boundary: &str, options: BlobOptions) -> Self {
        Self {
            scanner: RefCell::new(PartScanner::new(reader, boundary, options)),
            parts: MemoryAttachments::new(),
        }
    }

    /// Reads the next part without registering it as an attachment.
    fn read_part(&self) -> XmlResult<Option<MimePart>> {
        self.scanner.borrow_mut().next_part()
    }

    /// Registers a part under its content-ID. Parts without one cannot be referenced.
    fn register(&self, part: &MimePart) {
        match part.content_id() {
            Some(content_id) => {
                log::trace!("buffered part <{content_id}> of {} bytes", part.body.size());
                self.parts.insert(content_id, part.body.clone());
            }
            None => log::debug!("skipping a part with no Content-ID"),
        }
    }

    /// Reads every remaining part.
    ///
    /// # Errors
    /// Fails if the body is malformed, or reading it fails.
    pub fn load_all(&self) -> XmlResult<()> {
        while let Some(part) = self.read_part()? {
            self.register(&part);
        }
        Ok(())
    }

    /// Content-IDs of the parts buffered so far.
    #[must_use]
    pub fn loaded_ids(&self) -> Vec<String> {
        self.parts.content_ids()
    }
}
impl<R: Read> AttachmentProvider for MultipartAttachments<R> {
    fn is_loaded(&self, content_id: &str) -> bool {
        self.parts.is_loaded(content_id)
    }

    fn payload(&self, content_id: &str) -> XmlResult<Rc<Blob>> {
        while !self.parts.is_loaded(content_id) {
            let Some(part) = self.read_part()? else {
                bail!(XmlErrorKind::UnknownContentId(content_id.to_string()));
            };
            self.register(&part);
        }
        self.parts.payload(content_id)
    }
}

/// A received MTOM message: its root XML part, and lazily read attachments.
pub struct MtomMessage<R> {
    root: MimePart,
    attachments: Rc<MultipartAttachments<R>>,
}
impl<R: Read + 'static> MtomMessage<R> {
    /// Reads the root part of a message. Attachments are read when first needed.
    ///
    /// The root is the part named by the `start` parameter, or the first part.
    ///
    /// # Errors
    /// Fails if the content type has no boundary, or the root part cannot be found.
    pub fn parse(content_type: &str, reader: R, options: BlobOptions) -> XmlResult<Self> {
        let boundary = boundary_from_content_type(content_type)?;
        let start = content_type_parameter(content_type, "start")
            .map(|start| strip_angle_brackets(&start).to_string());
        let attachments = Rc::new(MultipartAttachments::new(reader, &boundary, options));

        let root = loop {
            let Some(part) = attachments.read_part()? else {
                bail!(XmlErrorKind::UnsupportedAttachment(
                    "multipart body has no root part".into()
                ));
            };
            match &start {
                Some(start) if part.content_id() != Some(start.as_str()) => {
                    attachments.register(&part);
                }
                _ => break part,
            }
        };

        Ok(Self { root, attachments })
    }

    /// The root part.
    #[must_use]
    pub fn root(&self) -> &MimePart {
        &self.root
    }

    /// The attachments of the message.
    #[must_use]
    pub fn attachments(&self) -> Rc<MultipartAttachments<R>> {
        self.attachments.clone()
    }

    /// The root part as text.
    ///
    /// # Errors
    /// Fails if the root part is not UTF-8.
    pub fn root_xml(&self) -> XmlResult<String> {
        let bytes = self.root.body.to_vec()?;
        String::from_utf8(bytes).map_err(|e| {
            XmlErrorKind::UnsupportedAttachment(format!("root part is not UTF-8: {e}")).into()
        })
    }

    /// Builds a tree over root XML text, with placeholders decoded against
    /// this message's attachments.
    pub fn document<'src>(&self, xml: &'src str) -> Document<'src> {
        let provider: Rc<dyn AttachmentProvider> = self.attachments.clone();
        Document::from_source(XopDecoder::new(ParserSource::new(xml), provider))
    }
}

fn write(out: &mut dyn Write, bytes: &[u8]) -> XmlResult<()> {
    out.write_all(bytes)
        .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e).into())
}

/// Writes a tree as an MTOM message, returning the `Content-Type` to send it with.
///
/// # Errors
/// Fails if the tree cannot be built or serialized, or if writing fails.
pub fn write_mtom(
    document: &mut Document<'_>,
    out: &mut dyn Write,
    config: XopConfig,
) -> XmlResult<String> {
    let mut encoder = XopEncoder::new(XmlWriter::new(Vec::new()), config);
    document.serialize(NodeId::DOCUMENT, &mut encoder)?;
    let attachments = encoder.attachments();
    let xml = encoder.into_inner().finish()?;

    let id = uuid::Uuid::new_v4().simple();
    let boundary = format!("MIMEBoundary_{id}");
    let root_id = format!("root.{id}@xmlom");

    write(
        out,
        format!(
            "--{boundary}\r\n\
             Content-Type: {XOP_MEDIA_TYPE}; charset=UTF-8; type=\"text/xml\"\r\n\
             Content-Transfer-Encoding: binary\r\n\
             Content-ID: <{root_id}>\r\n\r\n"
        )
        .as_bytes(),
    )?;
    write(out, &xml)?;

    for (content_id, blob) in attachments.parts() {
        write(
            out,
            format!(
                "\r\n--{boundary}\r\n\
                 Content-Type: application/octet-stream\r\n\
                 Content-Transfer-Encoding: binary\r\n\
                 Content-ID: <{content_id}>\r\n\r\n"
            )
            .as_bytes(),
        )?;
        blob.write_to(out)?;
    }
    write(out, format!("\r\n--{boundary}--\r\n").as_bytes())?;

    log::debug!("wrote MTOM message with {} attachments", attachments.len());
    Ok(format!(
        "multipart/related; boundary=\"{boundary}\"; type=\"{XOP_MEDIA_TYPE}\"; \
         start=\"<{root_id}>\"; start-info=\"text/xml\""
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorCategory,
        node::{BinaryContent, CharacterContent},
        xop::OptimizationPolicy,
    };
    use std::io::Cursor;

    const BODY: &str = "preamble\r\n\
        --b1\r\n\
        Content-Type: application/xop+xml\r\n\
        Content-ID: <root@x>\r\n\r\n\
        <a><xop:Include xmlns:xop=\"http://www.w3.org/2004/08/xop/include\" href=\"cid:one@x\"/></a>\r\n\
        --b1\r\n\
        Content-ID: <one@x>\r\n\r\n\
        first\r\n\
        --b1\r\n\
        Content-ID: <two@x>\r\n\r\n\
        second\r\n\
        --b1--\r\n";

    fn binary_of(doc: &mut Document, id: NodeId) -> Vec<u8> {
        let child = doc.first_child(id).unwrap().unwrap();
        let CharacterContent::Binary(binary) = doc.kind(child).as_text().unwrap() else {
            panic!("expected binary content");
        };
        binary.to_vec().unwrap()
    }

    #[test]
    fn test_content_type_parameters() {
        let ct = r#"multipart/related; type="application/xop+xml"; Boundary="abc"; start="<r@x>""#;
        assert_eq!(boundary_from_content_type(ct).unwrap(), "abc");
        assert_eq!(content_type_parameter(ct, "start").as_deref(), Some("<r@x>"));

        let err = boundary_from_content_type("text/xml").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_parts_are_read_lazily() {
        let reader = Cursor::new(BODY.as_bytes().to_vec());
        let message = MtomMessage::parse(
            r#"multipart/related; boundary=b1; start="<root@x>""#,
            reader,
            BlobOptions::default(),
        )
        .unwrap();
        assert_eq!(message.root().content_id(), Some("root@x"));

        let attachments = message.attachments();
        assert!(attachments.loaded_ids().is_empty());

        assert_eq!(attachments.payload("one@x").unwrap().to_vec().unwrap(), b"first");
        assert!(attachments.is_loaded("one@x"));
        assert!(!attachments.is_loaded("two@x"));

        assert_eq!(attachments.payload("two@x").unwrap().to_vec().unwrap(), b"second");
        let err = attachments.payload("three@x").unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnknownContentId(_)));
    }

    #[test]
    fn test_decode_message() {
        let reader = Cursor::new(BODY.as_bytes().to_vec());
        let message =
            MtomMessage::parse("multipart/related; boundary=\"b1\"", reader, BlobOptions::default())
                .unwrap();

        let xml = message.root_xml().unwrap();
        let mut doc = message.document(&xml);
        let a = doc.document_element().unwrap().unwrap();
        assert_eq!(binary_of(&mut doc, a), b"first");
        assert!(!message.attachments().is_loaded("two@x"));
    }

    #[test]
    fn test_truncated_body() {
        let body = "--b1\r\nContent-ID: <r>\r\n\r\n<a/>";
        let err = MtomMessage::parse(
            "multipart/related; boundary=b1",
            Cursor::new(body.as_bytes().to_vec()),
            BlobOptions::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_write_then_read() {
        let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut doc = Document::new();
        let root = doc.create_element("root");
        let small = doc.create_element("small");
        let large = doc.create_element("large");
        let small_data = doc.create_binary(BinaryContent::from_bytes(b"tiny").unwrap());
        let large_data = doc.create_binary(BinaryContent::from_bytes(&big).unwrap());
        doc.append_child(NodeId::DOCUMENT, root).unwrap();
        doc.append_child(root, small).unwrap();
        doc.append_child(root, large).unwrap();
        doc.append_child(small, small_data).unwrap();
        doc.append_child(large, large_data).unwrap();

        let mut body = Vec::new();
        let config = XopConfig::with_policy(OptimizationPolicy::Threshold(1024));
        let content_type = write_mtom(&mut doc, &mut body, config).unwrap();

        // A small memory threshold moves the large part to disk while reading
        let options = BlobOptions {
            memory_threshold: 4096,
        };
        let message = MtomMessage::parse(&content_type, Cursor::new(body), options).unwrap();
        let xml = message.root_xml().unwrap();
        assert!(xml.contains("<small>dGlueQ==</small>"));

        let mut decoded = message.document(&xml);
        let root = decoded.document_element().unwrap().unwrap();
        let large = decoded.nth_child(root, 1).unwrap().unwrap();
        assert_eq!(binary_of(&mut decoded, large), big);

        let loaded = message.attachments().loaded_ids();
        assert_eq!(loaded.len(), 1);
        let blob = message.attachments().payload(&loaded[0]).unwrap();
        assert!(blob.is_on_disk());
    }
}
