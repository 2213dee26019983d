//! Buffered character output, aware of UTF-16 surrogate pairs.
//!
//! Characters may arrive as whole strings, as code points, or one UTF-16 code
//! unit at a time. A high surrogate is held until its low surrogate arrives, so
//! a supplementary character split across two calls writes the same bytes as
//! one written whole.
use crate::error::{Endpoint, XmlErrorKind, XmlResult, bail};
use std::io::Write;

/// Default size of the output buffer, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// The character encoding of written output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputEncoding {
    /// UTF-8; every character is representable.
    #[default]
    Utf8,

    /// US-ASCII; characters above U+007F are written as references.
    Ascii,

    /// ISO-8859-1; characters above U+00FF are written as references.
    Latin1,
}
impl OutputEncoding {
    /// The name of the encoding, as used in an XML declaration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Ascii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
        }
    }

    /// Looks up an encoding by its name, ignoring case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "UTF-8" | "UTF8" => Some(Self::Utf8),
            "US-ASCII" | "ASCII" => Some(Self::Ascii),
            "ISO-8859-1" | "LATIN1" => Some(Self::Latin1),
            _ => None,
        }
    }

    fn can_encode(self, code_point: u32) -> bool {
        match self {
            Self::Utf8 => true,
            Self::Ascii => code_point < 0x80,
            Self::Latin1 => code_point < 0x100,
        }
    }
}

/// Options for writing XML output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// The output encoding.
    pub encoding: OutputEncoding,

    /// Size of the output buffer in bytes; the buffer is flushed when full.
    pub buffer_size: usize,

    /// Write an XML declaration at the start of the document.
    pub declaration: bool,
}
impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            encoding: OutputEncoding::Utf8,
            buffer_size: DEFAULT_BUFFER_SIZE,
            declaration: false,
        }
    }
}

/// How markup-significant characters are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    /// Verbatim. Unmappable characters are an error, since there is no way to reference them.
    None,

    /// Character data: `&`, `<` and `>` are escaped.
    Text,

    /// Attribute values: as for text, plus quotes and whitespace that would be normalized.
    Attribute,
}

/// Encodes characters into a fixed-size buffer over a byte sink.
pub struct PushWriter<W: Write> {
    inner: W,
    buffer: Box<[u8]>,
    fill: usize,
    pending_high: Option<u16>,
    encoding: OutputEncoding,
}
impl<W: Write> PushWriter<W> {
    /// Creates a writer over `inner`.
    pub fn new(inner: W, options: &WriterOptions) -> Self {
        Self {
            inner,
            buffer: vec![0; options.buffer_size.max(16)].into_boxed_slice(),
            fill: 0,
            pending_high: None,
            encoding: options.encoding,
        }
    }

    /// The output encoding.
    #[must_use]
    pub fn encoding(&self) -> OutputEncoding {
        self.encoding
    }

    /// Number of bytes waiting in the buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.fill
    }

    /// The high surrogate waiting for its pair, if any.
    #[must_use]
    pub fn pending_surrogate(&self) -> Option<u16> {
        self.pending_high
    }

    /// Writes one UTF-16 code unit.
    ///
    /// A high surrogate is held until the next call supplies its low surrogate.
    ///
    /// # Errors
    /// Fails on a low surrogate with no high surrogate pending, on a high
    /// surrogate while another is pending, or on a non-surrogate while one is
    /// pending. The pending surrogate is dropped on failure.
    pub fn write_unit(&mut self, unit: u16, escape: Escape) -> XmlResult<()> {
        match unit {
            0xD800..=0xDBFF => {
                if let Some(high) = self.pending_high.take() {
                    bail!(XmlErrorKind::UnpairedHighSurrogate(high));
                }
                self.pending_high = Some(unit);
                Ok(())
            }

            0xDC00..=0xDFFF => {
                // The register is cleared before the pair is written
                let Some(high) = self.pending_high.take() else {
                    bail!(XmlErrorKind::UnpairedLowSurrogate(unit));
                };
                let code_point =
                    0x10000 + ((u32::from(high) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
                self.write_code_point(code_point, escape)
            }

            _ => {
                if let Some(high) = self.pending_high.take() {
                    bail!(XmlErrorKind::UnpairedHighSurrogate(high));
                }
                self.write_code_point(u32::from(unit), escape)
            }
        }
    }

    /// Writes a sequence of UTF-16 code units, which must form whole characters.
    ///
    /// # Errors
    /// Fails on any unpaired surrogate, including a trailing high surrogate.
    pub fn write_units(&mut self, units: &[u16], escape: Escape) -> XmlResult<()> {
        self.check_no_pending()?;
        for unit in units {
            self.write_unit(*unit, escape)?;
        }
        self.check_no_pending()
    }

    /// Writes a string.
    ///
    /// # Errors
    /// Fails if a high surrogate is pending, if a character cannot be
    /// represented, or if the underlying sink fails.
    pub fn write_str(&mut self, text: &str, escape: Escape) -> XmlResult<()> {
        self.check_no_pending()?;
        for c in text.chars() {
            self.write_code_point(u32::from(c), escape)?;
        }
        Ok(())
    }

    /// Writes one code point, escaping it as requested.
    ///
    /// A code point the output encoding cannot represent is written as a
    /// numeric character reference, except in [`Escape::None`] mode.
    ///
    /// # Errors
    /// Fails if the code point cannot be represented, or if the sink fails.
    pub fn write_code_point(&mut self, code_point: u32, escape: Escape) -> XmlResult<()> {
        let replacement: Option<&[u8]> = match (escape, code_point) {
            (Escape::None, _) => None,
            (_, 0x26) => Some(b"&amp;"),
            (_, 0x3C) => Some(b"&lt;"),
            (_, 0x3E) => Some(b"&gt;"),
            (Escape::Attribute, 0x22) => Some(b"&quot;"),
            (Escape::Attribute, 0x09) => Some(b"&#9;"),
            (Escape::Attribute, 0x0A) => Some(b"&#10;"),
            (Escape::Attribute, 0x0D) => Some(b"&#13;"),
            _ => None,
        };
        if let Some(replacement) = replacement {
            return self.write_bytes(replacement);
        }

        let c = char::from_u32(code_point).filter(|_| self.encoding.can_encode(code_point));
        match (c, self.encoding) {
            (Some(c), OutputEncoding::Utf8) => {
                let mut bytes = [0; 4];
                self.write_bytes(c.encode_utf8(&mut bytes).as_bytes())
            }

            // Single-byte encodings; can_encode has bounded the value
            (Some(_), _) => self.write_bytes(&[code_point as u8]),

            (None, _) if escape == Escape::None || char::from_u32(code_point).is_none() => {
                bail!(XmlErrorKind::Unmappable {
                    code_point,
                    encoding: self.encoding.name()
                })
            }

            (None, _) => {
                // Fallback reference; ASCII digits only, so this recurses once
                log::trace!("writing U+{code_point:04X} as a character reference");
                let reference = format!("&#{code_point};");
                for c in reference.chars() {
                    self.write_code_point(u32::from(c), Escape::None)?;
                }
                Ok(())
            }
        }
    }

    /// Writes bytes verbatim. The caller is responsible for their encoding.
    ///
    /// # Errors
    /// Fails if the buffer has to be flushed and the sink fails.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> XmlResult<()> {
        while !bytes.is_empty() {
            if self.fill == self.buffer.len() {
                self.flush_buffer()?;
            }

            let n = bytes.len().min(self.buffer.len() - self.fill);
            self.buffer[self.fill..self.fill + n].copy_from_slice(&bytes[..n]);
            self.fill += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> XmlResult<()> {
        if self.fill > 0 {
            self.inner
                .write_all(&self.buffer[..self.fill])
                .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
            self.fill = 0;
        }
        Ok(())
    }

    /// Writes out everything buffered. Calling it again with nothing buffered has no effect.
    ///
    /// # Errors
    /// Fails if the sink fails.
    pub fn flush(&mut self) -> XmlResult<()> {
        self.flush_buffer()?;
        self.inner
            .flush()
            .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
        Ok(())
    }

    /// Flushes and returns the underlying sink.
    ///
    /// # Errors
    /// Fails if a high surrogate is still pending, or if the sink fails.
    pub fn finish(mut self) -> XmlResult<W> {
        self.check_no_pending()?;
        self.flush()?;
        Ok(self.inner)
    }

    fn check_no_pending(&mut self) -> XmlResult<()> {
        match self.pending_high.take() {
            Some(high) => bail!(XmlErrorKind::UnpairedHighSurrogate(high)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn writer(encoding: OutputEncoding) -> PushWriter<Vec<u8>> {
        PushWriter::new(
            Vec::new(),
            &WriterOptions {
                encoding,
                ..WriterOptions::default()
            },
        )
    }

    #[test]
    fn test_split_surrogates_match_whole() {
        let text = "a\u{1F600}b";
        let units: Vec<u16> = text.encode_utf16().collect();

        let mut whole = writer(OutputEncoding::Utf8);
        whole.write_str(text, Escape::Text).unwrap();

        let mut split = writer(OutputEncoding::Utf8);
        for unit in &units {
            split.write_unit(*unit, Escape::Text).unwrap();
        }
        assert_eq!(split.pending_surrogate(), None);

        assert_eq!(whole.finish().unwrap(), split.finish().unwrap());
    }

    #[test]
    fn test_unpaired_surrogates_fail() {
        let mut w = writer(OutputEncoding::Utf8);
        let err = w.write_unit(0xDC00, Escape::Text).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnpairedLowSurrogate(0xDC00)));
        assert_eq!(err.category(), ErrorCategory::Encoding);

        // Every time
        assert!(w.write_unit(0xDC00, Escape::Text).is_err());

        w.write_unit(0xD83D, Escape::Text).unwrap();
        let err = w.write_unit(0xD83D, Escape::Text).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnpairedHighSurrogate(0xD83D)));
        assert_eq!(w.pending_surrogate(), None);

        let err = w.write_units(&[0x61, 0xD83D], Escape::Text).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnpairedHighSurrogate(_)));
        assert_eq!(w.pending_surrogate(), None);
    }

    #[test]
    fn test_escaping() {
        let mut w = writer(OutputEncoding::Utf8);
        w.write_str("a<b&c>\"", Escape::Text).unwrap();
        w.write_bytes(b"|").unwrap();
        w.write_str("\"x\"\n", Escape::Attribute).unwrap();
        let out = String::from_utf8(w.finish().unwrap()).unwrap();
        assert_eq!(out, "a&lt;b&amp;c&gt;\"|&quot;x&quot;&#10;");
    }

    #[test]
    fn test_reference_fallback() {
        let mut w = writer(OutputEncoding::Ascii);
        w.write_str("é\u{1F600}", Escape::Text).unwrap();
        let out = String::from_utf8(w.finish().unwrap()).unwrap();
        assert_eq!(out, "&#233;&#128512;");

        // Split surrogates reach the fallback with the register already clear
        let mut w = writer(OutputEncoding::Latin1);
        for unit in "é\u{1F600}".encode_utf16() {
            w.write_unit(unit, Escape::Text).unwrap();
        }
        assert_eq!(w.finish().unwrap(), b"\xE9&#128512;");

        let mut w = writer(OutputEncoding::Ascii);
        let err = w.write_str("é", Escape::None).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::Unmappable { code_point: 0xE9, .. }));
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let options = WriterOptions {
            buffer_size: 16,
            ..WriterOptions::default()
        };
        let mut w = PushWriter::new(Vec::new(), &options);
        w.write_bytes(&[b'x'; 40]).unwrap();
        assert_eq!(w.buffered(), 8);

        w.flush().unwrap();
        assert_eq!(w.buffered(), 0);
        w.flush().unwrap();
        assert_eq!(w.finish().unwrap().len(), 40);
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(OutputEncoding::from_name("utf-8"), Some(OutputEncoding::Utf8));
        assert_eq!(OutputEncoding::from_name("Latin1"), Some(OutputEncoding::Latin1));
        assert_eq!(OutputEncoding::from_name("koi8-r"), None);
        assert_eq!(OutputEncoding::Ascii.name(), "US-ASCII");
    }
}
