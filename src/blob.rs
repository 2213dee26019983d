//! Write-once byte containers that overflow from memory into temporary storage.
//!
//! A [`Blob`] is filled once, either through [`Blob::read_from`] or through its
//! [`std::io::Write`] implementation, and can then be read any number of times.
use crate::error::{Endpoint, XmlErrorKind, XmlResult, bail};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};

/// Default number of bytes kept in memory before a blob spills to disk.
pub const DEFAULT_MEMORY_THRESHOLD: usize = 64 * 1024;

const COPY_CHUNK: usize = 8 * 1024;

/// Options controlling how blobs are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobOptions {
    /// Blobs larger than this are moved to a temporary file.
    pub memory_threshold: usize,
}
impl Default for BlobOptions {
    fn default() -> Self {
        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

/// Lifecycle of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    /// Accepting content
    New,

    /// Filled by `read_from`, not read yet
    Loaded,

    /// Read at least once; immutable from here on
    Read,
}
impl BlobState {
    fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Loaded => "loaded",
            Self::Read => "read",
        }
    }
}

enum Storage {
    Memory(Vec<u8>),
    File(tempfile::NamedTempFile),
}

/// A byte container which keeps small payloads in memory and moves larger ones
/// to a named temporary file, transparently to readers. The file is removed
/// when the blob is dropped.
pub struct Blob {
    options: BlobOptions,
    state: Cell<BlobState>,
    storage: RefCell<Storage>,
    size: u64,
    written: bool,
}
impl Blob {
    /// Creates an empty blob in the `New` state.
    #[must_use]
    pub fn new(options: BlobOptions) -> Self {
        Self {
            options,
            state: Cell::new(BlobState::New),
            storage: RefCell::new(Storage::Memory(Vec::new())),
            size: 0,
            written: false,
        }
    }

    /// Creates a loaded blob holding the given bytes.
    ///
    /// # Errors
    /// Fails if the bytes exceed the memory threshold and the temporary file cannot be written.
    pub fn from_bytes(options: BlobOptions, bytes: &[u8]) -> XmlResult<Self> {
        let mut blob = Self::new(options);
        blob.read_from(&mut &bytes[..])?;
        Ok(blob)
    }

    /// Returns the current state of the blob.
    #[must_use]
    pub fn state(&self) -> BlobState {
        self.state.get()
    }

    /// Returns the number of bytes stored.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true if the content has been moved to backing storage.
    #[must_use]
    pub fn is_on_disk(&self) -> bool {
        matches!(*self.storage.borrow(), Storage::File(_))
    }

    /// Fills the blob from a reader, moving it from `New` to `Loaded`.
    ///
    /// # Errors
    /// Fails if the blob is not new, or if reading or spilling fails.
    /// The error names the failing side of the copy.
    pub fn read_from(&mut self, reader: &mut dyn Read) -> XmlResult<u64> {
        self.require_new("read_from")?;

        let mut chunk = [0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => bail!(XmlErrorKind::stream(Endpoint::Read, e)),
            };

            self.append(&chunk[..n])
                .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
            total += n as u64;
        }

        self.state.set(BlobState::Loaded);
        Ok(total)
    }

    /// Copies the content into a writer. Can be called any number of times.
    ///
    /// # Errors
    /// Fails if the blob is still new, or if the copy fails.
    /// The error names the failing side of the copy.
    pub fn write_to(&self, writer: &mut dyn Write) -> XmlResult<u64> {
        let mut reader = self.open()?;
        copy_attributed(&mut reader, writer)
    }

    /// Opens a reader positioned at the start of the content.
    ///
    /// # Errors
    /// Fails if the blob is still new, or the backing file cannot be rewound.
    pub fn open(&self) -> XmlResult<Box<dyn Read + '_>> {
        self.require_readable("open")?;
        self.state.set(BlobState::Read);

        if let Storage::File(file) = &*self.storage.borrow() {
            // A fresh handle has its own cursor, so readers do not disturb each other
            let file = file
                .reopen()
                .map_err(|e| XmlErrorKind::stream(Endpoint::Read, e))?;
            return Ok(Box::new(file.take(self.size)));
        }

        Ok(Box::new(MemoryReader {
            blob: self,
            position: 0,
        }))
    }

    /// Reads the whole content into a vector.
    ///
    /// # Errors
    /// Fails if the blob is still new, or reading the backing file fails.
    pub fn to_vec(&self) -> XmlResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    fn require_new(&self, operation: &'static str) -> XmlResult<()> {
        match self.state.get() {
            BlobState::New => Ok(()),
            state => bail!(XmlErrorKind::BlobState {
                state: state.name(),
                operation,
            }),
        }
    }

    fn require_readable(&self, operation: &'static str) -> XmlResult<()> {
        match self.state.get() {
            BlobState::New if !self.written => {
                bail!(XmlErrorKind::BlobState {
                    state: BlobState::New.name(),
                    operation,
                })
            }
            _ => Ok(()),
        }
    }

    fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let threshold = self.options.memory_threshold as u64;
        let storage = self.storage.get_mut();

        if let Storage::Memory(buffer) = &mut *storage {
            if self.size + bytes.len() as u64 <= threshold {
                buffer.extend_from_slice(bytes);
                self.size += bytes.len() as u64;
                return Ok(());
            }

            log::debug!(
                "blob exceeds {threshold} bytes; moving {} bytes to a temporary file",
                buffer.len()
            );
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(buffer)?;
            *storage = Storage::File(file);
        }

        if let Storage::File(file) = &mut *storage {
            file.write_all(bytes)?;
        }
        self.size += bytes.len() as u64;
        Ok(())
    }
}
impl Default for Blob {
    fn default() -> Self {
        Self::new(BlobOptions::default())
    }
}
impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("state", &self.state.get())
            .field("size", &self.size)
            .field("on_disk", &self.is_on_disk())
            .finish()
    }
}

/// Appends to a blob that is still `New`. Once loaded or read, writes are rejected.
impl Write for Blob {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.state.get() != BlobState::New {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("blob is {}; cannot write", self.state.get().name()),
            ));
        }

        self.written = true;
        self.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Storage::File(file) = self.storage.get_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

struct MemoryReader<'a> {
    blob: &'a Blob,
    position: usize,
}
impl Read for MemoryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let storage = self.blob.storage.borrow();
        let Storage::Memory(bytes) = &*storage else {
            return Ok(0);
        };

        let remaining = &bytes[self.position.min(bytes.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Copies everything from `reader` into `writer`, attributing failures to the side that raised them.
///
/// # Errors
/// Returns a [`XmlErrorKind::Stream`] error naming the failing endpoint.
pub fn copy_attributed(reader: &mut dyn Read, writer: &mut dyn Write) -> XmlResult<u64> {
    let mut chunk = [0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => bail!(XmlErrorKind::stream(Endpoint::Read, e)),
        };

        writer
            .write_all(&chunk[..n])
            .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
        total += n as u64;
    }

    writer
        .flush()
        .map_err(|e| XmlErrorKind::stream(Endpoint::Write, e))?;
    Ok(total)
}

/// Something that can produce its bytes on demand, and may know its size up front.
pub trait ByteSource {
    /// The size in bytes, if it can be reported without reading the content.
    fn known_size(&self) -> Option<u64>;

    /// Opens a reader over the content.
    ///
    /// # Errors
    /// Fails if the content cannot be resolved or opened.
    fn open_bytes(&self) -> XmlResult<Box<dyn Read + '_>>;
}
impl ByteSource for Blob {
    fn known_size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn open_bytes(&self) -> XmlResult<Box<dyn Read + '_>> {
        self.open()
    }
}
impl ByteSource for [u8] {
    fn known_size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn open_bytes(&self) -> XmlResult<Box<dyn Read + '_>> {
        Ok(Box::new(self))
    }
}

/// Returns true if the source holds more than `limit` bytes.
///
/// Uses the reported size when the source has one. Otherwise the content is
/// streamed into a counter that stops as soon as the limit is passed, so the
/// payload is never buffered just to answer the question.
///
/// # Errors
/// Fails if the source has to be read and reading fails.
pub fn is_larger_than(source: &(impl ByteSource + ?Sized), limit: u64) -> XmlResult<bool> {
    if let Some(size) = source.known_size() {
        return Ok(size > limit);
    }

    let mut counter = CappedCounter { count: 0, limit };
    let mut reader = source.open_bytes()?;
    match std::io::copy(&mut reader, &mut counter) {
        Ok(_) => Ok(false),
        Err(_) if counter.count > limit => Ok(true),
        Err(e) => bail!(XmlErrorKind::stream(Endpoint::Read, e)),
    }
}

/// A sink that counts bytes and fails once more than `limit` have been written.
struct CappedCounter {
    count: u64,
    limit: u64,
}
impl Write for CappedCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.count += buf.len() as u64;
        if self.count > self.limit {
            return Err(std::io::Error::other("size limit exceeded"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::cell::Cell;

    fn small() -> BlobOptions {
        BlobOptions {
            memory_threshold: 16,
        }
    }

    #[test]
    fn test_below_threshold_stays_in_memory() {
        let blob = Blob::from_bytes(small(), b"hello").unwrap();
        assert_eq!(blob.state(), BlobState::Loaded);
        assert!(!blob.is_on_disk());
        assert_eq!(blob.to_vec().unwrap(), b"hello");
        assert_eq!(blob.state(), BlobState::Read);
    }

    #[test]
    fn test_above_threshold_spills() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let blob = Blob::from_bytes(small(), &data).unwrap();
        assert!(blob.is_on_disk());
        assert_eq!(blob.size(), 1000);

        // Readable more than once
        assert_eq!(blob.to_vec().unwrap(), data);
        assert_eq!(blob.to_vec().unwrap(), data);
    }

    #[test]
    fn test_write_impl_then_read() {
        let mut blob = Blob::new(small());
        blob.write_all(b"0123456789").unwrap();
        blob.write_all(b"0123456789").unwrap();
        assert!(blob.is_on_disk());
        assert_eq!(blob.to_vec().unwrap(), b"01234567890123456789");

        // Immutable once read
        assert!(blob.write_all(b"x").is_err());
    }

    #[test]
    fn test_read_from_twice_fails() {
        let mut blob = Blob::from_bytes(small(), b"abc").unwrap();
        let err = blob.read_from(&mut &b"def"[..]).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::BlobState { .. }));
        assert_eq!(blob.to_vec().unwrap(), b"abc");
    }

    #[test]
    fn test_open_new_blob_fails() {
        let blob = Blob::default();
        assert!(blob.open().is_err());
    }

    struct FailingReader;
    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    struct FailingWriter;
    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_copy_failures_are_attributed() {
        let mut blob = Blob::default();
        let err = blob.read_from(&mut FailingReader).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Resource);
        assert!(matches!(
            err.kind,
            XmlErrorKind::Stream {
                endpoint: Endpoint::Read,
                ..
            }
        ));

        let blob = Blob::from_bytes(small(), b"abc").unwrap();
        let err = blob.write_to(&mut FailingWriter).unwrap_err();
        match err.kind {
            XmlErrorKind::Stream { endpoint, source } => {
                assert_eq!(endpoint, Endpoint::Write);
                assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// A source that reports its size, and records whether it was ever opened.
    struct Sized50 {
        opened: Cell<bool>,
        report_size: bool,
    }
    impl ByteSource for Sized50 {
        fn known_size(&self) -> Option<u64> {
            self.report_size.then_some(50)
        }

        fn open_bytes(&self) -> XmlResult<Box<dyn Read + '_>> {
            self.opened.set(true);
            Ok(Box::new(std::io::repeat(7).take(50)))
        }
    }

    #[test]
    fn test_is_larger_than_uses_known_size() {
        let source = Sized50 {
            opened: Cell::new(false),
            report_size: true,
        };
        assert!(!is_larger_than(&source, 100).unwrap());
        assert!(!source.opened.get());
    }

    #[test]
    fn test_is_larger_than_counts_when_size_unknown() {
        let source = Sized50 {
            opened: Cell::new(false),
            report_size: false,
        };
        assert!(!is_larger_than(&source, 100).unwrap());
        assert!(is_larger_than(&source, 10).unwrap());
        assert!(source.opened.get());
    }

    #[test]
    fn test_is_larger_than_stops_early() {
        struct Endless;
        impl ByteSource for Endless {
            fn known_size(&self) -> Option<u64> {
                None
            }

            fn open_bytes(&self) -> XmlResult<Box<dyn Read + '_>> {
                Ok(Box::new(std::io::repeat(0)))
            }
        }

        assert!(is_larger_than(&Endless, 1024).unwrap());
    }
}
