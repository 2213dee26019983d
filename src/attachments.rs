//! Attachment providers: where binary parts referenced by content-ID live.
use crate::{
    blob::{Blob, BlobOptions},
    error::{XmlErrorKind, XmlResult, bail},
};
use std::{cell::RefCell, collections::HashMap, rc::Rc};

/// Resolves content-IDs to binary payloads.
///
/// Resolution may block on I/O the first time an ID is requested, but repeated
/// requests for the same ID must return the same content.
pub trait AttachmentProvider {
    /// Returns true if the payload for this ID is already available without further I/O.
    fn is_loaded(&self, content_id: &str) -> bool;

    /// Returns the payload for this ID.
    ///
    /// # Errors
    /// Returns [`XmlErrorKind::UnknownContentId`] if no part carries this ID,
    /// or a resource error if loading it fails.
    fn payload(&self, content_id: &str) -> XmlResult<Rc<Blob>>;
}

/// An in-memory set of attachments, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryAttachments {
    parts: RefCell<Vec<(String, Rc<Blob>)>>,
    index: RefCell<HashMap<String, usize>>,
}
impl MemoryAttachments {
    /// Creates an empty attachment set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a payload under the given content-ID, replacing any previous one.
    pub fn insert(&self, content_id: impl Into<String>, blob: Rc<Blob>) {
        let content_id = content_id.into();
        let mut index = self.index.borrow_mut();
        let mut parts = self.parts.borrow_mut();

        if let Some(&i) = index.get(&content_id) {
            parts[i].1 = blob;
        } else {
            index.insert(content_id.clone(), parts.len());
            parts.push((content_id, blob));
        }
    }

    /// Adds a payload built from raw bytes.
    ///
    /// # Errors
    /// Fails if the bytes cannot be stored.
    pub fn insert_bytes(&self, content_id: impl Into<String>, bytes: &[u8]) -> XmlResult<()> {
        let blob = Blob::from_bytes(BlobOptions::default(), bytes)?;
        self.insert(content_id, Rc::new(blob));
        Ok(())
    }

    /// Returns the content-IDs, in insertion order.
    #[must_use]
    pub fn content_ids(&self) -> Vec<String> {
        self.parts.borrow().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Returns every attachment, in insertion order.
    #[must_use]
    pub fn parts(&self) -> Vec<(String, Rc<Blob>)> {
        self.parts.borrow().clone()
    }

    /// Returns the number of attachments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.borrow().len()
    }

    /// Returns true if there are no attachments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl AttachmentProvider for MemoryAttachments {
    fn is_loaded(&self, content_id: &str) -> bool {
        self.index.borrow().contains_key(content_id)
    }

    fn payload(&self, content_id: &str) -> XmlResult<Rc<Blob>> {
        let index = self.index.borrow();
        let Some(&i) = index.get(content_id) else {
            bail!(XmlErrorKind::UnknownContentId(content_id.to_string()));
        };
        Ok(self.parts.borrow()[i].1.clone())
    }
}
impl<P: AttachmentProvider + ?Sized> AttachmentProvider for Rc<P> {
    fn is_loaded(&self, content_id: &str) -> bool {
        (**self).is_loaded(content_id)
    }

    fn payload(&self, content_id: &str) -> XmlResult<Rc<Blob>> {
        (**self).payload(content_id)
    }
}
