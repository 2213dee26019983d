//! A deferred XML object model.
//!
//! A [`Document`] is built from an [`event::EventSource`] one event at a time, only as far as
//! navigation requires. Reading the second child of an element pulls just enough events to
//! finish the first one; discarding an unfinished node fast-forwards the source past it
//! without building anything.
//!
//! Events flow through stackable filters on both sides:
//! - [`filter::SourceFilter`]s wrap the source a tree is built from
//! - [`filter::SinkFilter`]s wrap the sink a tree is serialized into
//!
//! Binary content can travel out of band as XOP attachments, and whole trees can be written to,
//! or read back from, MTOM multipart messages. See [`xop`] and [`mime`].
//!
//! ```rust
//! use xmlom::Document;
//!
//! let mut doc = Document::parse_str("<list><a/><b>text</b></list>");
//! let list = doc.document_element().unwrap().unwrap();
//! let b = doc.nth_child(list, 1).unwrap().unwrap();
//! assert_eq!(doc.text(b).unwrap(), "text");
//!
//! // Navigation never needed the end of the list
//! assert!(!doc.is_complete(list));
//! assert_eq!(doc.to_xml().unwrap(), "<list><a/><b>text</b></list>");
//! ```
#![warn(missing_docs)]

pub mod attachments;
pub mod blob;
pub mod error;
pub mod event;
pub mod filter;
pub mod mime;
pub mod node;
pub mod serializer;
pub mod source;
pub mod writer;
pub mod xop;

mod builder;
mod document;

pub use document::Document;
pub use error::{XmlError, XmlErrorKind, XmlResult};
pub use node::*;
