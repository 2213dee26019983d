//! The event contract shared by parsers, filters, the tree builder and writers.
//!
//! An [`EventSource`] is pulled one [`XmlEvent`] at a time, in document order.
//! An [`XmlSink`] is pushed the same events as callbacks. Start and end
//! element events are always balanced.
use crate::{
    error::{XmlErrorKind, XmlResult, bail},
    node::{Attribute, CharacterContent, NamespaceDecl, QName},
};

/// One lexical event of an XML document.
#[derive(Debug, Clone)]
pub enum XmlEvent {
    /// The document begins.
    StartDocument,

    /// The document ends.
    EndDocument,

    /// An element begins; its namespace declarations and attributes travel with it.
    StartElement {
        /// The element name, with its namespace resolved.
        name: QName,

        /// Declarations made on this element.
        namespaces: Vec<NamespaceDecl>,

        /// The element's attributes.
        attributes: Vec<Attribute>,
    },

    /// The most recently started element ends.
    EndElement,

    /// Character or binary content.
    Characters(CharacterContent),

    /// A comment.
    Comment(String),

    /// A processing instruction.
    ProcessingInstruction {
        /// The target.
        target: String,

        /// The content following the target.
        data: Option<String>,
    },

    /// A document type declaration, verbatim.
    DocType(String),
}
impl XmlEvent {
    /// Pushes this event into a sink as the matching callbacks.
    ///
    /// # Errors
    /// Propagates errors from the sink unchanged.
    pub fn dispatch<K: XmlSink + ?Sized>(&self, sink: &mut K) -> XmlResult<()> {
        match self {
            Self::StartDocument => sink.start_document(),
            Self::EndDocument => sink.end_document(),
            Self::StartElement {
                name,
                namespaces,
                attributes,
            } => {
                sink.start_element(name)?;
                for ns in namespaces {
                    sink.namespace_declaration(ns.prefix.as_deref(), &ns.uri)?;
                }
                for attr in attributes {
                    sink.attribute(&attr.name, &attr.value)?;
                }
                Ok(())
            }
            Self::EndElement => sink.end_element(),
            Self::Characters(content) => sink.characters(content),
            Self::Comment(text) => sink.comment(text),
            Self::ProcessingInstruction { target, data } => {
                sink.processing_instruction(target, data.as_deref())
            }
            Self::DocType(text) => sink.doctype(text),
        }
    }

    /// Short label for the event, used in messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartDocument => "start of document",
            Self::EndDocument => "end of document",
            Self::StartElement { .. } => "start element",
            Self::EndElement => "end element",
            Self::Characters(_) => "characters",
            Self::Comment(_) => "comment",
            Self::ProcessingInstruction { .. } => "processing instruction",
            Self::DocType(_) => "doctype",
        }
    }
}

/// A pull source of events, in document order.
pub trait EventSource {
    /// Advances to the next event. Returns `None` once the source is exhausted.
    ///
    /// # Errors
    /// Malformed input is reported as a structural error.
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>>;

    /// Releases the source. Calling it again has no effect.
    fn close(&mut self) {}

    /// Pushes every remaining event into a sink, then closes the source.
    ///
    /// # Errors
    /// Propagates errors from either end unchanged.
    fn drive(&mut self, sink: &mut dyn XmlSink) -> XmlResult<()> {
        while let Some(event) = self.next_event()? {
            event.dispatch(sink)?;
        }
        self.close();
        Ok(())
    }
}
impl<S: EventSource + ?Sized> EventSource for &mut S {
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
        (**self).next_event()
    }

    fn close(&mut self) {
        (**self).close();
    }
}
impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
        (**self).next_event()
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// A push consumer of events.
///
/// Namespace declarations and attributes follow the `start_element` they belong to,
/// before any content of that element.
pub trait XmlSink {
    /// The document begins.
    ///
    /// # Errors
    /// Implementation defined.
    fn start_document(&mut self) -> XmlResult<()>;

    /// The document ends.
    ///
    /// # Errors
    /// Implementation defined.
    fn end_document(&mut self) -> XmlResult<()>;

    /// An element begins.
    ///
    /// # Errors
    /// Implementation defined.
    fn start_element(&mut self, name: &QName) -> XmlResult<()>;

    /// A namespace is declared on the current element.
    ///
    /// # Errors
    /// Implementation defined.
    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()>;

    /// An attribute of the current element.
    ///
    /// # Errors
    /// Implementation defined.
    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()>;

    /// The current element ends.
    ///
    /// # Errors
    /// Implementation defined.
    fn end_element(&mut self) -> XmlResult<()>;

    /// Character or binary content.
    ///
    /// # Errors
    /// Implementation defined.
    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()>;

    /// A comment.
    ///
    /// # Errors
    /// Implementation defined.
    fn comment(&mut self, text: &str) -> XmlResult<()>;

    /// A processing instruction.
    ///
    /// # Errors
    /// Implementation defined.
    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()>;

    /// A document type declaration.
    ///
    /// # Errors
    /// Implementation defined.
    fn doctype(&mut self, text: &str) -> XmlResult<()>;
}
impl<K: XmlSink + ?Sized> XmlSink for Box<K> {
    fn start_document(&mut self) -> XmlResult<()> {
        (**self).start_document()
    }
    fn end_document(&mut self) -> XmlResult<()> {
        (**self).end_document()
    }
    fn start_element(&mut self, name: &QName) -> XmlResult<()> {
        (**self).start_element(name)
    }
    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()> {
        (**self).namespace_declaration(prefix, uri)
    }
    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()> {
        (**self).attribute(name, value)
    }
    fn end_element(&mut self) -> XmlResult<()> {
        (**self).end_element()
    }
    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()> {
        (**self).characters(content)
    }
    fn comment(&mut self, text: &str) -> XmlResult<()> {
        (**self).comment(text)
    }
    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        (**self).processing_instruction(target, data)
    }
    fn doctype(&mut self, text: &str) -> XmlResult<()> {
        (**self).doctype(text)
    }
}
impl<K: XmlSink + ?Sized> XmlSink for &mut K {
    fn start_document(&mut self) -> XmlResult<()> {
        (**self).start_document()
    }
    fn end_document(&mut self) -> XmlResult<()> {
        (**self).end_document()
    }
    fn start_element(&mut self, name: &QName) -> XmlResult<()> {
        (**self).start_element(name)
    }
    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()> {
        (**self).namespace_declaration(prefix, uri)
    }
    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()> {
        (**self).attribute(name, value)
    }
    fn end_element(&mut self) -> XmlResult<()> {
        (**self).end_element()
    }
    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()> {
        (**self).characters(content)
    }
    fn comment(&mut self, text: &str) -> XmlResult<()> {
        (**self).comment(text)
    }
    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        (**self).processing_instruction(target, data)
    }
    fn doctype(&mut self, text: &str) -> XmlResult<()> {
        (**self).doctype(text)
    }
}

/// A sink that records events, regrouping attributes and declarations into their start event.
///
/// Rejects attributes that arrive outside a start tag, and end events with no open element.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Vec<XmlEvent>,
    open_start: bool,
    depth: usize,
}
impl EventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events.
    #[must_use]
    pub fn events(&self) -> &[XmlEvent] {
        &self.events
    }

    /// Consumes the recorder, returning the events.
    #[must_use]
    pub fn into_events(self) -> Vec<XmlEvent> {
        self.events
    }

    /// Turns the recorded events into a source that replays them.
    #[must_use]
    pub fn into_source(self) -> ReplaySource {
        ReplaySource::new(self.events)
    }

    fn push(&mut self, event: XmlEvent) {
        self.open_start = matches!(event, XmlEvent::StartElement { .. });
        self.events.push(event);
    }

    fn current_start(&mut self) -> XmlResult<(&mut Vec<NamespaceDecl>, &mut Vec<Attribute>)> {
        if self.open_start {
            if let Some(XmlEvent::StartElement {
                namespaces,
                attributes,
                ..
            }) = self.events.last_mut()
            {
                return Ok((namespaces, attributes));
            }
        }

        bail!(XmlErrorKind::Structural(
            "attribute or namespace declaration outside of a start tag".to_string()
        ))
    }
}
impl XmlSink for EventRecorder {
    fn start_document(&mut self) -> XmlResult<()> {
        self.push(XmlEvent::StartDocument);
        Ok(())
    }

    fn end_document(&mut self) -> XmlResult<()> {
        self.push(XmlEvent::EndDocument);
        Ok(())
    }

    fn start_element(&mut self, name: &QName) -> XmlResult<()> {
        self.depth += 1;
        self.push(XmlEvent::StartElement {
            name: name.clone(),
            namespaces: vec![],
            attributes: vec![],
        });
        Ok(())
    }

    fn namespace_declaration(&mut self, prefix: Option<&str>, uri: &str) -> XmlResult<()> {
        let (namespaces, _) = self.current_start()?;
        namespaces.push(NamespaceDecl::new(prefix, uri));
        Ok(())
    }

    fn attribute(&mut self, name: &QName, value: &str) -> XmlResult<()> {
        let (_, attributes) = self.current_start()?;
        attributes.push(Attribute::new(name.clone(), value));
        Ok(())
    }

    fn end_element(&mut self) -> XmlResult<()> {
        if self.depth == 0 {
            bail!(XmlErrorKind::UnbalancedEnd);
        }
        self.depth -= 1;
        self.push(XmlEvent::EndElement);
        Ok(())
    }

    fn characters(&mut self, content: &CharacterContent) -> XmlResult<()> {
        self.push(XmlEvent::Characters(content.clone()));
        Ok(())
    }

    fn comment(&mut self, text: &str) -> XmlResult<()> {
        self.push(XmlEvent::Comment(text.to_string()));
        Ok(())
    }

    fn processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        self.push(XmlEvent::ProcessingInstruction {
            target: target.to_string(),
            data: data.map(str::to_string),
        });
        Ok(())
    }

    fn doctype(&mut self, text: &str) -> XmlResult<()> {
        self.push(XmlEvent::DocType(text.to_string()));
        Ok(())
    }
}

/// A source that replays a fixed list of events.
#[derive(Debug, Default)]
pub struct ReplaySource {
    events: std::collections::VecDeque<XmlEvent>,
}
impl ReplaySource {
    /// Creates a source over the given events.
    #[must_use]
    pub fn new(events: Vec<XmlEvent>) -> Self {
        Self {
            events: events.into(),
        }
    }

    /// Returns the number of events not yet pulled.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}
impl EventSource for ReplaySource {
    fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
        Ok(self.events.pop_front())
    }

    fn close(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    /// Counts how many events were pulled through it.
    pub(crate) struct Counting<S> {
        pub inner: S,
        pub count: Rc<Cell<usize>>,
    }
    impl<S: EventSource> EventSource for Counting<S> {
        fn next_event(&mut self) -> XmlResult<Option<XmlEvent>> {
            let event = self.inner.next_event()?;
            if event.is_some() {
                self.count.set(self.count.get() + 1);
            }
            Ok(event)
        }
    }

    pub(crate) fn start(name: &str) -> XmlEvent {
        XmlEvent::StartElement {
            name: QName::local(name),
            namespaces: vec![],
            attributes: vec![],
        }
    }

    #[test]
    fn test_recorder_groups_attributes() {
        let mut recorder = EventRecorder::new();
        recorder.start_element(&QName::local("a")).unwrap();
        recorder.namespace_declaration(Some("x"), "urn:x").unwrap();
        recorder.attribute(&QName::local("id"), "1").unwrap();
        recorder.end_element().unwrap();

        let events = recorder.into_events();
        assert_eq!(events.len(), 2);
        let XmlEvent::StartElement {
            namespaces,
            attributes,
            ..
        } = &events[0]
        else {
            panic!("expected start element");
        };
        assert_eq!(namespaces.len(), 1);
        assert_eq!(attributes[0].value, "1");
    }

    #[test]
    fn test_recorder_rejects_stray_attribute() {
        let mut recorder = EventRecorder::new();
        recorder.start_element(&QName::local("a")).unwrap();
        recorder.characters(&"text".into()).unwrap();
        assert!(recorder.attribute(&QName::local("id"), "1").is_err());
    }

    #[test]
    fn test_recorder_rejects_unbalanced_end() {
        let mut recorder = EventRecorder::new();
        let err = recorder.end_element().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::UnbalancedEnd));
    }

    #[test]
    fn test_drive_replays_in_order() {
        let mut source = ReplaySource::new(vec![
            XmlEvent::StartDocument,
            start("a"),
            XmlEvent::Comment("c".into()),
            XmlEvent::EndElement,
            XmlEvent::EndDocument,
        ]);

        let mut recorder = EventRecorder::new();
        source.drive(&mut recorder).unwrap();

        let labels: Vec<_> = recorder.events().iter().map(XmlEvent::label).collect();
        assert_eq!(
            labels,
            vec![
                "start of document",
                "start element",
                "comment",
                "end element",
                "end of document"
            ]
        );
        assert_eq!(source.remaining(), 0);
    }
}
