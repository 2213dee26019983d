//! Pulls events from a source into a [`Document`], one at a time.
//!
//! The builder keeps a stack of the nodes whose end has not been seen yet.
//! Every event either adds a node under the innermost open node, or closes it.
use crate::{
    document::Document,
    error::{XmlErrorKind, XmlResult, bail},
    event::{XmlEvent, XmlSink},
    filter::BoxedSource,
    node::{BuildState, Element, NodeId, NodeKind, ProcessingInstruction},
};

/// The source side of a document that is still being built.
pub(crate) struct Builder<'src> {
    source: BoxedSource<'src>,

    /// Nodes under construction, outermost first. Starts with the document node.
    open: Vec<NodeId>,

    /// Set once the source is exhausted; the builder is then released.
    finished: bool,
}
impl<'src> Builder<'src> {
    pub(crate) fn new(source: BoxedSource<'src>) -> Self {
        Self {
            source,
            open: vec![NodeId::DOCUMENT],
            finished: false,
        }
    }
}

impl<'src> Document<'src> {
    /// Runs `f` against the builder, handling release and poisoning.
    ///
    /// Returns `None` if there is no builder left.
    fn with_builder<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut Builder<'src>) -> XmlResult<T>,
    ) -> XmlResult<Option<T>> {
        if let Some(err) = &self.poison {
            return Err(err.clone());
        }
        let Some(mut builder) = self.builder.take() else {
            return Ok(None);
        };

        match f(self, &mut builder) {
            Ok(value) => {
                if builder.finished {
                    log::debug!("source exhausted after {} events", self.advances);
                    builder.source.close();
                } else {
                    self.builder = Some(builder);
                }
                Ok(Some(value))
            }

            Err(err) => {
                let building = builder
                    .open
                    .last()
                    .and_then(|id| self.name(*id))
                    .map(ToString::to_string);
                let err = match building {
                    Some(name) => err.while_building(name),
                    None => err,
                };

                log::debug!("tree building failed: {err}");
                builder.source.close();
                self.poison = Some(err.clone());
                Err(err)
            }
        }
    }

    fn pull(&mut self, builder: &mut Builder<'src>) -> XmlResult<Option<XmlEvent>> {
        let event = builder.source.next_event()?;
        if let Some(event) = &event {
            self.advances += 1;
            log::trace!("advance {}: {}", self.advances, event.label());
        }
        Ok(event)
    }

    /// Pulls one event into the tree.
    ///
    /// Returns false if there was nothing left to pull.
    pub(crate) fn advance(&mut self) -> XmlResult<bool> {
        self.with_builder(|doc, builder| doc.apply_next(builder))
            .map(|stepped| stepped.is_some())
    }

    fn apply_next(&mut self, builder: &mut Builder<'src>) -> XmlResult<()> {
        let Some(event) = self.pull(builder)? else {
            return self.finish(builder);
        };
        let Some(&parent) = builder.open.last() else {
            bail!(XmlErrorKind::Structural(format!(
                "{} after the end of the document",
                event.label()
            )));
        };

        let kind = match event {
            XmlEvent::StartDocument => return Ok(()),
            XmlEvent::EndDocument => return self.finish(builder),

            XmlEvent::StartElement {
                name,
                namespaces,
                attributes,
            } => {
                let id = self.alloc_building(NodeKind::Element(Element {
                    name,
                    namespaces,
                    attributes,
                }));
                self.link_last(parent, id);
                builder.open.push(id);
                return Ok(());
            }

            XmlEvent::EndElement => {
                if builder.open.len() <= 1 {
                    bail!(XmlErrorKind::UnbalancedEnd);
                }
                builder.open.pop();
                self.node_mut(parent).state = BuildState::Complete;
                return Ok(());
            }

            XmlEvent::Characters(content) => NodeKind::Text(content),
            XmlEvent::Comment(text) => NodeKind::Comment(text),
            XmlEvent::ProcessingInstruction { target, data } => {
                NodeKind::ProcessingInstruction(ProcessingInstruction { target, data })
            }
            XmlEvent::DocType(text) => NodeKind::DocType(text),
        };

        let id = self.create_node(kind)?;
        self.link_last(parent, id);
        Ok(())
    }

    /// The source has ended, by event or by exhaustion.
    fn finish(&mut self, builder: &mut Builder<'src>) -> XmlResult<()> {
        if let Some(&open) = builder.open.get(1) {
            let name = self.name(open).map(ToString::to_string).unwrap_or_default();
            bail!(XmlErrorKind::UnclosedTag(name));
        }

        builder.open.clear();
        builder.finished = true;
        self.node_mut(NodeId::DOCUMENT).state = BuildState::Complete;
        Ok(())
    }

    /// Fast-forwards the source past the end of an incomplete node, without
    /// building anything, and marks the unfinished nodes as discarded.
    pub(crate) fn skip_subtree(&mut self, id: NodeId) -> XmlResult<()> {
        self.with_builder(|doc, builder| {
            let position = doc.open_position(builder, id)?;
            let mut depth = builder.open.len() - position;
            let mut skipped = 0usize;

            while depth > 0 {
                let Some(event) = doc.pull(builder)? else {
                    let name = doc.name(id).map(ToString::to_string).unwrap_or_default();
                    bail!(XmlErrorKind::UnclosedTag(name));
                };
                match event {
                    XmlEvent::StartElement { .. } => depth += 1,
                    XmlEvent::EndElement => depth -= 1,
                    XmlEvent::StartDocument | XmlEvent::EndDocument => {
                        bail!(XmlErrorKind::Structural(format!(
                            "{} inside an element",
                            event.label()
                        )));
                    }
                    _ => {}
                }
                skipped += 1;
            }

            log::debug!("discarded {skipped} events");
            doc.close_open_from(builder, position);
            Ok(())
        })?;
        Ok(())
    }

    /// Pushes the unbuilt remainder of an incomplete node straight from the
    /// source into a sink, up to but not including the node's own end.
    ///
    /// The node must be the innermost node under construction. It ends up
    /// [`BuildState::Discarded`], since the consumed children are not in the tree.
    pub(crate) fn pump_rest(&mut self, id: NodeId, sink: &mut dyn XmlSink) -> XmlResult<()> {
        self.with_builder(|doc, builder| {
            let position = doc.open_position(builder, id)?;
            if position + 1 != builder.open.len() {
                bail!(XmlErrorKind::Structural(
                    "only the innermost node under construction can be consumed".into()
                ));
            }

            let mut depth = 0usize;
            loop {
                let Some(event) = doc.pull(builder)? else {
                    if id == NodeId::DOCUMENT {
                        builder.finished = true;
                        break;
                    }
                    let name = doc.name(id).map(ToString::to_string).unwrap_or_default();
                    bail!(XmlErrorKind::UnclosedTag(name));
                };

                match &event {
                    XmlEvent::StartElement { .. } => depth += 1,
                    XmlEvent::EndElement if depth == 0 => {
                        if id == NodeId::DOCUMENT {
                            bail!(XmlErrorKind::UnbalancedEnd);
                        }
                        break;
                    }
                    XmlEvent::EndElement => depth -= 1,
                    XmlEvent::EndDocument if id == NodeId::DOCUMENT => {
                        if depth > 0 {
                            bail!(XmlErrorKind::UnclosedTag("(consumed element)".into()));
                        }
                        builder.finished = true;
                        break;
                    }
                    XmlEvent::StartDocument if id == NodeId::DOCUMENT && depth == 0 => continue,
                    XmlEvent::StartDocument | XmlEvent::EndDocument => {
                        bail!(XmlErrorKind::Structural(format!(
                            "{} inside an element",
                            event.label()
                        )));
                    }
                    _ => {}
                }
                event.dispatch(sink)?;
            }

            doc.close_open_from(builder, position);
            Ok(())
        })?;
        Ok(())
    }

    fn open_position(&self, builder: &Builder<'src>, id: NodeId) -> XmlResult<usize> {
        match builder.open.iter().position(|open| *open == id) {
            Some(position) => Ok(position),
            None => bail!(XmlErrorKind::Structural(format!(
                "{} is not under construction",
                self.kind(id).label()
            ))),
        }
    }

    fn close_open_from(&mut self, builder: &mut Builder<'src>, position: usize) {
        for id in builder.open.drain(position..) {
            self.node_mut(id).state = BuildState::Discarded;
        }
    }
}
