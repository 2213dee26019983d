use std::{io::Cursor, rc::Rc};
use xmlom::{
    BinaryContent, Document, NodeId,
    attachments::AttachmentProvider,
    blob::BlobOptions,
    filter::FilterChain,
    mime::{MtomMessage, write_mtom},
    serializer::XmlWriter,
    xop::{OptimizationPolicy, XOP_NAMESPACE, XopConfig, XopDecoding, XopEncoding},
};

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// `<doc><part>..</part>...</doc>` with one binary payload per part.
fn document_with(payloads: &[Vec<u8>]) -> Document<'static> {
    let mut doc = Document::new();
    let root = doc.create_element("doc");
    doc.append_child(NodeId::DOCUMENT, root).unwrap();
    for bytes in payloads {
        let part = doc.create_element("part");
        let data = doc.create_binary(BinaryContent::from_bytes(bytes).unwrap());
        doc.append_child(root, part).unwrap();
        doc.append_child(part, data).unwrap();
    }
    doc
}

fn binaries(doc: &mut Document) -> Vec<Vec<u8>> {
    let root = doc.document_element().unwrap().unwrap();
    let mut found = vec![];
    for part in doc.children(root).unwrap() {
        let data = doc.first_child(part).unwrap().unwrap();
        let content = doc.kind(data).as_text().expect("expected a text node");
        found.push(content.to_bytes().unwrap());
    }
    found
}

#[test]
fn test_mtom_round_trip() {
    let payloads = vec![payload(10, 1), payload(5000, 2), payload(70_000, 3)];
    let mut doc = document_with(&payloads);

    let mut body = Vec::new();
    let content_type = write_mtom(&mut doc, &mut body, XopConfig::default()).unwrap();
    assert!(content_type.starts_with("multipart/related;"));

    let message = MtomMessage::parse(&content_type, Cursor::new(body), BlobOptions::default())
        .unwrap();
    let xml = message.root_xml().unwrap();
    assert_eq!(xml.matches(XOP_NAMESPACE).count(), 2);

    let mut decoded = message.document(&xml);
    assert_eq!(binaries(&mut decoded), payloads);
}

#[test]
fn test_mtom_reads_only_what_is_needed() {
    let payloads = vec![payload(2000, 1), payload(2000, 2), payload(2000, 3)];
    let mut doc = document_with(&payloads);

    let mut body = Vec::new();
    let config = XopConfig::with_policy(OptimizationPolicy::Always);
    let content_type = write_mtom(&mut doc, &mut body, config).unwrap();

    let message = MtomMessage::parse(&content_type, Cursor::new(body), BlobOptions::default())
        .unwrap();
    let xml = message.root_xml().unwrap();
    let mut decoded = message.document(&xml);

    let root = decoded.document_element().unwrap().unwrap();
    let first = decoded.first_child(root).unwrap().unwrap();
    let data = decoded.first_child(first).unwrap().unwrap();
    let binary = decoded.kind(data).as_text().unwrap().as_binary().unwrap().clone();

    let attachments = message.attachments();
    assert!(attachments.loaded_ids().is_empty());
    assert_eq!(binary.to_vec().unwrap(), payloads[0]);
    assert_eq!(attachments.loaded_ids().len(), 1);
}

#[test]
fn test_filters_round_trip() {
    let payloads = vec![payload(100, 7), payload(4096, 8)];
    let mut doc = document_with(&payloads);

    let encoding = XopEncoding::new(XopConfig::with_policy(OptimizationPolicy::Threshold(512)));
    let chain = FilterChain::new().with_sink_filter(encoding.clone());
    let mut writer = XmlWriter::new(Vec::new());
    doc.serialize_with(NodeId::DOCUMENT, &mut writer, &chain)
        .unwrap();
    let xml = String::from_utf8(writer.finish().unwrap()).unwrap();

    let attachments = encoding.attachments();
    assert_eq!(attachments.len(), 1);

    let provider: Rc<dyn AttachmentProvider> = attachments;
    let chain = FilterChain::new().with_source_filter(XopDecoding::new(provider));
    let mut decoded = Document::parse_str_with(&xml, &chain);
    assert_eq!(binaries(&mut decoded), payloads);
}

#[test]
fn test_inline_payloads_read_back_as_bytes() {
    let payloads = vec![payload(3, 4), payload(1500, 5)];
    let mut doc = document_with(&payloads);

    let mut body = Vec::new();
    let config = XopConfig::with_policy(OptimizationPolicy::Never);
    let content_type = write_mtom(&mut doc, &mut body, config).unwrap();

    let message = MtomMessage::parse(&content_type, Cursor::new(body), BlobOptions::default())
        .unwrap();
    let xml = message.root_xml().unwrap();
    assert_eq!(xml.matches(XOP_NAMESPACE).count(), 0);

    let mut decoded = message.document(&xml);
    assert_eq!(binaries(&mut decoded), payloads);
}
