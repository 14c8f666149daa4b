//! XML payloads decoded into a [`Node`] tree.
//!
//! The mapping follows the usual dict-of-elements convention. Attributes
//! become `@name` fields and character data next to child elements becomes
//! `#text`. An element with only text is a scalar, an empty element is null,
//! and repeated sibling elements collapse into a sequence.

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use snafu::prelude::*;

use super::document::Node;
use crate::error::{DocumentError, XmlEmptySnafu, XmlSyntaxSnafu, XmlUnclosedSnafu};

/// An element whose end tag has not been read yet.
struct Frame {
    name: String,
    fields: IndexMap<String, Node>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self, DocumentError> {
        let mut fields = IndexMap::new();
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from).context(XmlSyntaxSnafu)?;
            let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
            let value = attr.unescape_value().context(XmlSyntaxSnafu)?;
            fields.insert(key, Node::scalar(value));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            fields,
            text: String::new(),
        })
    }

    fn close(mut self) -> (String, Node) {
        let node = match (self.fields.is_empty(), self.text.is_empty()) {
            (true, true) => Node::Null,
            (true, false) => Node::Scalar(self.text),
            (false, text_empty) => {
                if !text_empty {
                    self.fields.insert("#text".to_string(), Node::Scalar(self.text));
                }
                Node::Map(self.fields)
            }
        };
        (self.name, node)
    }
}

/// Add a child element, turning a repeated name into a sequence.
///
/// Elements never decode to a sequence on their own, so an existing `Seq`
/// under `name` always holds earlier siblings.
fn attach(fields: &mut IndexMap<String, Node>, name: String, node: Node) {
    match fields.get_mut(&name) {
        None => {
            fields.insert(name, node);
        }
        Some(Node::Seq(items)) => items.push(node),
        Some(existing) => {
            let first = std::mem::replace(existing, Node::Null);
            *existing = Node::Seq(vec![first, node]);
        }
    }
}

/// Decode an XML payload. The result is a map from the root element's name
/// to its value.
pub fn parse(bytes: &[u8]) -> Result<Node, DocumentError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut top = IndexMap::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context(XmlSyntaxSnafu)? {
            Event::Start(start) => stack.push(Frame::open(&start)?),
            Event::Empty(start) => {
                let (name, node) = Frame::open(&start)?.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.fields, name, node),
                    None => attach(&mut top, name, node),
                }
            }
            Event::End(_) => {
                // The reader rejects unmatched end tags, so a frame is open.
                if let Some(frame) = stack.pop() {
                    let (name, node) = frame.close();
                    match stack.last_mut() {
                        Some(parent) => attach(&mut parent.fields, name, node),
                        None => attach(&mut top, name, node),
                    }
                }
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text.unescape().context(XmlSyntaxSnafu)?);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(frame) = stack.pop() {
        return XmlUnclosedSnafu { element: frame.name }.fail();
    }
    ensure!(!top.is_empty(), XmlEmptySnafu);
    Ok(Node::Map(top))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(node: &'a Node, name: &str) -> &'a Node {
        &node.as_map().unwrap()[name]
    }

    #[test]
    fn test_single_and_repeated_children() {
        let root = parse(
            br#"<?xml version="1.0" encoding="UTF-8"?>
            <feed>
              <filing><serial>1</serial></filing>
              <batch>
                <filing><serial>2</serial></filing>
                <filing><serial>3</serial></filing>
              </batch>
            </feed>"#,
        )
        .unwrap();
        let feed = field(&root, "feed");

        let single = field(feed, "filing");
        assert_eq!(field(single, "serial"), &Node::scalar("1"));

        let Node::Seq(filings) = field(field(feed, "batch"), "filing") else {
            panic!("repeated siblings should form a sequence");
        };
        assert_eq!(filings.len(), 2);
        assert_eq!(field(&filings[1], "serial"), &Node::scalar("3"));
    }

    #[test]
    fn test_attributes_text_and_empty_elements() {
        let root = parse(
            br#"<case number="77" status="live">mark &amp; sign<owner/><note></note></case>"#,
        )
        .unwrap();
        let case = field(&root, "case");

        assert_eq!(field(case, "@number"), &Node::scalar("77"));
        assert_eq!(field(case, "@status"), &Node::scalar("live"));
        assert_eq!(field(case, "#text"), &Node::scalar("mark & sign"));
        assert_eq!(field(case, "owner"), &Node::Null);
        assert_eq!(field(case, "note"), &Node::Null);
    }

    #[test]
    fn test_field_order_follows_document() {
        let root = parse(b"<r><z>1</z><a>2</a><m>3</m><a>4</a></r>").unwrap();
        let keys: Vec<_> = field(&root, "r").as_map().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_cdata_is_text() {
        let root = parse(b"<r><mark><![CDATA[A<B>]]></mark></r>").unwrap();
        assert_eq!(field(field(&root, "r"), "mark"), &Node::scalar("A<B>"));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(parse(b"<r><a>1</b></r>").is_err());
        assert!(parse(b"<r><a>1</a>").is_err());
        assert!(matches!(
            parse(b"<?xml version=\"1.0\"?>"),
            Err(DocumentError::XmlEmpty)
        ));
    }
}
