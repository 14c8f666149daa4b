//! The raw nested document of one archive.
//!
//! Documents deserialize straight into a [`Node`] tree. Field order is
//! preserved, and numbers and booleans keep their textual form so every
//! non-date column stays text across archives.

use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use snafu::prelude::*;
use std::fmt;

use crate::config::DocumentFormat;
use crate::error::{DocumentError, JsonSyntaxSnafu};

/// One value in a raw document.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Scalar(String),
    Map(IndexMap<String, Node>),
    Seq(Vec<Node>),
}

impl Node {
    /// Convenience constructor for scalar leaves.
    pub fn scalar(value: impl Into<String>) -> Self {
        Node::Scalar(value.into())
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Node>> {
        match self {
            Node::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// The whole document fetched for one archive.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub root: Node,
}

impl RawDocument {
    pub fn new(root: Node) -> Self {
        Self { root }
    }

    /// Decode a payload in the given format.
    pub fn decode(format: DocumentFormat, bytes: &[u8]) -> Result<Self, DocumentError> {
        match format {
            DocumentFormat::Xml => Self::from_xml_slice(bytes),
            DocumentFormat::Json => Self::from_json_slice(bytes).context(JsonSyntaxSnafu),
        }
    }

    /// Decode a JSON document.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let root: Node = serde_json::from_slice(bytes)?;
        Ok(Self { root })
    }

    /// Decode an XML document. The root is a map holding the top element.
    pub fn from_xml_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        super::xml::parse(bytes).map(Self::new)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a document value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Node, D::Error>
    where
        D: Deserializer<'de>,
    {
        Node::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string()))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
        Ok(Node::Scalar(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Node, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Node::Seq(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Node, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut fields = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, Node>()? {
            fields.insert(key, value);
        }
        Ok(Node::Map(fields))
    }
}
