//! Model manifest loading
//!
//! The manifest is a YAML mapping of model families to mappings of model ids:
//!
//! ```yaml
//! llama3.1:
//!   8b:
//!   70b:
//! phi3:
//!   mini:
//! ```
//!
//! Values under each id are accepted and ignored. Keys are passed verbatim to
//! the daemon's pull command as `family:id`; nothing is validated here.
//! A repeated key keeps its first position and its last value.

use crate::error::ManifestError;
use serde::de::{self, Deserialize, Deserializer, EnumAccess, IgnoredAny, VariantAccess, Visitor};
use serde::{Serialize, Serializer};
use serde_yaml::Value;
use std::fmt;
use std::path::Path;

/// A single pullable model, rendered as `family:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub family: String,
    pub id: String,
}

impl ModelRef {
    pub fn new(family: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            id: id.into(),
        }
    }

    /// Parse a qualified `family:id` name, splitting on the first colon
    pub fn parse(qualified: &str) -> Option<Self> {
        let (family, id) = qualified.split_once(':')?;
        if family.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(family, id))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.id)
    }
}

impl Serialize for ModelRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Family {
    name: String,
    ids: Vec<String>,
}

/// Parsed model manifest, in document order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    families: Vec<Family>,
}

impl Manifest {
    /// Read and parse the manifest file
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ManifestError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let root: Node = serde_yaml::from_str(content)?;

        let top = match root {
            Node::Null => return Ok(Self::default()),
            Node::Map(entries) => entries,
            Node::Other(found) => return Err(ManifestError::NotAMapping(found)),
        };

        let mut families = Vec::with_capacity(top.len());
        for (key, value) in top {
            let name = key_text(&key)?;
            let ids = match value {
                Node::Null => Vec::new(),
                Node::Map(models) => models
                    .iter()
                    .map(|(id, _)| key_text(id))
                    .collect::<Result<Vec<_>, _>>()?,
                Node::Other(found) => {
                    return Err(ManifestError::InvalidFamily {
                        family: name,
                        found,
                    });
                }
            };
            families.push(Family { name, ids });
        }

        Ok(Self { families })
    }

    /// Every model in family-then-id document order
    pub fn models(&self) -> impl Iterator<Item = ModelRef> + '_ {
        self.families.iter().flat_map(|family| {
            family
                .ids
                .iter()
                .map(|id| ModelRef::new(family.name.clone(), id.clone()))
        })
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.iter().map(|f| f.name.as_str())
    }

    pub fn contains(&self, model: &ModelRef) -> bool {
        self.families
            .iter()
            .any(|f| f.name == model.family && f.ids.iter().any(|id| *id == model.id))
    }

    /// Number of models (not families)
    pub fn len(&self) -> usize {
        self.families.iter().map(|f| f.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parsed YAML node. serde_yaml's `Mapping` rejects repeated keys, so maps
/// are collected here instead, with the last value winning.
#[derive(Debug)]
enum Node {
    Null,
    Map(Vec<(Value, Node)>),
    Other(&'static str),
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a YAML node")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Node, D::Error> {
        Node::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Node, E> {
        Ok(Node::Other("bool"))
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Node, E> {
        Ok(Node::Other("number"))
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Node, E> {
        Ok(Node::Other("number"))
    }

    fn visit_i128<E: de::Error>(self, _: i128) -> Result<Node, E> {
        Ok(Node::Other("number"))
    }

    fn visit_u128<E: de::Error>(self, _: u128) -> Result<Node, E> {
        Ok(Node::Other("number"))
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Node, E> {
        Ok(Node::Other("number"))
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<Node, E> {
        Ok(Node::Other("string"))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(Node::Other("sequence"))
    }

    fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Node, A::Error> {
        let mut entries: Vec<(Value, Node)> = Vec::new();
        while let Some((key, value)) = map.next_entry::<Value, Node>()? {
            match entries.iter_mut().find(|(existing, _)| *existing == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
        Ok(Node::Map(entries))
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Node, A::Error> {
        let (IgnoredAny, variant) = data.variant::<IgnoredAny>()?;
        variant.newtype_variant::<IgnoredAny>()?;
        Ok(Node::Other("tagged value"))
    }
}

fn key_text(key: &Value) -> Result<String, ManifestError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ManifestError::InvalidKey(kind(other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
