//! JSON document codec for builder trees.
//!
//! A document holds one builder tree:
//!
//! ```text
//! { "format": "hdmf-json", "version": 1, "source": "...",
//!   "root": { "kind": "group", "name": "...", "attributes": [...],
//!             "groups": [...], "datasets": [...], "links": [...] } }
//! ```
//!
//! References and in-file links are stored as root-relative paths ("/a/b").
//! Links into other sources carry that source's name. A compressed document
//! is the magic `HDMFZ`, the uncompressed size as 8 little-endian bytes, and
//! the zstd frame.

use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BackendError;
use crate::limits::{DEFAULT_COMPRESSION_LEVEL, MAGIC_COMPRESSED, MAX_DOCUMENT_SIZE};
use crate::model::builder::{BuilderId, BuilderValue, Builders, LinkTarget, NodeKind};
use crate::model::value::{DType, Value};

/// Format marker written into every document.
pub const FORMAT_NAME: &str = "hdmf-json";
/// Current document version.
pub const FORMAT_VERSION: u32 = 1;

/// Options for writing documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonOptions {
    /// Compress written documents with zstd.
    pub compress: bool,
    /// zstd level used when compressing.
    pub level: i32,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            compress: false,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl JsonOptions {
    pub fn compressed() -> Self {
        Self {
            compress: true,
            ..Self::default()
        }
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub format: String,
    pub version: u32,
    #[serde(default)]
    pub source: Option<String>,
    pub root: NodeRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeRecord {
    Group {
        name: String,
        #[serde(default)]
        attributes: Vec<AttrRecord>,
        #[serde(default)]
        groups: Vec<NodeRecord>,
        #[serde(default)]
        datasets: Vec<NodeRecord>,
        #[serde(default)]
        links: Vec<LinkRecord>,
    },
    Dataset {
        name: String,
        #[serde(default)]
        attributes: Vec<AttrRecord>,
        #[serde(default)]
        data: Option<Value<String>>,
        #[serde(default)]
        dtype: Option<DType>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrRecord {
    pub name: String,
    pub value: Value<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub name: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

// =============================================================================
// Encoding
// =============================================================================

/// Converts the tree under `root` to a document.
pub fn encode_tree(builders: &Builders, root: BuilderId, source: &str) -> Result<Document, BackendError> {
    Ok(Document {
        format: FORMAT_NAME.to_string(),
        version: FORMAT_VERSION,
        source: Some(source.to_string()),
        root: encode_node(builders, root, root)?,
    })
}

fn encode_value(builders: &Builders, root: BuilderId, at: BuilderId, value: &BuilderValue) -> Result<Value<String>, BackendError> {
    value.try_map_refs(&mut |&target| {
        builders
            .relative_path(root, target)
            .ok_or_else(|| BackendError::ExternalReference { path: builders.path(at) })
    })
}

fn encode_attributes(builders: &Builders, root: BuilderId, id: BuilderId) -> Result<Vec<AttrRecord>, BackendError> {
    builders
        .node(id)
        .attributes()
        .map(|(name, value)| {
            Ok(AttrRecord {
                name: name.to_string(),
                value: encode_value(builders, root, id, value)?,
            })
        })
        .collect()
}

fn encode_link(builders: &Builders, root: BuilderId, id: BuilderId) -> Result<LinkRecord, BackendError> {
    let name = builders.name(id).to_string();
    let (target, source) = match builders.node(id).link_target() {
        Some(LinkTarget::Builder(t)) => match builders.relative_path(root, *t) {
            Some(path) => (path, None),
            None => {
                let other = builders.root_of(*t);
                let path = builders.relative_path(other, *t).unwrap_or_default();
                (path, builders.source(other).map(str::to_string))
            }
        },
        Some(LinkTarget::External { source, path }) => (path.clone(), source.clone()),
        None => (String::new(), None),
    };
    if source.is_none() && !target.starts_with('/') {
        return Err(BackendError::UnresolvedPath {
            source_name: builders.source(root).unwrap_or_default().to_string(),
            path: builders.path(id),
        });
    }
    Ok(LinkRecord { name, target, source })
}

fn encode_node(builders: &Builders, root: BuilderId, id: BuilderId) -> Result<NodeRecord, BackendError> {
    let node = builders.node(id);
    let attributes = encode_attributes(builders, root, id)?;
    match node.kind() {
        NodeKind::Group => Ok(NodeRecord::Group {
            name: node.name().to_string(),
            attributes,
            groups: node
                .groups()
                .iter()
                .map(|&g| encode_node(builders, root, g))
                .collect::<Result<_, _>>()?,
            datasets: node
                .datasets()
                .iter()
                .map(|&d| encode_node(builders, root, d))
                .collect::<Result<_, _>>()?,
            links: node
                .links()
                .iter()
                .map(|&l| encode_link(builders, root, l))
                .collect::<Result<_, _>>()?,
        }),
        NodeKind::Dataset => Ok(NodeRecord::Dataset {
            name: node.name().to_string(),
            attributes,
            data: node
                .data()
                .map(|v| encode_value(builders, root, id, v))
                .transpose()?,
            dtype: node.dtype().cloned(),
        }),
        NodeKind::Link => Err(BackendError::UnresolvedPath {
            source_name: builders.source(root).unwrap_or_default().to_string(),
            path: builders.path(id),
        }),
    }
}

/// Serializes a document, compressing it if asked to.
pub fn encode_document(doc: &Document, options: &JsonOptions, source_name: &str) -> Result<Vec<u8>, BackendError> {
    let json = serde_json::to_vec(doc).map_err(|e| BackendError::Json {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })?;
    if !options.compress {
        return Ok(json);
    }
    let compressed =
        zstd::encode_all(json.as_slice(), options.level).map_err(|e| BackendError::Compression(e.to_string()))?;
    let mut out = Vec::with_capacity(MAGIC_COMPRESSED.len() + 8 + compressed.len());
    out.extend_from_slice(MAGIC_COMPRESSED);
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);
    debug!(source = source_name, raw = json.len(), compressed = compressed.len(), "compressed document");
    Ok(out)
}

// =============================================================================
// Decoding
// =============================================================================

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
    let header = MAGIC_COMPRESSED.len() + 8;
    if bytes.len() < header {
        return Err(BackendError::Compression("truncated header".to_string()));
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&bytes[MAGIC_COMPRESSED.len()..header]);
    let declared = u64::from_le_bytes(size);
    if declared > MAX_DOCUMENT_SIZE as u64 {
        return Err(BackendError::Compression(format!(
            "declared size {} exceeds limit {}",
            declared, MAX_DOCUMENT_SIZE
        )));
    }
    let declared = declared as usize;

    let mut decoder = zstd::Decoder::new(&bytes[header..]).map_err(|e| BackendError::Compression(e.to_string()))?;
    let mut out = Vec::with_capacity(declared);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BackendError::Compression(e.to_string()))?;
    if out.len() != declared {
        return Err(BackendError::Compression(format!(
            "declared size {} but decompressed {} bytes",
            declared,
            out.len()
        )));
    }
    Ok(out)
}

/// Parses a document, decompressing it first if it carries the magic.
pub fn decode_document(bytes: &[u8], source_name: &str) -> Result<Document, BackendError> {
    let raw;
    let json = if bytes.starts_with(MAGIC_COMPRESSED) {
        raw = decompress(bytes)?;
        raw.as_slice()
    } else {
        bytes
    };
    let doc: Document = serde_json::from_slice(json).map_err(|e| BackendError::Json {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })?;
    if doc.format != FORMAT_NAME {
        return Err(BackendError::Json {
            source_name: source_name.to_string(),
            message: format!("unknown format '{}'", doc.format),
        });
    }
    Ok(doc)
}

enum Deferred {
    Attribute { at: BuilderId, name: String, value: Value<String> },
    Data { at: BuilderId, value: Value<String> },
    Link { parent: BuilderId, record: LinkRecord },
}

/// Reads a document into `builders` and returns the new root.
///
/// Every node gets `source_name` as its source. References and links are
/// resolved once all nodes exist; links into other sources stay external.
pub fn decode_tree(builders: &mut Builders, doc: Document, source_name: &str) -> Result<BuilderId, BackendError> {
    let mut deferred = Vec::new();
    let root = decode_node(builders, doc.root, source_name, &mut deferred)?;
    builders.set_source(root, source_name);

    let unresolved = |path: &str| BackendError::UnresolvedPath {
        source_name: source_name.to_string(),
        path: path.to_string(),
    };
    for item in deferred {
        match item {
            Deferred::Attribute { at, name, value } => {
                let value = value.try_map_refs(&mut |p| builders.resolve_path(root, p).ok_or_else(|| unresolved(p.as_str())))?;
                builders
                    .set_attribute(at, name, value)
                    .map_err(|e| unresolved(e.to_string().as_str()))?;
            }
            Deferred::Data { at, value } => {
                let value = value.try_map_refs(&mut |p| builders.resolve_path(root, p).ok_or_else(|| unresolved(p.as_str())))?;
                builders.set_data(at, Some(value));
            }
            Deferred::Link { parent, record } => {
                let target = match record.source {
                    Some(s) if s != source_name => LinkTarget::External {
                        source: Some(s),
                        path: record.target,
                    },
                    _ => LinkTarget::Builder(
                        builders
                            .resolve_path(root, &record.target)
                            .ok_or_else(|| unresolved(record.target.as_str()))?,
                    ),
                };
                let link = builders.new_link(record.name, target);
                builders.set_child(parent, link).map_err(|e| unresolved(e.to_string().as_str()))?;
            }
        }
    }
    Ok(root)
}

fn decode_attributes(at: BuilderId, attributes: Vec<AttrRecord>, deferred: &mut Vec<Deferred>) {
    for a in attributes {
        deferred.push(Deferred::Attribute {
            at,
            name: a.name,
            value: a.value,
        });
    }
}

fn decode_node(
    builders: &mut Builders,
    record: NodeRecord,
    source_name: &str,
    deferred: &mut Vec<Deferred>,
) -> Result<BuilderId, BackendError> {
    let collision = |e: crate::error::BuilderError| BackendError::Json {
        source_name: source_name.to_string(),
        message: e.to_string(),
    };
    match record {
        NodeRecord::Group {
            name,
            attributes,
            groups,
            datasets,
            links,
        } => {
            let id = builders.new_group(name);
            decode_attributes(id, attributes, deferred);
            for child in groups.into_iter().chain(datasets) {
                let c = decode_node(builders, child, source_name, deferred)?;
                builders.set_child(id, c).map_err(collision)?;
            }
            for record in links {
                deferred.push(Deferred::Link { parent: id, record });
            }
            Ok(id)
        }
        NodeRecord::Dataset {
            name,
            attributes,
            data,
            dtype,
        } => {
            let id = builders.new_dataset(name, None, dtype);
            decode_attributes(id, attributes, deferred);
            if let Some(value) = data {
                deferred.push(Deferred::Data { at: id, value });
            }
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::{Primitive, Timestamp};

    fn sample(builders: &mut Builders) -> BuilderId {
        let root = builders
            .group("root", |g| {
                g.attribute("data_type", "Library")
                    .group("shelf", |s| s.dataset("books", vec![1i32, 2, 3], |d| d.dtype(Primitive::Int32)))
            })
            .unwrap();
        let books = builders.resolve_path(root, "/shelf/books").unwrap();
        builders.set_attribute(root, "favorite", Value::Ref(books)).unwrap();
        builders.add_link(root, "shortcut", books).unwrap();
        builders.set_source(root, "lib.json");
        root
    }

    #[test]
    fn test_document_round_trip() {
        let mut builders = Builders::new();
        let root = sample(&mut builders);
        let doc = encode_tree(&builders, root, "lib.json").unwrap();
        match &doc.root {
            NodeRecord::Group { attributes, links, .. } => {
                assert_eq!(attributes[1].value, Value::Ref("/shelf/books".to_string()));
                assert_eq!(links[0].target, "/shelf/books");
                assert_eq!(links[0].source, None);
            }
            other => panic!("Expected Group, got {:?}", other),
        }

        for options in [JsonOptions::default(), JsonOptions::compressed()] {
            let bytes = encode_document(&doc, &options, "lib.json").unwrap();
            assert_eq!(bytes.starts_with(MAGIC_COMPRESSED), options.compress);
            let decoded = decode_document(&bytes, "lib.json").unwrap();
            assert_eq!(decoded, doc);

            let mut other = Builders::new();
            let back = decode_tree(&mut other, decoded, "lib.json").unwrap();
            let books = other.resolve_path(back, "shelf/books").unwrap();
            assert_eq!(other.node(books).data(), Some(&Value::from(vec![1i32, 2, 3])));
            assert_eq!(other.node(books).dtype(), Some(&DType::Primitive(Primitive::Int32)));
            assert_eq!(other.node(back).attribute("favorite"), Some(&Value::Ref(books)));
            let link = other.child(back, "shortcut").unwrap();
            assert_eq!(other.follow_links(link), Ok(books));
            assert_eq!(other.source(books), Some("lib.json"));
        }
    }

    #[test]
    fn test_reference_outside_tree() {
        let mut builders = Builders::new();
        let root = sample(&mut builders);
        let stray = builders.new_dataset("stray", None, None);
        builders.set_attribute(root, "bad", Value::Ref(stray)).unwrap();
        match encode_tree(&builders, root, "lib.json") {
            Err(BackendError::ExternalReference { path }) => assert_eq!(path, "root"),
            other => panic!("Expected ExternalReference, got {:?}", other),
        }
    }

    #[test]
    fn test_link_into_other_source() {
        let mut builders = Builders::new();
        let lib = sample(&mut builders);
        let books = builders.resolve_path(lib, "/shelf/books").unwrap();
        let reader = builders.new_group("reader");
        builders.add_link(reader, "borrowed", books).unwrap();
        builders.set_source(reader, "reader.json");

        let doc = encode_tree(&builders, reader, "reader.json").unwrap();
        match &doc.root {
            NodeRecord::Group { links, .. } => {
                assert_eq!(links[0].source.as_deref(), Some("lib.json"));
                assert_eq!(links[0].target, "/shelf/books");
            }
            other => panic!("Expected Group, got {:?}", other),
        }

        let mut fresh = Builders::new();
        let back = decode_tree(&mut fresh, doc, "reader.json").unwrap();
        let link = fresh.child(back, "borrowed").unwrap();
        assert_eq!(
            fresh.node(link).link_target(),
            Some(&LinkTarget::External {
                source: Some("lib.json".to_string()),
                path: "/shelf/books".to_string()
            })
        );
    }

    #[test]
    fn test_datetime_written_as_text() {
        let mut builders = Builders::new();
        let root = builders.new_group("root");
        let stamp = Timestamp::parse("2024-01-15T12:30:00.5+02:00").unwrap();
        builders.set_attribute(root, "created", Value::Datetime(stamp)).unwrap();

        let doc = encode_tree(&builders, root, "t.json").unwrap();
        let bytes = encode_document(&doc, &JsonOptions::default(), "t.json").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            json["root"]["attributes"][0]["value"],
            serde_json::json!({"datetime": "2024-01-15T12:30:00.5+02:00"})
        );

        let mut other = Builders::new();
        let back = decode_tree(&mut other, decode_document(&bytes, "t.json").unwrap(), "t.json").unwrap();
        assert_eq!(other.node(back).attribute("created"), Some(&Value::Datetime(stamp)));
    }

    #[test]
    fn test_corrupt_input() {
        assert!(matches!(decode_document(b"{", "x"), Err(BackendError::Json { .. })));
        let mut bytes = MAGIC_COMPRESSED.to_vec();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(decode_document(&bytes, "x"), Err(BackendError::Compression(_))));
        assert!(matches!(decode_document(b"HDMFZ\x01", "x"), Err(BackendError::Compression(_))));
    }
}
