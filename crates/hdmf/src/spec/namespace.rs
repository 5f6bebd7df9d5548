//! Namespaces: named, versioned collections of type specs.

use serde::Serialize;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::error::SpecError;
use crate::spec::types::{TypeSpec, parse_spec_source};

/// One entry of a namespace schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SchemaEntry {
    /// Type specs read from one spec source.
    Specs { source: String, specs: Vec<TypeSpec> },
    /// A dependency on another namespace, optionally restricted to some types.
    Include {
        namespace: String,
        data_types: Option<Vec<String>>,
    },
}

/// A named, versioned collection of types and dependencies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Namespace {
    pub name: String,
    pub version: Option<String>,
    pub doc: String,
    pub full_name: Option<String>,
    pub author: Vec<String>,
    pub contact: Vec<String>,
    pub schema: Vec<SchemaEntry>,
}

impl Namespace {
    /// Creates an empty namespace. Names must be non-empty and whitespace free.
    pub fn new(name: &str, version: Option<&str>) -> Result<Namespace, SpecError> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(SpecError::InvalidNamespaceName { name: name.to_string() });
        }
        Ok(Namespace {
            name: name.to_string(),
            version: version.map(str::to_string),
            doc: String::new(),
            full_name: None,
            author: Vec::new(),
            contact: Vec::new(),
            schema: Vec::new(),
        })
    }

    pub fn doc(mut self, doc: &str) -> Self {
        self.doc = doc.to_string();
        self
    }

    /// Adds the specs of one source.
    pub fn specs(mut self, source: &str, specs: Vec<TypeSpec>) -> Self {
        self.schema.push(SchemaEntry::Specs {
            source: source.to_string(),
            specs,
        });
        self
    }

    /// Adds a dependency on `namespace`. `None` makes all of its types visible.
    pub fn include(mut self, namespace: &str, data_types: Option<Vec<String>>) -> Self {
        self.schema.push(SchemaEntry::Include {
            namespace: namespace.to_string(),
            data_types,
        });
        self
    }

    /// Reads a namespace mapping.
    ///
    /// Schema entries are `{"namespace": .., "data_types": [..]}` for
    /// dependencies and `{"source": ..}` for spec sources. A source entry
    /// that carries `groups`/`datasets` inline is parsed directly; otherwise
    /// `load` is asked for the parsed source mapping.
    pub fn from_json<F>(json: &Json, mut load: F) -> Result<Namespace, SpecError>
    where
        F: FnMut(&str) -> Result<Json, SpecError>,
    {
        let map = json.as_object().ok_or_else(|| SpecError::NotAMapping {
            path: "namespace".to_string(),
        })?;
        let text = |key: &'static str| -> Result<Option<String>, SpecError> {
            match map.get(key) {
                None | Some(Json::Null) => Ok(None),
                Some(Json::String(s)) => Ok(Some(s.clone())),
                Some(Json::Number(n)) => Ok(Some(n.to_string())),
                Some(_) => Err(SpecError::InvalidValue {
                    path: "namespace".to_string(),
                    key,
                    reason: "expected a string".to_string(),
                }),
            }
        };
        let people = |key: &'static str| -> Vec<String> {
            match map.get(key) {
                Some(Json::String(s)) => vec![s.clone()],
                Some(Json::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            }
        };

        let name = text("name")?.ok_or_else(|| SpecError::MissingKey {
            path: "namespace".to_string(),
            key: "name",
        })?;
        let mut ns = Namespace::new(&name, text("version")?.as_deref())?;
        ns.doc = text("doc")?.unwrap_or_default();
        ns.full_name = text("full_name")?;
        ns.author = people("author");
        ns.contact = people("contact");

        let entries = match map.get("schema") {
            None | Some(Json::Null) => &[][..],
            Some(Json::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(SpecError::InvalidValue {
                    path: name.clone(),
                    key: "schema",
                    reason: "expected a list".to_string(),
                });
            }
        };
        for entry in entries {
            let entry_map = entry.as_object().ok_or_else(|| SpecError::NotAMapping {
                path: format!("{}/schema", name),
            })?;
            if let Some(dep) = entry_map.get("namespace").and_then(Json::as_str) {
                let data_types = match entry_map.get("data_types") {
                    Some(Json::Array(items)) => Some(
                        items
                            .iter()
                            .map(|t| {
                                t.as_str().map(str::to_string).ok_or_else(|| SpecError::InvalidValue {
                                    path: format!("{}/schema/{}", name, dep),
                                    key: "data_types",
                                    reason: "expected type names".to_string(),
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    _ => None,
                };
                ns.schema.push(SchemaEntry::Include {
                    namespace: dep.to_string(),
                    data_types,
                });
            } else if let Some(source) = entry_map.get("source").and_then(Json::as_str) {
                let specs = if entry_map.contains_key("groups") || entry_map.contains_key("datasets") {
                    parse_spec_source(entry, source)?
                } else {
                    parse_spec_source(&load(source)?, source)?
                };
                ns.schema.push(SchemaEntry::Specs {
                    source: source.to_string(),
                    specs,
                });
            } else {
                return Err(SpecError::MissingKey {
                    path: format!("{}/schema", name),
                    key: "source",
                });
            }
        }
        Ok(ns)
    }

    /// SHA-256 over the canonical serialization of this namespace.
    pub fn digest(&self) -> [u8; 32] {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let hash = Sha256::digest(&bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hash);
        out
    }

    /// Names of the namespaces this one includes.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.schema.iter().filter_map(|e| match e {
            SchemaEntry::Include { namespace, .. } => Some(namespace.as_str()),
            SchemaEntry::Specs { .. } => None,
        })
    }

    /// Top-level specs with the source they came from.
    pub fn type_specs(&self) -> impl Iterator<Item = (&str, &TypeSpec)> {
        self.schema.iter().flat_map(|e| match e {
            SchemaEntry::Specs { source, specs } => specs.iter().map(move |s| (source.as_str(), s)).collect::<Vec<_>>(),
            SchemaEntry::Include { .. } => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_with_loader() {
        let ns_json = json!({
            "name": "lab",
            "version": "0.2.0",
            "doc": "lab extensions",
            "author": "A. Person",
            "schema": [
                {"namespace": "core", "data_types": ["Bucket"]},
                {"source": "lab.types"}
            ]
        });
        let mut requested = Vec::new();
        let ns = Namespace::from_json(&ns_json, |source| {
            requested.push(source.to_string());
            Ok(json!({"groups": [{"data_type_def": "Crate", "data_type_inc": "Bucket", "doc": "crate"}]}))
        })
        .unwrap();
        assert_eq!(requested, vec!["lab.types"]);
        assert_eq!(ns.version.as_deref(), Some("0.2.0"));
        assert_eq!(ns.author, vec!["A. Person"]);
        assert_eq!(ns.dependencies().collect::<Vec<_>>(), vec!["core"]);
        let specs: Vec<_> = ns.type_specs().map(|(src, s)| (src, s.data_type())).collect();
        assert_eq!(specs, vec![("lab.types", Some("Crate"))]);
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = Namespace::new("core", Some("1.0")).unwrap().doc("x");
        let b = Namespace::new("core", Some("1.0")).unwrap().doc("x");
        let c = Namespace::new("core", Some("1.0")).unwrap().doc("y");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_invalid_name() {
        assert!(matches!(
            Namespace::new("my core", None),
            Err(SpecError::InvalidNamespaceName { .. })
        ));
    }
}
