//! Attribute, dataset, group and link specs.
//!
//! Specs are read from already-parsed mappings (`serde_json::Value`) and are
//! immutable once registered. Parsing validates everything that can be
//! checked without the catalog; name resolution happens at registration.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::error::SpecError;
use crate::model::value::{CompoundField, DType, PlainValue, Primitive, RefKind};

/// Allowed shapes of an attribute or dataset. Each entry lists one length
/// per dimension, `None` meaning any length.
pub type ShapeSpec = Vec<Vec<Option<u64>>>;

/// How many instances of a group, dataset or link may appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Quantity {
    Exactly(u64),
    ZeroOrOne,
    ZeroOrMany,
    OneOrMany,
}

impl Default for Quantity {
    fn default() -> Self {
        Quantity::Exactly(1)
    }
}

impl Quantity {
    fn parse(json: &Json, path: &str) -> Result<Quantity, SpecError> {
        let invalid = || SpecError::InvalidQuantity {
            path: path.to_string(),
            quantity: json.to_string(),
        };
        match json {
            Json::Number(n) => match n.as_u64() {
                Some(count) if count >= 1 => Ok(Quantity::Exactly(count)),
                _ => Err(invalid()),
            },
            Json::String(s) => match s.as_str() {
                "?" | "zero_or_one" => Ok(Quantity::ZeroOrOne),
                "*" | "zero_or_many" => Ok(Quantity::ZeroOrMany),
                "+" | "one_or_many" => Ok(Quantity::OneOrMany),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }

    /// True for `*`, `+` and exact counts above one.
    pub fn is_many(self) -> bool {
        match self {
            Quantity::Exactly(n) => n > 1,
            Quantity::ZeroOrOne => false,
            Quantity::ZeroOrMany | Quantity::OneOrMany => true,
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Quantity::Exactly(_) | Quantity::OneOrMany)
    }

    /// True if `count` instances satisfy this quantity.
    pub fn admits(self, count: usize) -> bool {
        let count = count as u64;
        match self {
            Quantity::Exactly(n) => count == n,
            Quantity::ZeroOrOne => count <= 1,
            Quantity::ZeroOrMany => true,
            Quantity::OneOrMany => count >= 1,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Exactly(n) => write!(f, "{}", n),
            Quantity::ZeroOrOne => f.write_str("?"),
            Quantity::ZeroOrMany => f.write_str("*"),
            Quantity::OneOrMany => f.write_str("+"),
        }
    }
}

/// Where a child spec of a resolved type came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Inheritance {
    /// Declared by the type itself.
    #[default]
    New,
    /// Carried over unchanged from a base type.
    Inherited,
    /// Declared by a base type and refined by this type.
    Overridden,
}

/// The closed set of spec kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecKind {
    Attribute,
    Dataset,
    Group,
    Link,
}

impl SpecKind {
    pub fn name(self) -> &'static str {
        match self {
            SpecKind::Attribute => "attribute",
            SpecKind::Dataset => "dataset",
            SpecKind::Group => "group",
            SpecKind::Link => "link",
        }
    }
}

// =============================================================================
// Spec structures
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeSpec {
    pub name: String,
    pub doc: String,
    pub dtype: DType,
    pub shape: Option<ShapeSpec>,
    pub dims: Option<Vec<Vec<String>>>,
    pub required: bool,
    /// Fixed value; the attribute always holds exactly this.
    pub value: Option<PlainValue>,
    pub default_value: Option<PlainValue>,
    #[serde(skip)]
    pub inheritance: Inheritance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSpec {
    pub name: Option<String>,
    pub doc: String,
    pub data_type_def: Option<String>,
    pub data_type_inc: Option<String>,
    pub quantity: Quantity,
    pub linkable: bool,
    pub dtype: Option<DType>,
    pub shape: Option<ShapeSpec>,
    pub dims: Option<Vec<Vec<String>>>,
    pub value: Option<PlainValue>,
    pub default_value: Option<PlainValue>,
    pub attributes: Vec<AttributeSpec>,
    #[serde(skip)]
    pub inheritance: Inheritance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSpec {
    pub name: Option<String>,
    pub doc: String,
    pub data_type_def: Option<String>,
    pub data_type_inc: Option<String>,
    pub quantity: Quantity,
    pub linkable: bool,
    pub attributes: Vec<AttributeSpec>,
    pub datasets: Vec<DatasetSpec>,
    pub groups: Vec<GroupSpec>,
    pub links: Vec<LinkSpec>,
    #[serde(skip)]
    pub inheritance: Inheritance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSpec {
    pub name: Option<String>,
    pub doc: String,
    pub target_type: String,
    pub quantity: Quantity,
    #[serde(skip)]
    pub inheritance: Inheritance,
}

/// A registrable type: a group or dataset spec carrying `data_type_def`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TypeSpec {
    Group(GroupSpec),
    Dataset(DatasetSpec),
}

/// Borrowed view of any child spec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpecRef<'a> {
    Attribute(&'a AttributeSpec),
    Dataset(&'a DatasetSpec),
    Group(&'a GroupSpec),
    Link(&'a LinkSpec),
}

impl<'a> SpecRef<'a> {
    pub fn kind(&self) -> SpecKind {
        match self {
            SpecRef::Attribute(_) => SpecKind::Attribute,
            SpecRef::Dataset(_) => SpecKind::Dataset,
            SpecRef::Group(_) => SpecKind::Group,
            SpecRef::Link(_) => SpecKind::Link,
        }
    }

    pub fn name(&self) -> Option<&'a str> {
        match self {
            SpecRef::Attribute(a) => Some(&a.name),
            SpecRef::Dataset(d) => d.name.as_deref(),
            SpecRef::Group(g) => g.name.as_deref(),
            SpecRef::Link(l) => l.name.as_deref(),
        }
    }

    pub fn inheritance(&self) -> Inheritance {
        match self {
            SpecRef::Attribute(a) => a.inheritance,
            SpecRef::Dataset(d) => d.inheritance,
            SpecRef::Group(g) => g.inheritance,
            SpecRef::Link(l) => l.inheritance,
        }
    }

    /// Data type of a typed group/dataset, or the target type of a link.
    pub fn data_type(&self) -> Option<&'a str> {
        match self {
            SpecRef::Attribute(_) => None,
            SpecRef::Dataset(d) => d.data_type(),
            SpecRef::Group(g) => g.data_type(),
            SpecRef::Link(l) => Some(&l.target_type),
        }
    }

    pub fn quantity(&self) -> Quantity {
        match self {
            SpecRef::Attribute(_) => Quantity::Exactly(1),
            SpecRef::Dataset(d) => d.quantity,
            SpecRef::Group(g) => g.quantity,
            SpecRef::Link(l) => l.quantity,
        }
    }

    pub fn is_required(&self) -> bool {
        match self {
            SpecRef::Attribute(a) => a.required,
            other => other.quantity().is_required(),
        }
    }

    pub fn is_many(&self) -> bool {
        self.quantity().is_many()
    }

    pub fn doc(&self) -> &'a str {
        match self {
            SpecRef::Attribute(a) => &a.doc,
            SpecRef::Dataset(d) => &d.doc,
            SpecRef::Group(g) => &g.doc,
            SpecRef::Link(l) => &l.doc,
        }
    }
}

impl DatasetSpec {
    /// `data_type_def` if set, else `data_type_inc`.
    pub fn data_type(&self) -> Option<&str> {
        self.data_type_def.as_deref().or(self.data_type_inc.as_deref())
    }

    pub fn is_typed(&self) -> bool {
        self.data_type().is_some()
    }
}

impl GroupSpec {
    pub fn data_type(&self) -> Option<&str> {
        self.data_type_def.as_deref().or(self.data_type_inc.as_deref())
    }

    pub fn is_typed(&self) -> bool {
        self.data_type().is_some()
    }

    /// Child specs: attributes, datasets, groups, then links.
    pub fn children(&self) -> impl Iterator<Item = SpecRef<'_>> {
        self.attributes
            .iter()
            .map(SpecRef::Attribute)
            .chain(self.datasets.iter().map(SpecRef::Dataset))
            .chain(self.groups.iter().map(SpecRef::Group))
            .chain(self.links.iter().map(SpecRef::Link))
    }
}

impl TypeSpec {
    pub fn kind(&self) -> SpecKind {
        match self {
            TypeSpec::Group(_) => SpecKind::Group,
            TypeSpec::Dataset(_) => SpecKind::Dataset,
        }
    }

    pub fn data_type_def(&self) -> Option<&str> {
        match self {
            TypeSpec::Group(g) => g.data_type_def.as_deref(),
            TypeSpec::Dataset(d) => d.data_type_def.as_deref(),
        }
    }

    pub fn data_type_inc(&self) -> Option<&str> {
        match self {
            TypeSpec::Group(g) => g.data_type_inc.as_deref(),
            TypeSpec::Dataset(d) => d.data_type_inc.as_deref(),
        }
    }

    pub fn data_type(&self) -> Option<&str> {
        self.data_type_def().or(self.data_type_inc())
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TypeSpec::Group(g) => g.name.as_deref(),
            TypeSpec::Dataset(d) => d.name.as_deref(),
        }
    }

    pub fn doc(&self) -> &str {
        match self {
            TypeSpec::Group(g) => &g.doc,
            TypeSpec::Dataset(d) => &d.doc,
        }
    }

    pub fn attributes(&self) -> &[AttributeSpec] {
        match self {
            TypeSpec::Group(g) => &g.attributes,
            TypeSpec::Dataset(d) => &d.attributes,
        }
    }

    pub fn as_ref(&self) -> SpecRef<'_> {
        match self {
            TypeSpec::Group(g) => SpecRef::Group(g),
            TypeSpec::Dataset(d) => SpecRef::Dataset(d),
        }
    }

    /// Every spec in this type (itself included) that carries a
    /// `data_type_def`, outermost first.
    pub fn type_definitions(&self) -> Vec<TypeSpec> {
        let mut out = Vec::new();
        match self {
            TypeSpec::Group(g) => collect_group_defs(g, &mut out),
            TypeSpec::Dataset(d) => {
                if d.data_type_def.is_some() {
                    out.push(TypeSpec::Dataset(d.clone()));
                }
            }
        }
        out
    }

    /// Every type name this spec refers to: includes, link targets and
    /// reference targets, nested specs included.
    pub fn referenced_types(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            TypeSpec::Group(g) => collect_group_refs(g, &mut out),
            TypeSpec::Dataset(d) => collect_dataset_refs(d, &mut out),
        }
        out
    }

    /// Parses a single group spec.
    pub fn group_from_json(json: &Json) -> Result<TypeSpec, SpecError> {
        Ok(TypeSpec::Group(GroupSpec::from_json(json, "")?))
    }

    /// Parses a single dataset spec.
    pub fn dataset_from_json(json: &Json) -> Result<TypeSpec, SpecError> {
        Ok(TypeSpec::Dataset(DatasetSpec::from_json(json, "")?))
    }
}

fn collect_group_defs(g: &GroupSpec, out: &mut Vec<TypeSpec>) {
    if g.data_type_def.is_some() {
        out.push(TypeSpec::Group(g.clone()));
    }
    for d in &g.datasets {
        if d.data_type_def.is_some() {
            out.push(TypeSpec::Dataset(d.clone()));
        }
    }
    for sub in &g.groups {
        collect_group_defs(sub, out);
    }
}

fn collect_attr_refs<'a>(attrs: &'a [AttributeSpec], out: &mut Vec<&'a str>) {
    for a in attrs {
        collect_dtype_refs(&a.dtype, out);
    }
}

fn collect_dtype_refs<'a>(dtype: &'a DType, out: &mut Vec<&'a str>) {
    match dtype {
        DType::Reference { target_type, .. } => out.push(target_type),
        DType::Compound(fields) => fields.iter().for_each(|f| collect_dtype_refs(&f.dtype, out)),
        DType::Primitive(_) | DType::Numeric => {}
    }
}

fn collect_dataset_refs<'a>(d: &'a DatasetSpec, out: &mut Vec<&'a str>) {
    if let Some(inc) = &d.data_type_inc {
        out.push(inc);
    }
    if let Some(dtype) = &d.dtype {
        collect_dtype_refs(dtype, out);
    }
    collect_attr_refs(&d.attributes, out);
}

fn collect_group_refs<'a>(g: &'a GroupSpec, out: &mut Vec<&'a str>) {
    if let Some(inc) = &g.data_type_inc {
        out.push(inc);
    }
    collect_attr_refs(&g.attributes, out);
    for d in &g.datasets {
        collect_dataset_refs(d, out);
    }
    for sub in &g.groups {
        collect_group_refs(sub, out);
    }
    for l in &g.links {
        out.push(&l.target_type);
    }
}

/// Parses a spec source mapping `{"groups": [...], "datasets": [...]}`.
pub fn parse_spec_source(json: &Json, source: &str) -> Result<Vec<TypeSpec>, SpecError> {
    let map = as_map(json, source)?;
    let mut specs = Vec::new();
    for item in list(map, "groups", source)? {
        specs.push(TypeSpec::Group(GroupSpec::from_json(item, source)?));
    }
    for item in list(map, "datasets", source)? {
        specs.push(TypeSpec::Dataset(DatasetSpec::from_json(item, source)?));
    }
    Ok(specs)
}

// =============================================================================
// Parsing
// =============================================================================

fn as_map<'a>(json: &'a Json, path: &str) -> Result<&'a Map<String, Json>, SpecError> {
    json.as_object().ok_or_else(|| SpecError::NotAMapping { path: path.to_string() })
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn opt_str(map: &Map<String, Json>, key: &'static str, path: &str) -> Result<Option<String>, SpecError> {
    match map.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SpecError::InvalidValue {
            path: path.to_string(),
            key,
            reason: "expected a string".to_string(),
        }),
    }
}

fn req_str(map: &Map<String, Json>, key: &'static str, path: &str) -> Result<String, SpecError> {
    opt_str(map, key, path)?.ok_or_else(|| SpecError::MissingKey {
        path: path.to_string(),
        key,
    })
}

fn opt_bool(map: &Map<String, Json>, key: &'static str, path: &str, default: bool) -> Result<bool, SpecError> {
    match map.get(key) {
        None | Some(Json::Null) => Ok(default),
        Some(Json::Bool(b)) => Ok(*b),
        Some(_) => Err(SpecError::InvalidValue {
            path: path.to_string(),
            key,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn list<'a>(map: &'a Map<String, Json>, key: &'static str, path: &str) -> Result<&'a [Json], SpecError> {
    match map.get(key) {
        None | Some(Json::Null) => Ok(&[]),
        Some(Json::Array(items)) => Ok(items),
        Some(_) => Err(SpecError::InvalidValue {
            path: path.to_string(),
            key,
            reason: "expected a list".to_string(),
        }),
    }
}

fn literal(map: &Map<String, Json>, key: &'static str, path: &str) -> Result<Option<PlainValue>, SpecError> {
    match map.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => PlainValue::from_json(v).map(Some).ok_or_else(|| SpecError::InvalidValue {
            path: path.to_string(),
            key,
            reason: "expected a scalar or list literal".to_string(),
        }),
    }
}

fn type_names(map: &Map<String, Json>, path: &str) -> Result<(Option<String>, Option<String>), SpecError> {
    let def = opt_str(map, "data_type_def", path)?;
    let inc = opt_str(map, "data_type_inc", path)?;
    if let (Some(d), Some(i)) = (&def, &inc) {
        if d == i {
            return Err(SpecError::SelfInclusion {
                path: path.to_string(),
                name: d.clone(),
            });
        }
    }
    Ok((def, inc))
}

fn parse_quantity(map: &Map<String, Json>, path: &str) -> Result<Quantity, SpecError> {
    match map.get("quantity") {
        None | Some(Json::Null) => Ok(Quantity::default()),
        Some(q) => Quantity::parse(q, path),
    }
}

/// Parses a dtype: a primitive name, "numeric", a reference mapping or a
/// compound list.
pub fn parse_dtype(json: &Json, path: &str) -> Result<DType, SpecError> {
    match json {
        Json::String(name) if name == "numeric" => Ok(DType::Numeric),
        Json::String(name) => Primitive::from_name(name)
            .map(DType::Primitive)
            .ok_or_else(|| SpecError::UnknownDtype {
                path: path.to_string(),
                dtype: name.clone(),
            }),
        Json::Object(map) => {
            let target_type = req_str(map, "target_type", path)?;
            let kind = match opt_str(map, "reftype", path)?.as_deref() {
                None | Some("object") | Some("ref") | Some("reference") => RefKind::Object,
                Some("region") => RefKind::Region,
                Some(other) => {
                    return Err(SpecError::InvalidValue {
                        path: path.to_string(),
                        key: "reftype",
                        reason: format!("unknown reftype '{}'", other),
                    });
                }
            };
            Ok(DType::Reference { target_type, kind })
        }
        Json::Array(items) => {
            let mut fields = Vec::with_capacity(items.len());
            for item in items {
                let map = as_map(item, path)?;
                let name = req_str(map, "name", path)?;
                let field_path = child_path(path, &name);
                let doc = req_str(map, "doc", &field_path)?;
                let dtype = map.get("dtype").ok_or_else(|| SpecError::MissingKey {
                    path: field_path.clone(),
                    key: "dtype",
                })?;
                fields.push(CompoundField {
                    name,
                    doc,
                    dtype: parse_dtype(dtype, &field_path)?,
                });
            }
            Ok(DType::Compound(fields))
        }
        _ => Err(SpecError::UnknownDtype {
            path: path.to_string(),
            dtype: json.to_string(),
        }),
    }
}

fn parse_dim(json: &Json, path: &str) -> Result<Option<u64>, SpecError> {
    match json {
        Json::Null => Ok(None),
        Json::Number(n) => n.as_u64().map(Some).ok_or_else(|| SpecError::InvalidValue {
            path: path.to_string(),
            key: "shape",
            reason: format!("invalid dimension {}", n),
        }),
        other => Err(SpecError::InvalidValue {
            path: path.to_string(),
            key: "shape",
            reason: format!("invalid dimension {}", other),
        }),
    }
}

fn parse_shape(map: &Map<String, Json>, path: &str) -> Result<Option<ShapeSpec>, SpecError> {
    let items = match map.get("shape") {
        None | Some(Json::Null) => return Ok(None),
        Some(Json::Array(items)) => items,
        Some(_) => {
            return Err(SpecError::InvalidValue {
                path: path.to_string(),
                key: "shape",
                reason: "expected a list".to_string(),
            });
        }
    };
    if items.iter().all(Json::is_array) && !items.is_empty() {
        let mut shapes = Vec::with_capacity(items.len());
        for option in items {
            let dims = option.as_array().map(Vec::as_slice).unwrap_or(&[]);
            shapes.push(dims.iter().map(|d| parse_dim(d, path)).collect::<Result<_, _>>()?);
        }
        Ok(Some(shapes))
    } else {
        Ok(Some(vec![items.iter().map(|d| parse_dim(d, path)).collect::<Result<_, _>>()?]))
    }
}

fn parse_dims(map: &Map<String, Json>, path: &str) -> Result<Option<Vec<Vec<String>>>, SpecError> {
    let invalid = || SpecError::InvalidValue {
        path: path.to_string(),
        key: "dims",
        reason: "expected a list of names".to_string(),
    };
    let items = match map.get("dims") {
        None | Some(Json::Null) => return Ok(None),
        Some(Json::Array(items)) => items,
        Some(_) => return Err(invalid()),
    };
    let names = |values: &[Json]| -> Result<Vec<String>, SpecError> {
        values
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect()
    };
    if items.iter().all(Json::is_array) && !items.is_empty() {
        items
            .iter()
            .map(|option| names(option.as_array().map(Vec::as_slice).unwrap_or(&[])))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    } else {
        Ok(Some(vec![names(items)?]))
    }
}

fn check_dims(shape: &Option<ShapeSpec>, dims: &Option<Vec<Vec<String>>>, path: &str) -> Result<(), SpecError> {
    if let (Some(shape), Some(dims)) = (shape, dims) {
        for (s, d) in shape.iter().zip(dims) {
            if s.len() != d.len() {
                return Err(SpecError::DimsShapeMismatch {
                    path: path.to_string(),
                    dims: d.len(),
                    shape: s.len(),
                });
            }
        }
    }
    Ok(())
}

fn check_value_default(map: &Map<String, Json>, path: &str) -> Result<(), SpecError> {
    let set = |k: &str| map.get(k).is_some_and(|v| !v.is_null());
    if set("value") && set("default_value") {
        return Err(SpecError::ValueAndDefault { path: path.to_string() });
    }
    Ok(())
}

impl AttributeSpec {
    pub fn from_json(json: &Json, parent: &str) -> Result<AttributeSpec, SpecError> {
        let map = as_map(json, parent)?;
        let name = req_str(map, "name", parent)?;
        let path = child_path(parent, &name);
        let doc = req_str(map, "doc", &path)?;
        let dtype = map.get("dtype").ok_or_else(|| SpecError::MissingKey {
            path: path.clone(),
            key: "dtype",
        })?;
        check_value_default(map, &path)?;
        let shape = parse_shape(map, &path)?;
        let dims = parse_dims(map, &path)?;
        check_dims(&shape, &dims, &path)?;
        Ok(AttributeSpec {
            dtype: parse_dtype(dtype, &path)?,
            doc,
            shape,
            dims,
            required: opt_bool(map, "required", &path, true)?,
            value: literal(map, "value", &path)?,
            default_value: literal(map, "default_value", &path)?,
            inheritance: Inheritance::New,
            name,
        })
    }
}

fn label(name: &Option<String>, def: &Option<String>, inc: &Option<String>) -> String {
    name.clone()
        .or_else(|| def.clone())
        .or_else(|| inc.as_ref().map(|i| format!("<{}>", i)))
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn check_unique<'a>(names: impl Iterator<Item = Option<&'a str>>, path: &str) -> Result<(), SpecError> {
    let mut seen: Vec<&str> = Vec::new();
    for name in names.flatten() {
        if seen.contains(&name) {
            return Err(SpecError::DuplicateName {
                path: path.to_string(),
                name: name.to_string(),
            });
        }
        seen.push(name);
    }
    Ok(())
}

fn parse_attributes(map: &Map<String, Json>, path: &str) -> Result<Vec<AttributeSpec>, SpecError> {
    let attributes = list(map, "attributes", path)?
        .iter()
        .map(|a| AttributeSpec::from_json(a, path))
        .collect::<Result<Vec<_>, _>>()?;
    check_unique(attributes.iter().map(|a| Some(a.name.as_str())), path)?;
    Ok(attributes)
}

impl DatasetSpec {
    pub fn from_json(json: &Json, parent: &str) -> Result<DatasetSpec, SpecError> {
        let map = as_map(json, parent)?;
        let name = opt_str(map, "name", parent)?;
        let (def, inc) = type_names(map, parent)?;
        let path = child_path(parent, &label(&name, &def, &inc));
        if name.is_none() && def.is_none() && inc.is_none() {
            return Err(SpecError::UnnamedUntyped { path, kind: "dataset" });
        }
        let doc = req_str(map, "doc", &path)?;
        check_value_default(map, &path)?;
        let shape = parse_shape(map, &path)?;
        let dims = parse_dims(map, &path)?;
        check_dims(&shape, &dims, &path)?;
        let dtype = match map.get("dtype") {
            None | Some(Json::Null) => None,
            Some(d) => Some(parse_dtype(d, &path)?),
        };
        Ok(DatasetSpec {
            quantity: parse_quantity(map, &path)?,
            linkable: opt_bool(map, "linkable", &path, true)?,
            value: literal(map, "value", &path)?,
            default_value: literal(map, "default_value", &path)?,
            attributes: parse_attributes(map, &path)?,
            inheritance: Inheritance::New,
            name,
            doc,
            data_type_def: def,
            data_type_inc: inc,
            dtype,
            shape,
            dims,
        })
    }
}

impl GroupSpec {
    pub fn from_json(json: &Json, parent: &str) -> Result<GroupSpec, SpecError> {
        let map = as_map(json, parent)?;
        let name = opt_str(map, "name", parent)?;
        let (def, inc) = type_names(map, parent)?;
        let path = child_path(parent, &label(&name, &def, &inc));
        if name.is_none() && def.is_none() && inc.is_none() {
            return Err(SpecError::UnnamedUntyped { path, kind: "group" });
        }
        let doc = req_str(map, "doc", &path)?;
        let attributes = parse_attributes(map, &path)?;
        let datasets = list(map, "datasets", &path)?
            .iter()
            .map(|d| DatasetSpec::from_json(d, &path))
            .collect::<Result<Vec<_>, _>>()?;
        let groups = list(map, "groups", &path)?
            .iter()
            .map(|g| GroupSpec::from_json(g, &path))
            .collect::<Result<Vec<_>, _>>()?;
        let links = list(map, "links", &path)?
            .iter()
            .map(|l| LinkSpec::from_json(l, &path))
            .collect::<Result<Vec<_>, _>>()?;
        check_unique(
            datasets
                .iter()
                .map(|d| d.name.as_deref())
                .chain(groups.iter().map(|g| g.name.as_deref()))
                .chain(links.iter().map(|l| l.name.as_deref())),
            &path,
        )?;
        Ok(GroupSpec {
            quantity: parse_quantity(map, &path)?,
            linkable: opt_bool(map, "linkable", &path, true)?,
            inheritance: Inheritance::New,
            name,
            doc,
            data_type_def: def,
            data_type_inc: inc,
            attributes,
            datasets,
            groups,
            links,
        })
    }
}

impl LinkSpec {
    pub fn from_json(json: &Json, parent: &str) -> Result<LinkSpec, SpecError> {
        let map = as_map(json, parent)?;
        let name = opt_str(map, "name", parent)?;
        let path = child_path(parent, name.as_deref().unwrap_or("<link>"));
        Ok(LinkSpec {
            doc: req_str(map, "doc", &path)?,
            target_type: req_str(map, "target_type", &path)?,
            quantity: parse_quantity(map, &path)?,
            inheritance: Inheritance::New,
            name,
        })
    }
}

// =============================================================================
// Inheritance
// =============================================================================

/// Key a child spec is matched by when merging with its base: the name if
/// it has one, otherwise its data type.
fn merge_key(name: Option<&str>, data_type: Option<&str>) -> Option<String> {
    match (name, data_type) {
        (Some(n), _) => Some(n.to_string()),
        (None, Some(t)) => Some(format!("<{}>", t)),
        (None, None) => None,
    }
}

fn merge_children<T, K, M, S>(base: &[T], derived: &[T], key: K, merge: M, set: S) -> Vec<T>
where
    T: Clone,
    K: Fn(&T) -> Option<String>,
    M: Fn(&T, &T) -> T,
    S: Fn(&mut T, Inheritance),
{
    let mut out = Vec::with_capacity(base.len() + derived.len());
    let mut used = vec![false; derived.len()];
    for b in base {
        let k = key(b);
        let matched = derived
            .iter()
            .enumerate()
            .find(|(i, d)| !used[*i] && k.is_some() && key(d) == k);
        match matched {
            Some((i, d)) => {
                used[i] = true;
                let mut merged = merge(d, b);
                set(&mut merged, Inheritance::Overridden);
                out.push(merged);
            }
            None => {
                let mut inherited = b.clone();
                set(&mut inherited, Inheritance::Inherited);
                out.push(inherited);
            }
        }
    }
    for (i, d) in derived.iter().enumerate() {
        if !used[i] {
            let mut new = d.clone();
            set(&mut new, Inheritance::New);
            out.push(new);
        }
    }
    out
}

fn merge_attributes(base: &[AttributeSpec], derived: &[AttributeSpec]) -> Vec<AttributeSpec> {
    merge_children(
        base,
        derived,
        |a| Some(a.name.clone()),
        |d, b| d.inherit(b),
        |a, i| a.inheritance = i,
    )
}

impl AttributeSpec {
    /// Refines `base` with this spec.
    pub fn inherit(&self, base: &AttributeSpec) -> AttributeSpec {
        let mut merged = self.clone();
        if merged.shape.is_none() {
            merged.shape = base.shape.clone();
            merged.dims = base.dims.clone();
        }
        if merged.value.is_none() && merged.default_value.is_none() {
            merged.value = base.value.clone();
            merged.default_value = base.default_value.clone();
        }
        merged
    }
}

impl DatasetSpec {
    /// Refines `base` with this spec; unset properties fall back to the base.
    pub fn inherit(&self, base: &DatasetSpec) -> DatasetSpec {
        let mut merged = self.clone();
        merged.name = self.name.clone().or_else(|| base.name.clone());
        merged.dtype = self.dtype.clone().or_else(|| base.dtype.clone());
        if merged.shape.is_none() {
            merged.shape = base.shape.clone();
            merged.dims = base.dims.clone();
        }
        if merged.value.is_none() && merged.default_value.is_none() {
            merged.value = base.value.clone();
            merged.default_value = base.default_value.clone();
        }
        merged.attributes = merge_attributes(&base.attributes, &self.attributes);
        merged
    }
}

impl GroupSpec {
    /// Refines `base` with this spec, merging children by name or type.
    pub fn inherit(&self, base: &GroupSpec) -> GroupSpec {
        let mut merged = self.clone();
        merged.name = self.name.clone().or_else(|| base.name.clone());
        merged.attributes = merge_attributes(&base.attributes, &self.attributes);
        merged.datasets = merge_children(
            &base.datasets,
            &self.datasets,
            |d| merge_key(d.name.as_deref(), d.data_type()),
            |d, b| d.inherit(b),
            |d, i| d.inheritance = i,
        );
        merged.groups = merge_children(
            &base.groups,
            &self.groups,
            |g| merge_key(g.name.as_deref(), g.data_type()),
            |d, b| d.inherit(b),
            |g, i| g.inheritance = i,
        );
        merged.links = merge_children(
            &base.links,
            &self.links,
            |l| merge_key(l.name.as_deref(), Some(&l.target_type)),
            |d, _| d.clone(),
            |l, i| l.inheritance = i,
        );
        merged
    }
}
