//! Dtypes and the value tree carried by attributes and datasets.
//!
//! [`Value`] is generic over the reference handle `R`: containers hold
//! `Value<ContainerId>`, builders hold `Value<BuilderId>`, the JSON backend
//! uses `Value<String>` (paths) and spec defaults use [`PlainValue`].

use std::fmt;

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::datetime::{DateTimeParseError, format_isodatetime, parse_isodatetime};

/// Primitive element types understood by the build layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Text,
    Ascii,
    IsoDatetime,
}

/// Broad family of a primitive, used by the conversion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveClass {
    Bool,
    Signed,
    Unsigned,
    Float,
    Text,
    Ascii,
    Datetime,
}

lazy_static! {
    /// Every dtype spelling accepted in specs, mapped to its canonical primitive.
    static ref DTYPE_SYNONYMS: FxHashMap<&'static str, Primitive> = {
        let mut m = FxHashMap::default();
        for (name, p) in [
            ("float", Primitive::Float32),
            ("float32", Primitive::Float32),
            ("double", Primitive::Float64),
            ("float64", Primitive::Float64),
            ("long", Primitive::Int64),
            ("int64", Primitive::Int64),
            ("int", Primitive::Int32),
            ("int32", Primitive::Int32),
            ("short", Primitive::Int16),
            ("int16", Primitive::Int16),
            ("int8", Primitive::Int8),
            ("uint", Primitive::UInt32),
            ("uint32", Primitive::UInt32),
            ("uint64", Primitive::UInt64),
            ("uint16", Primitive::UInt16),
            ("uint8", Primitive::UInt8),
            ("bool", Primitive::Bool),
            ("text", Primitive::Text),
            ("utf", Primitive::Text),
            ("utf8", Primitive::Text),
            ("utf-8", Primitive::Text),
            ("ascii", Primitive::Ascii),
            ("bytes", Primitive::Ascii),
            ("isodatetime", Primitive::IsoDatetime),
            ("datetime", Primitive::IsoDatetime),
        ] {
            m.insert(name, p);
        }
        m
    };
}

impl Primitive {
    /// All primitives, in declaration order.
    pub const ALL: [Primitive; 14] = [
        Primitive::Bool,
        Primitive::Int8,
        Primitive::Int16,
        Primitive::Int32,
        Primitive::Int64,
        Primitive::UInt8,
        Primitive::UInt16,
        Primitive::UInt32,
        Primitive::UInt64,
        Primitive::Float32,
        Primitive::Float64,
        Primitive::Text,
        Primitive::Ascii,
        Primitive::IsoDatetime,
    ];

    /// Looks up a dtype name, accepting every synonym (e.g. "double", "utf8").
    pub fn from_name(name: &str) -> Option<Primitive> {
        DTYPE_SYNONYMS.get(name).copied()
    }

    /// Returns the canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::Int8 => "int8",
            Primitive::Int16 => "int16",
            Primitive::Int32 => "int32",
            Primitive::Int64 => "int64",
            Primitive::UInt8 => "uint8",
            Primitive::UInt16 => "uint16",
            Primitive::UInt32 => "uint32",
            Primitive::UInt64 => "uint64",
            Primitive::Float32 => "float32",
            Primitive::Float64 => "float64",
            Primitive::Text => "text",
            Primitive::Ascii => "ascii",
            Primitive::IsoDatetime => "isodatetime",
        }
    }

    pub fn class(self) -> PrimitiveClass {
        match self {
            Primitive::Bool => PrimitiveClass::Bool,
            Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Int64 => PrimitiveClass::Signed,
            Primitive::UInt8 | Primitive::UInt16 | Primitive::UInt32 | Primitive::UInt64 => {
                PrimitiveClass::Unsigned
            }
            Primitive::Float32 | Primitive::Float64 => PrimitiveClass::Float,
            Primitive::Text => PrimitiveClass::Text,
            Primitive::Ascii => PrimitiveClass::Ascii,
            Primitive::IsoDatetime => PrimitiveClass::Datetime,
        }
    }

    /// Size in bytes of numeric and bool primitives, 0 otherwise.
    pub fn size(self) -> usize {
        match self {
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float32 => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Float64 => 8,
            Primitive::Text | Primitive::Ascii | Primitive::IsoDatetime => 0,
        }
    }

    /// True for signed, unsigned and floating point primitives.
    pub fn is_numeric(self) -> bool {
        matches!(
            self.class(),
            PrimitiveClass::Signed | PrimitiveClass::Unsigned | PrimitiveClass::Float
        )
    }

    /// Returns the numeric primitive of `class` with `size` bytes, if one exists.
    pub fn sized(class: PrimitiveClass, size: usize) -> Option<Primitive> {
        match (class, size) {
            (PrimitiveClass::Signed, 1) => Some(Primitive::Int8),
            (PrimitiveClass::Signed, 2) => Some(Primitive::Int16),
            (PrimitiveClass::Signed, 4) => Some(Primitive::Int32),
            (PrimitiveClass::Signed, 8) => Some(Primitive::Int64),
            (PrimitiveClass::Unsigned, 1) => Some(Primitive::UInt8),
            (PrimitiveClass::Unsigned, 2) => Some(Primitive::UInt16),
            (PrimitiveClass::Unsigned, 4) => Some(Primitive::UInt32),
            (PrimitiveClass::Unsigned, 8) => Some(Primitive::UInt64),
            (PrimitiveClass::Float, 4) => Some(Primitive::Float32),
            (PrimitiveClass::Float, 8) => Some(Primitive::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of reference a reference dtype stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Object,
    Region,
}

/// One named column of a compound dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundField {
    pub name: String,
    pub doc: String,
    pub dtype: DType,
}

/// The dtype declared by an attribute or dataset spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Primitive(Primitive),
    /// Any numeric primitive.
    Numeric,
    /// Reference to an object (or region of an object) of `target_type`.
    Reference { target_type: String, kind: RefKind },
    Compound(Vec<CompoundField>),
}

impl DType {
    /// True when values of this dtype carry references, directly or in a compound column.
    pub fn contains_reference(&self) -> bool {
        match self {
            DType::Reference { .. } => true,
            DType::Compound(fields) => fields.iter().any(|f| f.dtype.contains_reference()),
            DType::Primitive(_) | DType::Numeric => false,
        }
    }

    pub fn reference_target(&self) -> Option<&str> {
        match self {
            DType::Reference { target_type, .. } => Some(target_type),
            _ => None,
        }
    }
}

impl From<Primitive> for DType {
    fn from(p: Primitive) -> Self {
        DType::Primitive(p)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Primitive(p) => write!(f, "{}", p),
            DType::Numeric => f.write_str("numeric"),
            DType::Reference { target_type, kind } => match kind {
                RefKind::Object => write!(f, "object reference to {}", target_type),
                RefKind::Region => write!(f, "region reference to {}", target_type),
            },
            DType::Compound(fields) => {
                f.write_str("compound(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.dtype)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Selection within a referenced dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// Half-open element range along the first dimension.
    Slice { start: u64, stop: u64 },
    /// Explicit element indices.
    Points(Vec<u64>),
}

/// An `isodatetime` value: microseconds since the Unix epoch (UTC) plus the
/// offset, in minutes, it was written with.
///
/// Serialized as ISO 8601 text in its original offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub epoch_us: i64,
    pub offset_min: i16,
}

impl Timestamp {
    pub fn parse(text: &str) -> Result<Timestamp, DateTimeParseError> {
        let (epoch_us, offset_min) = parse_isodatetime(text)?;
        Ok(Timestamp { epoch_us, offset_min })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_isodatetime(self.epoch_us, self.offset_min))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Timestamp::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// An attribute or dataset payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value<R> {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Ascii(Vec<u8>),
    Datetime(Timestamp),
    /// A sequence; nested lists form multi-dimensional data.
    List(Vec<Value<R>>),
    /// One row of a compound dtype.
    Compound(Vec<Value<R>>),
    Ref(R),
    Region { target: R, region: Region },
}

/// A value that carries no references (spec defaults, fixed values).
pub type PlainValue = Value<()>;

impl<R> Value<R> {
    /// Returns the primitive of a scalar, or of the first leaf of a list.
    pub fn primitive(&self) -> Option<Primitive> {
        Some(match self {
            Value::Bool(_) => Primitive::Bool,
            Value::Int8(_) => Primitive::Int8,
            Value::Int16(_) => Primitive::Int16,
            Value::Int32(_) => Primitive::Int32,
            Value::Int64(_) => Primitive::Int64,
            Value::UInt8(_) => Primitive::UInt8,
            Value::UInt16(_) => Primitive::UInt16,
            Value::UInt32(_) => Primitive::UInt32,
            Value::UInt64(_) => Primitive::UInt64,
            Value::Float32(_) => Primitive::Float32,
            Value::Float64(_) => Primitive::Float64,
            Value::Text(_) => Primitive::Text,
            Value::Ascii(_) => Primitive::Ascii,
            Value::Datetime(_) => Primitive::IsoDatetime,
            Value::List(items) => return items.first().and_then(Value::primitive),
            Value::Compound(_) | Value::Ref(_) | Value::Region { .. } => return None,
        })
    }

    /// Short description used in error messages (e.g. "list of int32").
    pub fn type_name(&self) -> String {
        match self {
            Value::List(items) => match items.first() {
                Some(first) => format!("list of {}", first.type_name()),
                None => "empty list".to_string(),
            },
            Value::Compound(_) => "compound".to_string(),
            Value::Ref(_) => "reference".to_string(),
            Value::Region { .. } => "region reference".to_string(),
            scalar => scalar.primitive().map(|p| p.name()).unwrap_or("value").to_string(),
        }
    }

    pub fn as_list(&self) -> Option<&[Value<R>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns integer scalars widened to `i128`.
    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Value::Int8(v) => Some(*v as i128),
            Value::Int16(v) => Some(*v as i128),
            Value::Int32(v) => Some(*v as i128),
            Value::Int64(v) => Some(*v as i128),
            Value::UInt8(v) => Some(*v as i128),
            Value::UInt16(v) => Some(*v as i128),
            Value::UInt32(v) => Some(*v as i128),
            Value::UInt64(v) => Some(*v as i128),
            _ => None,
        }
    }

    /// Returns numeric scalars as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            other => other.as_integer().map(|v| v as f64),
        }
    }

    /// Returns the shape, following the first element of nested lists.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::new();
        let mut current = self;
        while let Value::List(items) = current {
            shape.push(items.len());
            match items.first() {
                Some(first) => current = first,
                None => break,
            }
        }
        shape
    }

    /// Collects the distinct leaf primitives of this value.
    pub fn leaf_primitives(&self, out: &mut Vec<Primitive>) {
        match self {
            Value::List(items) => items.iter().for_each(|v| v.leaf_primitives(out)),
            other => {
                if let Some(p) = other.primitive() {
                    if !out.contains(&p) {
                        out.push(p);
                    }
                }
            }
        }
    }

    /// True if any reference or region occurs in this value.
    pub fn contains_refs(&self) -> bool {
        match self {
            Value::Ref(_) | Value::Region { .. } => true,
            Value::List(items) | Value::Compound(items) => items.iter().any(Value::contains_refs),
            _ => false,
        }
    }

    /// Returns every reference handle in this value, in order.
    pub fn refs(&self) -> Vec<&R> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a R>) {
        match self {
            Value::Ref(r) | Value::Region { target: r, .. } => out.push(r),
            Value::List(items) | Value::Compound(items) => items.iter().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// Rebuilds this value with every reference handle mapped through `f`.
    pub fn try_map_refs<S, E, F>(&self, f: &mut F) -> Result<Value<S>, E>
    where
        F: FnMut(&R) -> Result<S, E>,
    {
        Ok(match self {
            Value::Bool(v) => Value::Bool(*v),
            Value::Int8(v) => Value::Int8(*v),
            Value::Int16(v) => Value::Int16(*v),
            Value::Int32(v) => Value::Int32(*v),
            Value::Int64(v) => Value::Int64(*v),
            Value::UInt8(v) => Value::UInt8(*v),
            Value::UInt16(v) => Value::UInt16(*v),
            Value::UInt32(v) => Value::UInt32(*v),
            Value::UInt64(v) => Value::UInt64(*v),
            Value::Float32(v) => Value::Float32(*v),
            Value::Float64(v) => Value::Float64(*v),
            Value::Text(v) => Value::Text(v.clone()),
            Value::Ascii(v) => Value::Ascii(v.clone()),
            Value::Datetime(t) => Value::Datetime(*t),
            Value::List(items) => Value::List(items.iter().map(|v| v.try_map_refs(f)).collect::<Result<_, _>>()?),
            Value::Compound(items) => {
                Value::Compound(items.iter().map(|v| v.try_map_refs(f)).collect::<Result<_, _>>()?)
            }
            Value::Ref(r) => Value::Ref(f(r)?),
            Value::Region { target, region } => Value::Region {
                target: f(target)?,
                region: region.clone(),
            },
        })
    }

    /// Converts a reference-free value to another handle type.
    ///
    /// Returns `None` if the value contains references.
    pub fn without_refs<S>(&self) -> Option<Value<S>> {
        self.try_map_refs(&mut |_| Err(())).ok()
    }
}

impl PlainValue {
    /// Reads a literal from a parsed spec mapping.
    ///
    /// Integers become `Int64`, other numbers `Float64`; arrays become lists.
    pub fn from_json(json: &serde_json::Value) -> Option<PlainValue> {
        match json {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int64(i)),
                None => match n.as_u64() {
                    Some(u) => Some(Value::UInt64(u)),
                    None => n.as_f64().map(Value::Float64),
                },
            },
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(PlainValue::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl<R> From<$ty> for Value<R> {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    String => Text,
}

impl<R> From<&str> for Value<R> {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<R, T: Into<Value<R>>> From<Vec<T>> for Value<R> {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_synonyms() {
        assert_eq!(Primitive::from_name("double"), Some(Primitive::Float64));
        assert_eq!(Primitive::from_name("float"), Some(Primitive::Float32));
        assert_eq!(Primitive::from_name("utf-8"), Some(Primitive::Text));
        assert_eq!(Primitive::from_name("bytes"), Some(Primitive::Ascii));
        assert_eq!(Primitive::from_name("long"), Some(Primitive::Int64));
        assert_eq!(Primitive::from_name("complex"), None);
        for p in Primitive::ALL {
            assert_eq!(Primitive::from_name(p.name()), Some(p));
        }
    }

    #[test]
    fn test_shape_and_leaves() {
        let v: Value<()> = vec![vec![1i32, 2], vec![3, 4], vec![5, 6]].into();
        assert_eq!(v.shape(), vec![3, 2]);
        let mut leaves = Vec::new();
        v.leaf_primitives(&mut leaves);
        assert_eq!(leaves, vec![Primitive::Int32]);
        assert_eq!(Value::<()>::from(7i32).shape(), Vec::<usize>::new());
    }

    #[test]
    fn test_map_refs() {
        let v: Value<u32> = Value::List(vec![Value::Ref(1), Value::Int32(4), Value::Ref(2)]);
        assert_eq!(v.refs(), vec![&1, &2]);
        let mapped: Value<String> = v.try_map_refs(&mut |r| Ok::<_, ()>(format!("/obj{}", r))).unwrap();
        assert_eq!(
            mapped,
            Value::List(vec![
                Value::Ref("/obj1".to_string()),
                Value::Int32(4),
                Value::Ref("/obj2".to_string()),
            ])
        );
        assert!(v.without_refs::<()>().is_none());
        assert_eq!(Value::<u32>::Int8(3).without_refs::<()>(), Some(Value::Int8(3)));
    }

    #[test]
    fn test_json_literals() {
        let json = serde_json::json!([1, 2.5, "x", true]);
        let v = PlainValue::from_json(&json).unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Int64(1),
                Value::Float64(2.5),
                Value::Text("x".into()),
                Value::Bool(true),
            ])
        );
        assert!(PlainValue::from_json(&serde_json::json!({"a": 1})).is_none());
    }
}
