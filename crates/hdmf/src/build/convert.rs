//! Dtype conversion policy.
//!
//! Which (given, spec) primitive pairs may be stored and what they become is
//! a table, not a rule. The default table treats the spec dtype as a
//! minimum: a value of a wider type of the same family keeps its own type,
//! a narrower one is upcast (with a warning). Unsigned values widen into
//! signed specs, integers go into float specs as floats of at least 32 bits,
//! and floats never silently become integers.
//!
//! ```text
//! given    spec     result
//! int8     int32    int32     (upcast, warned)
//! int64    int32    int64     (kept)
//! uint8    int16    int16
//! int16    float32  float32
//! int64    float32  float64
//! float64  int32    error     (unless narrowing is allowed and the value is whole)
//! ascii    text     text
//! text     isodatetime  isodatetime (parsed)
//! ```

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::error::ConversionError;
use crate::model::value::{DType, Primitive, PrimitiveClass, Timestamp, Value};
use crate::spec::ShapeSpec;

/// The built-in rule for storing a `given` value in a `spec` field.
pub fn default_rule(given: Primitive, spec: Primitive) -> Option<Primitive> {
    use PrimitiveClass as C;
    if given == spec {
        return Some(spec);
    }
    let size = given.size().max(spec.size());
    match (given.class(), spec.class()) {
        (C::Signed, C::Signed) | (C::Unsigned, C::Unsigned) | (C::Float, C::Float) => {
            Primitive::sized(spec.class(), size)
        }
        (C::Unsigned, C::Signed) => Primitive::sized(C::Signed, spec.size().max((given.size() * 2).min(8))),
        (C::Signed, C::Unsigned) => Primitive::sized(C::Unsigned, size),
        (C::Signed | C::Unsigned, C::Float) => Primitive::sized(C::Float, size.max(4)),
        (C::Ascii, C::Text) => Some(Primitive::Text),
        (C::Text, C::Ascii) => Some(Primitive::Ascii),
        (C::Text, C::Datetime) => Some(Primitive::IsoDatetime),
        _ => None,
    }
}

lazy_static! {
    /// Allowed (given, spec) pairs and the primitive they are stored as.
    static ref DEFAULT_RULES: FxHashMap<(Primitive, Primitive), Primitive> = {
        let mut m = FxHashMap::default();
        for given in Primitive::ALL {
            for spec in Primitive::ALL {
                if let Some(result) = default_rule(given, spec) {
                    m.insert((given, spec), result);
                }
            }
        }
        m
    };
}

/// Table of allowed conversions plus the narrowing switch.
#[derive(Debug, Clone, Default)]
pub struct ConversionPolicy {
    overrides: FxHashMap<(Primitive, Primitive), Option<Primitive>>,
    allow_narrowing: bool,
}

impl ConversionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `given` values into `spec` fields, stored as `result`.
    pub fn allow(mut self, given: Primitive, spec: Primitive, result: Primitive) -> Self {
        self.overrides.insert((given, spec), Some(result));
        self
    }

    /// Rejects `given` values in `spec` fields.
    pub fn deny(mut self, given: Primitive, spec: Primitive) -> Self {
        self.overrides.insert((given, spec), None);
        self
    }

    /// Lets whole-valued floats be stored in integer fields.
    pub fn with_narrowing(mut self, allow: bool) -> Self {
        self.allow_narrowing = allow;
        self
    }

    pub fn allows_narrowing(&self) -> bool {
        self.allow_narrowing
    }

    /// The primitive a `given` value is stored as in a `spec` field, if allowed.
    pub fn resolve(&self, given: Primitive, spec: Primitive) -> Option<Primitive> {
        match self.overrides.get(&(given, spec)) {
            Some(rule) => *rule,
            None => DEFAULT_RULES.get(&(given, spec)).copied(),
        }
    }

    fn target(&self, given: Primitive, spec: Primitive, path: &str) -> Result<Primitive, ConversionError> {
        if let Some(result) = self.resolve(given, spec) {
            return Ok(result);
        }
        let narrowing = given.class() == PrimitiveClass::Float
            && matches!(spec.class(), PrimitiveClass::Signed | PrimitiveClass::Unsigned);
        if narrowing && self.allow_narrowing {
            return Ok(spec);
        }
        Err(ConversionError::Incompatible {
            path: path.to_string(),
            from: given.name().to_string(),
            to: spec.name().to_string(),
        })
    }

    /// Converts `value` to fit `dtype`.
    ///
    /// With no dtype the value is returned unchanged. Reference dtypes only
    /// check that the value holds references; compound dtypes convert each
    /// column of each row.
    pub fn convert<R: Clone>(
        &self,
        value: &Value<R>,
        dtype: Option<&DType>,
        path: &str,
    ) -> Result<Value<R>, ConversionError> {
        match dtype {
            None => Ok(value.clone()),
            Some(DType::Reference { .. }) => {
                if is_all_refs(value) {
                    Ok(value.clone())
                } else {
                    Err(ConversionError::ExpectedReference { path: path.to_string() })
                }
            }
            Some(DType::Compound(fields)) => self.convert_compound(value, fields, path),
            Some(DType::Numeric) => {
                let mut leaves = Vec::new();
                value.leaf_primitives(&mut leaves);
                match leaves.iter().find(|p| !p.is_numeric()) {
                    Some(p) => Err(ConversionError::Incompatible {
                        path: path.to_string(),
                        from: p.name().to_string(),
                        to: "numeric".to_string(),
                    }),
                    None => Ok(value.clone()),
                }
            }
            Some(DType::Primitive(spec)) => {
                let mut leaves = Vec::new();
                value.leaf_primitives(&mut leaves);
                if value.contains_refs() {
                    return Err(ConversionError::Incompatible {
                        path: path.to_string(),
                        from: "reference".to_string(),
                        to: spec.name().to_string(),
                    });
                }
                let mut target: Option<Primitive> = None;
                for &given in &leaves {
                    let t = self.target(given, *spec, path)?;
                    target = Some(match target {
                        Some(prev) => unify(prev, t),
                        None => t,
                    });
                }
                let Some(target) = target else {
                    return Ok(value.clone());
                };
                if let Some(from) = leaves.iter().find(|&&g| g != target) {
                    warn!(path, from = %from, to = %target, "value converted to match the spec dtype");
                }
                cast(value, target, self.allow_narrowing, path)
            }
        }
    }

    fn convert_compound<R: Clone>(
        &self,
        value: &Value<R>,
        fields: &[crate::model::value::CompoundField],
        path: &str,
    ) -> Result<Value<R>, ConversionError> {
        match value {
            Value::List(rows) => Ok(Value::List(
                rows.iter()
                    .map(|row| self.convert_compound(row, fields, path))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Compound(columns) => {
                if columns.len() != fields.len() {
                    return Err(ConversionError::CompoundArity {
                        path: path.to_string(),
                        expected: fields.len(),
                        actual: columns.len(),
                    });
                }
                let mut out = Vec::with_capacity(columns.len());
                for (column, field) in columns.iter().zip(fields) {
                    out.push(self.convert(column, Some(&field.dtype), &format!("{}.{}", path, field.name))?);
                }
                Ok(Value::Compound(out))
            }
            other => Err(ConversionError::Incompatible {
                path: path.to_string(),
                from: other.type_name(),
                to: "compound".to_string(),
            }),
        }
    }
}

fn is_all_refs<R>(value: &Value<R>) -> bool {
    match value {
        Value::Ref(_) | Value::Region { .. } => true,
        Value::List(items) => items.iter().all(is_all_refs),
        _ => false,
    }
}

/// Common storage type of two conversion results.
fn unify(a: Primitive, b: Primitive) -> Primitive {
    use PrimitiveClass as C;
    if a == b {
        return a;
    }
    let size = a.size().max(b.size());
    let class = match (a.class(), b.class()) {
        (x, y) if x == y => x,
        (C::Float, _) | (_, C::Float) => C::Float,
        (C::Signed, C::Unsigned) | (C::Unsigned, C::Signed) => C::Signed,
        (C::Text, C::Ascii) | (C::Ascii, C::Text) => return Primitive::Text,
        _ => return a,
    };
    Primitive::sized(class, size).unwrap_or(a)
}

fn cast<R: Clone>(value: &Value<R>, target: Primitive, narrowing: bool, path: &str) -> Result<Value<R>, ConversionError> {
    if let Value::List(items) = value {
        return Ok(Value::List(
            items
                .iter()
                .map(|v| cast(v, target, narrowing, path))
                .collect::<Result<_, _>>()?,
        ));
    }
    if value.primitive() == Some(target) {
        return Ok(value.clone());
    }
    let incompatible = || ConversionError::Incompatible {
        path: path.to_string(),
        from: value.type_name(),
        to: target.name().to_string(),
    };
    match target.class() {
        PrimitiveClass::Signed | PrimitiveClass::Unsigned => {
            let int = match (value.as_integer(), value) {
                (Some(i), _) => i,
                (None, Value::Bool(b)) => *b as i128,
                (None, Value::Float32(_) | Value::Float64(_)) => {
                    let f = value.as_f64().unwrap_or(f64::NAN);
                    if !narrowing || f.fract() != 0.0 || !f.is_finite() {
                        return Err(ConversionError::Narrowing {
                            path: path.to_string(),
                            value: f.to_string(),
                            to: target.name(),
                        });
                    }
                    f as i128
                }
                _ => return Err(incompatible()),
            };
            int_value(int, target).ok_or_else(|| ConversionError::OutOfRange {
                path: path.to_string(),
                value: int.to_string(),
                to: target.name(),
            })
        }
        PrimitiveClass::Float => {
            let f = value.as_f64().ok_or_else(incompatible)?;
            Ok(match target {
                Primitive::Float32 => Value::Float32(f as f32),
                _ => Value::Float64(f),
            })
        }
        PrimitiveClass::Text => match value {
            Value::Ascii(bytes) => Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
            _ => Err(incompatible()),
        },
        PrimitiveClass::Ascii => match value {
            Value::Text(s) if s.is_ascii() => Ok(Value::Ascii(s.as_bytes().to_vec())),
            Value::Text(s) => Err(ConversionError::Incompatible {
                path: path.to_string(),
                from: format!("non-ascii text {:?}", s),
                to: "ascii".to_string(),
            }),
            _ => Err(incompatible()),
        },
        PrimitiveClass::Datetime => match value {
            Value::Text(s) => {
                let stamp = Timestamp::parse(s).map_err(|e| ConversionError::InvalidDatetime {
                    path: path.to_string(),
                    value: s.clone(),
                    message: e.message,
                })?;
                Ok(Value::Datetime(stamp))
            }
            _ => Err(incompatible()),
        },
        PrimitiveClass::Bool => Err(incompatible()),
    }
}

fn int_value<R>(v: i128, target: Primitive) -> Option<Value<R>> {
    Some(match target {
        Primitive::Int8 => Value::Int8(i8::try_from(v).ok()?),
        Primitive::Int16 => Value::Int16(i16::try_from(v).ok()?),
        Primitive::Int32 => Value::Int32(i32::try_from(v).ok()?),
        Primitive::Int64 => Value::Int64(i64::try_from(v).ok()?),
        Primitive::UInt8 => Value::UInt8(u8::try_from(v).ok()?),
        Primitive::UInt16 => Value::UInt16(u16::try_from(v).ok()?),
        Primitive::UInt32 => Value::UInt32(u32::try_from(v).ok()?),
        Primitive::UInt64 => Value::UInt64(u64::try_from(v).ok()?),
        _ => return None,
    })
}

/// Checks the shape of `value` against the allowed shapes.
///
/// Scalars pass when no shape is declared, or when a one-dimensional shape
/// of length one (or any length) is allowed.
pub fn check_shape<R>(value: &Value<R>, shape: Option<&ShapeSpec>, path: &str) -> Result<(), ConversionError> {
    let Some(options) = shape else {
        return Ok(());
    };
    let actual = value.shape();
    let fits = |dims: &Vec<Option<u64>>| {
        if actual.is_empty() {
            return dims.len() == 1 && dims[0].is_none_or(|n| n == 1);
        }
        dims.len() == actual.len() && dims.iter().zip(&actual).all(|(d, &a)| d.is_none_or(|n| n == a as u64))
    };
    if options.is_empty() || options.iter().any(fits) {
        Ok(())
    } else {
        Err(ConversionError::ShapeMismatch {
            path: path.to_string(),
            expected: options[0].clone(),
            actual,
        })
    }
}
