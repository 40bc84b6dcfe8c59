//! Tagged value type used to exchange data between modules that do not share compile-time types.
use std::collections::BTreeMap;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VariantError;

/// Largest magnitude a [`VariantKind::Long`] may hold. Values within `±2^53` survive a round-trip
/// through `f64` (and therefore through JSON) without losing precision.
pub const MAX_SAFE_LONG: i64 = 1 << 53;

/// Kind of value stored in a [`Variant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum VariantKind {
    Null,
    Boolean,
    Integer,
    Long,
    Double,
    String,
    Map,
    List,
}

/// Immutable tagged union of `null`, booleans, numbers, strings, maps and lists.
///
/// Containers own their elements, so a clone never shares backing storage with the original.
/// `Null` entries inside maps and lists are stored as the explicit [`Variant::null`] value.
///
/// ```
/// # use eventhub::{Variant, VariantKind};
/// let v = Variant::from("hello");
/// assert_eq!(v.kind(), VariantKind::String);
/// assert_eq!(Variant::from(42).convert_to_string(), "42");
/// assert!(Variant::long(1 << 60).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Variant(Repr);

#[derive(Debug, Clone, Default)]
enum Repr {
    #[default]
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
    Map(BTreeMap<String, Variant>),
    List(Vec<Variant>),
}

impl Variant {
    /// The `null` value.
    pub const fn null() -> Variant {
        Variant(Repr::Null)
    }

    /// Boolean variant.
    pub const fn boolean(value: bool) -> Variant {
        Variant(Repr::Boolean(value))
    }

    /// 32-bit integer variant.
    pub const fn integer(value: i32) -> Variant {
        Variant(Repr::Integer(value))
    }

    /// Create a long variant.
    ///
    /// # Errors
    ///
    /// Returns [`VariantError::Range`] if `value` is outside of `±2^53`.
    pub fn long(value: i64) -> Result<Variant, VariantError> {
        if (-MAX_SAFE_LONG..=MAX_SAFE_LONG).contains(&value) {
            Ok(Variant(Repr::Long(value)))
        } else {
            Err(VariantError::Range(VariantKind::Long))
        }
    }

    /// Double variant.
    pub const fn double(value: f64) -> Variant {
        Variant(Repr::Double(value))
    }

    /// String variant.
    pub fn string(value: impl Into<String>) -> Variant {
        Variant(Repr::String(value.into()))
    }

    /// Map variant built from key-value pairs.
    pub fn map<K: Into<String>, V: Into<Variant>>(
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Variant {
        Variant(Repr::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// List variant.
    pub fn list<V: Into<Variant>>(items: impl IntoIterator<Item = V>) -> Variant {
        Variant(Repr::List(items.into_iter().map(Into::into).collect()))
    }

    /// Kind of the stored value.
    pub fn kind(&self) -> VariantKind {
        match &self.0 {
            Repr::Null => VariantKind::Null,
            Repr::Boolean(_) => VariantKind::Boolean,
            Repr::Integer(_) => VariantKind::Integer,
            Repr::Long(_) => VariantKind::Long,
            Repr::Double(_) => VariantKind::Double,
            Repr::String(_) => VariantKind::String,
            Repr::Map(_) => VariantKind::Map,
            Repr::List(_) => VariantKind::List,
        }
    }

    /// Returns `true` for the null variant.
    pub fn is_null(&self) -> bool {
        matches!(self.0, Repr::Null)
    }

    /// Return `true` for integer, long, and double variants.
    pub fn is_number(&self) -> bool {
        matches!(self.0, Repr::Integer(_) | Repr::Long(_) | Repr::Double(_))
    }

    /// Boolean value, without conversion.
    pub fn as_bool(&self) -> Result<bool, VariantError> {
        match self.0 {
            Repr::Boolean(b) => Ok(b),
            _ => Err(self.mismatch(VariantKind::Boolean)),
        }
    }

    /// Read the value as `i32`, narrowing longs and truncating doubles.
    ///
    /// # Errors
    ///
    /// [`VariantError::Range`] if the number does not fit, [`VariantError::TypeMismatch`] if the
    /// variant is not a number.
    pub fn as_integer(&self) -> Result<i32, VariantError> {
        let range = || VariantError::Range(VariantKind::Integer);
        match self.0 {
            Repr::Integer(i) => Ok(i),
            Repr::Long(l) => i32::try_from(l).map_err(|_| range()),
            Repr::Double(d) => {
                let t = d.trunc();
                if t.is_finite() && t >= f64::from(i32::MIN) && t <= f64::from(i32::MAX) {
                    Ok(t as i32)
                } else {
                    Err(range())
                }
            }
            _ => Err(self.mismatch(VariantKind::Integer)),
        }
    }

    /// Read the value as `i64`, widening integers and truncating doubles.
    ///
    /// # Errors
    ///
    /// [`VariantError::Range`] if a double is outside of `±2^53`, [`VariantError::TypeMismatch`]
    /// if the variant is not a number.
    pub fn as_long(&self) -> Result<i64, VariantError> {
        match self.0 {
            Repr::Integer(i) => Ok(i64::from(i)),
            Repr::Long(l) => Ok(l),
            Repr::Double(d) => {
                let t = d.trunc();
                if t.is_finite() && t.abs() <= MAX_SAFE_LONG as f64 {
                    Ok(t as i64)
                } else {
                    Err(VariantError::Range(VariantKind::Long))
                }
            }
            _ => Err(self.mismatch(VariantKind::Long)),
        }
    }

    /// Double value, converting integers and longs.
    pub fn as_double(&self) -> Result<f64, VariantError> {
        match self.0 {
            Repr::Integer(i) => Ok(f64::from(i)),
            // Longs are range-restricted, so the conversion is lossless.
            Repr::Long(l) => Ok(l as f64),
            Repr::Double(d) => Ok(d),
            _ => Err(self.mismatch(VariantKind::Double)),
        }
    }

    /// String value, without conversion.
    pub fn as_str(&self) -> Result<&str, VariantError> {
        match &self.0 {
            Repr::String(s) => Ok(s),
            _ => Err(self.mismatch(VariantKind::String)),
        }
    }

    /// Map entries, without conversion.
    pub fn as_map(&self) -> Result<&BTreeMap<String, Variant>, VariantError> {
        match &self.0 {
            Repr::Map(m) => Ok(m),
            _ => Err(self.mismatch(VariantKind::Map)),
        }
    }

    /// List items, without conversion.
    pub fn as_list(&self) -> Result<&[Variant], VariantError> {
        match &self.0 {
            Repr::List(l) => Ok(l),
            _ => Err(self.mismatch(VariantKind::List)),
        }
    }

    /// Canonical string rendering. Never fails.
    ///
    /// Numbers use the shortest representation that round-trips (`2.0` renders as `"2"`), maps and
    /// lists render as JSON.
    pub fn convert_to_string(&self) -> String {
        match &self.0 {
            Repr::Null => "null".to_owned(),
            Repr::Boolean(b) => b.to_string(),
            Repr::Integer(i) => i.to_string(),
            Repr::Long(l) => l.to_string(),
            Repr::Double(d) => d.to_string(),
            Repr::String(s) => s.clone(),
            Repr::Map(_) | Repr::List(_) => serde_json::Value::from(self).to_string(),
        }
    }

    /// Numeric rendering. Never fails: booleans map to `1`/`0`, numeric strings are parsed, and
    /// everything else is `NaN`.
    pub fn convert_to_double(&self) -> f64 {
        match &self.0 {
            Repr::Boolean(b) => f64::from(u8::from(*b)),
            Repr::Integer(_) | Repr::Long(_) | Repr::Double(_) => {
                self.as_double().unwrap_or(f64::NAN)
            }
            Repr::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Repr::Null | Repr::Map(_) | Repr::List(_) => f64::NAN,
        }
    }

    fn mismatch(&self, expected: VariantKind) -> VariantError {
        VariantError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }
}

/// Structural equality. Integer and long variants holding the same number are equal, so values
/// survive a JSON round-trip (which cannot tell the two apart).
impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Null, Repr::Null) => true,
            (Repr::Boolean(a), Repr::Boolean(b)) => a == b,
            (Repr::Integer(a), Repr::Integer(b)) => a == b,
            (Repr::Long(a), Repr::Long(b)) => a == b,
            (Repr::Integer(a), Repr::Long(b)) | (Repr::Long(b), Repr::Integer(a)) => {
                i64::from(*a) == *b
            }
            (Repr::Double(a), Repr::Double(b)) => a == b,
            (Repr::String(a), Repr::String(b)) => a == b,
            (Repr::Map(a), Repr::Map(b)) => a == b,
            (Repr::List(a), Repr::List(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.convert_to_string())
    }
}

impl log::kv::ToValue for Variant {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::boolean(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Variant::integer(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::double(value)
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant(Repr::String(value))
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant(Repr::String(value.to_owned()))
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(value: Vec<Variant>) -> Self {
        Variant(Repr::List(value))
    }
}

impl From<BTreeMap<String, Variant>> for Variant {
    fn from(value: BTreeMap<String, Variant>) -> Self {
        Variant(Repr::Map(value))
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(Variant::null, Into::into)
    }
}

impl TryFrom<i64> for Variant {
    type Error = VariantError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Variant::long(value)
    }
}

impl TryFrom<serde_json::Value> for Variant {
    type Error = VariantError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        Ok(match value {
            Value::Null => Variant::null(),
            Value::Bool(b) => Variant::boolean(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(i) => Variant::integer(i),
                        Err(_) => Variant::long(i)?,
                    }
                } else if n.is_u64() {
                    return Err(VariantError::Range(VariantKind::Long));
                } else {
                    Variant::double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Variant::string(s),
            Value::Array(items) => Variant(Repr::List(
                items
                    .into_iter()
                    .map(Variant::try_from)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(entries) => Variant(Repr::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, Variant::try_from(v)?)))
                    .collect::<Result<_, VariantError>>()?,
            )),
        })
    }
}

impl From<&Variant> for serde_json::Value {
    fn from(value: &Variant) -> Self {
        use serde_json::Value;

        match &value.0 {
            Repr::Null => Value::Null,
            Repr::Boolean(b) => Value::Bool(*b),
            Repr::Integer(i) => Value::from(*i),
            Repr::Long(l) => Value::from(*l),
            // Non-finite doubles have no JSON representation.
            Repr::Double(d) => serde_json::Number::from_f64(*d).map_or(Value::Null, Value::Number),
            Repr::String(s) => Value::String(s.clone()),
            Repr::Map(m) => Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
            Repr::List(l) => Value::Array(l.iter().map(Value::from).collect()),
        }
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            Repr::Null => serializer.serialize_unit(),
            Repr::Boolean(b) => serializer.serialize_bool(*b),
            Repr::Integer(i) => serializer.serialize_i32(*i),
            Repr::Long(l) => serializer.serialize_i64(*l),
            Repr::Double(d) => serializer.serialize_f64(*d),
            Repr::String(s) => serializer.serialize_str(s),
            Repr::Map(m) => m.serialize(serializer),
            Repr::List(l) => l.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Variant::try_from(value).map_err(D::Error::custom)
    }
}
