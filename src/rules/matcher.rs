use std::cmp::Ordering;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Variant, VariantKind};

/// Comparison operator of a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherOperator {
    /// `eq`: equal to any of the values.
    Equals,
    /// `ne`: present and equal to none of the values.
    NotEquals,
    /// `gt`
    GreaterThan,
    /// `ge`
    GreaterThanOrEqual,
    /// `lt`
    LessThan,
    /// `le`
    LessThanOrEqual,
    /// `co`: contains any of the values as a case-insensitive substring.
    Contains,
    /// `nc`: present and contains none of the values.
    NotContains,
    /// `sw`: case-insensitive prefix.
    StartsWith,
    /// `ew`: case-insensitive suffix.
    EndsWith,
    /// `ex`: present and not null.
    Exists,
    /// `nx`: absent or null.
    NotExists,
    /// Any unrecognized operator tag. Never matches.
    Unknown,
}

impl MatcherOperator {
    /// Operator for a wire tag. Unrecognized tags map to [`MatcherOperator::Unknown`].
    pub fn from_tag(tag: &str) -> MatcherOperator {
        match tag {
            "eq" => MatcherOperator::Equals,
            "ne" => MatcherOperator::NotEquals,
            "gt" => MatcherOperator::GreaterThan,
            "ge" => MatcherOperator::GreaterThanOrEqual,
            "lt" => MatcherOperator::LessThan,
            "le" => MatcherOperator::LessThanOrEqual,
            "co" => MatcherOperator::Contains,
            "nc" => MatcherOperator::NotContains,
            "sw" => MatcherOperator::StartsWith,
            "ew" => MatcherOperator::EndsWith,
            "ex" => MatcherOperator::Exists,
            "nx" => MatcherOperator::NotExists,
            _ => MatcherOperator::Unknown,
        }
    }

    /// Operator tag as written in rule definitions.
    pub fn as_tag(&self) -> &'static str {
        match self {
            MatcherOperator::Equals => "eq",
            MatcherOperator::NotEquals => "ne",
            MatcherOperator::GreaterThan => "gt",
            MatcherOperator::GreaterThanOrEqual => "ge",
            MatcherOperator::LessThan => "lt",
            MatcherOperator::LessThanOrEqual => "le",
            MatcherOperator::Contains => "co",
            MatcherOperator::NotContains => "nc",
            MatcherOperator::StartsWith => "sw",
            MatcherOperator::EndsWith => "ew",
            MatcherOperator::Exists => "ex",
            MatcherOperator::NotExists => "nx",
            MatcherOperator::Unknown => "unknown",
        }
    }

    /// Apply the operator to a resolved value and the candidate values. Returns `false` if the
    /// operator cannot be applied.
    pub fn eval(&self, value: Option<&Variant>, candidates: &[Variant]) -> bool {
        self.try_eval(value, candidates).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` if it cannot be applied.
    fn try_eval(&self, value: Option<&Variant>, candidates: &[Variant]) -> Option<bool> {
        let value = value.filter(|value| !value.is_null());

        match self {
            Self::Exists => Some(value.is_some()),
            Self::NotExists => Some(value.is_none()),
            Self::Unknown => None,

            Self::Equals => {
                let value = value?;
                Some(candidates.iter().any(|c| loose_eq(value, c) == Some(true)))
            }
            Self::NotEquals => {
                let value = value?;
                Some(!candidates.iter().any(|c| loose_eq(value, c) == Some(true)))
            }

            Self::GreaterThan | Self::GreaterThanOrEqual | Self::LessThan | Self::LessThanOrEqual => {
                let value = value?;
                Some(candidates.iter().any(|candidate| {
                    let Some(ordering) = loose_cmp(value, candidate) else {
                        return false;
                    };
                    match self {
                        Self::GreaterThan => ordering == Ordering::Greater,
                        Self::GreaterThanOrEqual => ordering != Ordering::Less,
                        Self::LessThan => ordering == Ordering::Less,
                        Self::LessThanOrEqual => ordering != Ordering::Greater,
                        // unreachable
                        _ => false,
                    }
                }))
            }

            Self::Contains | Self::NotContains | Self::StartsWith | Self::EndsWith => {
                let value = text_of(value?)?;
                let found = candidates.iter().filter_map(text_of).any(|candidate| match self {
                    Self::StartsWith => value.starts_with(&candidate),
                    Self::EndsWith => value.ends_with(&candidate),
                    _ => value.contains(&candidate),
                });
                Some(if matches!(self, Self::NotContains) {
                    !found
                } else {
                    found
                })
            }
        }
    }
}

impl Serialize for MatcherOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for MatcherOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(MatcherOperator::from_tag(&tag))
    }
}

/// Lower-cased text of a string or number. Other kinds have no text form for matching.
fn text_of(value: &Variant) -> Option<String> {
    if let Ok(s) = value.as_str() {
        Some(s.to_lowercase())
    } else if value.is_number() {
        Some(value.convert_to_string())
    } else {
        None
    }
}

/// Normalized boolean: booleans, `0`/`1`, and `"true"`/`"false"`/`"1"`/`"0"`.
fn as_loose_bool(value: &Variant) -> Option<bool> {
    match value.kind() {
        VariantKind::Boolean => value.as_bool().ok(),
        VariantKind::Integer | VariantKind::Long | VariantKind::Double => {
            let n = value.as_double().ok()?;
            if n == 1.0 {
                Some(true)
            } else if n == 0.0 {
                Some(false)
            } else {
                None
            }
        }
        VariantKind::String => match value.as_str().ok()?.trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Numeric value of a number or numeric string.
fn as_loose_number(value: &Variant) -> Option<f64> {
    if value.is_number() {
        return value.as_double().ok();
    }
    let n = value.as_str().ok()?.trim().parse::<f64>().ok()?;
    (!n.is_nan()).then_some(n)
}

/// Equality with coercion. `None` means the values cannot be compared.
fn loose_eq(value: &Variant, candidate: &Variant) -> Option<bool> {
    let is_bool = |v: &Variant| v.kind() == VariantKind::Boolean;
    if is_bool(value) || is_bool(candidate) {
        return Some(as_loose_bool(value)? == as_loose_bool(candidate)?);
    }
    loose_cmp(value, candidate).map(|ordering| ordering == Ordering::Equal)
}

/// Ordering with coercion: two strings compare case-insensitively; a number against a number or
/// numeric string compares numerically. `None` means the values cannot be compared.
fn loose_cmp(value: &Variant, candidate: &Variant) -> Option<Ordering> {
    match (value.as_str(), candidate.as_str()) {
        (Ok(a), Ok(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => {
            if !value.is_number() && !candidate.is_number() {
                return None;
            }
            as_loose_number(value)?.partial_cmp(&as_loose_number(candidate)?)
        }
    }
}

/// Leaf of a condition tree: a key resolved against the event plus an operator and candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    pub(crate) key: String,
    pub(crate) operator: MatcherOperator,
    pub(crate) values: Vec<Variant>,
}

impl Matcher {
    /// Create a matcher comparing the value at `key` with `values`.
    pub fn new(
        key: impl Into<String>,
        operator: MatcherOperator,
        values: impl IntoIterator<Item = Variant>,
    ) -> Matcher {
        Matcher {
            key: key.into(),
            operator,
            values: values.into_iter().collect(),
        }
    }

    /// Data key, or token path, the matcher reads.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Comparison operator.
    pub fn operator(&self) -> MatcherOperator {
        self.operator
    }

    /// Values compared against; any one matching is enough.
    pub fn values(&self) -> &[Variant] {
        &self.values
    }

    /// Whether an already resolved value matches.
    pub fn matches(&self, value: impl Into<Variant>) -> bool {
        let value = value.into();
        self.operator.eval(Some(&value), &self.values)
    }
}
