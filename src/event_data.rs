use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{error::VariantError, Variant, VariantKind};

/// Payload carried by every [`Event`](crate::Event): an ordered mapping from string keys to
/// [`Variant`] values.
///
/// ```
/// # use eventhub::EventData;
/// let data = EventData::new()
///     .with("action", "purchase")
///     .with("context", EventData::new().with("price", 9.99));
/// assert_eq!(data.get_string("action").unwrap(), "purchase");
/// assert_eq!(data.get_path("context.price").unwrap().as_double().unwrap(), 9.99);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(BTreeMap<String, Variant>);

/// How [`EventData::merge`] resolves keys present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Existing values win; only missing keys are added.
    KeepExisting,
    /// Incoming values win. An incoming `null` removes the key.
    Overwrite,
}

impl EventData {
    /// Create an empty map.
    pub fn new() -> EventData {
        EventData::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Variant>) -> EventData {
        self.insert(key, value);
        self
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Variant>) -> Option<Variant> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Variant> {
        self.0.remove(key)
    }

    /// Value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.0.get(key)
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Variant)> {
        self.0.iter()
    }

    /// Look up a nested value by a dotted path (`"context.user.id"`).
    ///
    /// A key that literally contains dots takes precedence over nested traversal.
    pub fn get_path(&self, path: &str) -> Option<&Variant> {
        if let Some(value) = self.0.get(path) {
            return Some(value);
        }
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = current.as_map().ok()?.get(segment)?;
        }
        Some(current)
    }

    fn require(&self, key: &str) -> Result<&Variant, VariantError> {
        self.0
            .get(key)
            .ok_or_else(|| VariantError::NotFound(key.to_owned()))
    }

    /// String value under `key`.
    pub fn get_string(&self, key: &str) -> Result<&str, VariantError> {
        self.require(key)?.as_str()
    }

    /// Boolean value under `key`.
    pub fn get_bool(&self, key: &str) -> Result<bool, VariantError> {
        self.require(key)?.as_bool()
    }

    /// Integer value under `key`, converting longs and doubles in range.
    pub fn get_integer(&self, key: &str) -> Result<i32, VariantError> {
        self.require(key)?.as_integer()
    }

    /// Long value under `key`.
    pub fn get_long(&self, key: &str) -> Result<i64, VariantError> {
        self.require(key)?.as_long()
    }

    /// Double value under `key`.
    pub fn get_double(&self, key: &str) -> Result<f64, VariantError> {
        self.require(key)?.as_double()
    }

    /// List value under `key`.
    pub fn get_list(&self, key: &str) -> Result<&[Variant], VariantError> {
        self.require(key)?.as_list()
    }

    /// Read a nested map as `EventData`.
    pub fn get_map(&self, key: &str) -> Result<EventData, VariantError> {
        Ok(EventData(self.require(key)?.as_map()?.clone()))
    }

    /// String value under `key`, or `default`.
    pub fn get_string_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_string(key).unwrap_or(default)
    }

    /// Boolean value under `key`, or `default`.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Integer value under `key`, or `default`.
    pub fn get_integer_or(&self, key: &str, default: i32) -> i32 {
        self.get_integer(key).unwrap_or(default)
    }

    /// Long value under `key`, or `default`.
    pub fn get_long_or(&self, key: &str, default: i64) -> i64 {
        self.get_long(key).unwrap_or(default)
    }

    /// Double value under `key`, or `default`.
    pub fn get_double_or(&self, key: &str, default: f64) -> f64 {
        self.get_double(key).unwrap_or(default)
    }

    /// Flatten nested maps into dotted keys. Lists and scalars are kept as leaf values.
    ///
    /// `{"a": {"b": 1}, "c": 2}` flattens to `{"a.b": 1, "c": 2}`.
    pub fn flatten(&self) -> BTreeMap<String, Variant> {
        let mut out = BTreeMap::new();
        flatten_into(&mut out, None, &self.0);
        out
    }

    /// Deep-merge `other` into a copy of `self`. Nested maps are merged recursively.
    pub fn merge(&self, other: &EventData, strategy: MergeStrategy) -> EventData {
        EventData(merge_maps(&self.0, &other.0, strategy))
    }

    /// Convert into a map variant.
    pub fn into_variant(self) -> Variant {
        Variant::from(self.0)
    }

    /// Render as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                .collect(),
        )
    }
}

fn flatten_into(
    out: &mut BTreeMap<String, Variant>,
    prefix: Option<&str>,
    map: &BTreeMap<String, Variant>,
) {
    for (key, value) in map {
        let full_key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value.as_map() {
            Ok(nested) if !nested.is_empty() => flatten_into(out, Some(&full_key), nested),
            _ => {
                out.insert(full_key, value.clone());
            }
        }
    }
}

fn merge_maps(
    base: &BTreeMap<String, Variant>,
    incoming: &BTreeMap<String, Variant>,
    strategy: MergeStrategy,
) -> BTreeMap<String, Variant> {
    let mut merged = base.clone();
    for (key, value) in incoming {
        match (merged.get(key), strategy) {
            (Some(existing), _)
                if existing.kind() == VariantKind::Map && value.kind() == VariantKind::Map =>
            {
                let nested = merge_maps(
                    existing.as_map().unwrap_or(&BTreeMap::new()),
                    value.as_map().unwrap_or(&BTreeMap::new()),
                    strategy,
                );
                merged.insert(key.clone(), Variant::from(nested));
            }
            (Some(_), MergeStrategy::KeepExisting) => {}
            (_, MergeStrategy::Overwrite) if value.is_null() => {
                merged.remove(key);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

impl From<BTreeMap<String, Variant>> for EventData {
    fn from(value: BTreeMap<String, Variant>) -> Self {
        EventData(value)
    }
}

impl From<EventData> for Variant {
    fn from(value: EventData) -> Self {
        value.into_variant()
    }
}

impl TryFrom<Variant> for EventData {
    type Error = VariantError;

    fn try_from(value: Variant) -> Result<Self, Self::Error> {
        Ok(EventData(value.as_map()?.clone()))
    }
}

impl TryFrom<serde_json::Value> for EventData {
    type Error = VariantError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        EventData::try_from(Variant::try_from(value)?)
    }
}

impl<K: Into<String>, V: Into<Variant>> FromIterator<(K, V)> for EventData {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        EventData(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{EventData, MergeStrategy};
    use crate::{error::VariantError, Variant, VariantKind};

    fn sample() -> EventData {
        EventData::new()
            .with("action", "purchase")
            .with("count", 3)
            .with(
                "context",
                EventData::new()
                    .with("price", 9.5)
                    .with("user", EventData::new().with("id", "u1")),
            )
    }

    #[test]
    fn typed_accessors() {
        let data = sample();
        assert_eq!(data.get_string("action"), Ok("purchase"));
        assert_eq!(data.get_long("count"), Ok(3));
        assert_eq!(
            data.get_bool("action"),
            Err(VariantError::TypeMismatch {
                expected: VariantKind::Boolean,
                found: VariantKind::String
            })
        );
        assert_eq!(data.get_string("missing"), Err(VariantError::NotFound("missing".into())));
        assert_eq!(data.get_integer_or("missing", 7), 7);
        assert_eq!(data.get_map("context").unwrap().get_double("price"), Ok(9.5));
    }

    #[test]
    fn dotted_path_lookup() {
        let data = sample().with("literal.key", true);
        assert_eq!(data.get_path("context.user.id"), Some(&Variant::from("u1")));
        assert_eq!(data.get_path("literal.key"), Some(&Variant::from(true)));
        assert_eq!(data.get_path("context.missing"), None);
        assert_eq!(data.get_path("action.nested"), None);
    }

    #[test]
    fn flatten_uses_dotted_keys() {
        let flat = sample().flatten();
        let keys: Vec<_> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, ["action", "context.price", "context.user.id", "count"]);
    }

    #[test]
    fn merge_keep_existing() {
        let base = EventData::new()
            .with("a", 1)
            .with("nested", EventData::new().with("x", 1));
        let incoming = EventData::new()
            .with("a", 2)
            .with("b", 3)
            .with("nested", EventData::new().with("x", 2).with("y", 2));
        let merged = base.merge(&incoming, MergeStrategy::KeepExisting);
        assert_eq!(merged.get_integer("a"), Ok(1));
        assert_eq!(merged.get_integer("b"), Ok(3));
        assert_eq!(merged.get_path("nested.x"), Some(&Variant::from(1)));
        assert_eq!(merged.get_path("nested.y"), Some(&Variant::from(2)));
    }

    #[test]
    fn merge_overwrite_removes_nulls() {
        let base = EventData::new().with("a", 1).with("b", 2);
        let incoming = EventData::new().with("a", 5).with("b", Variant::null());
        let merged = base.merge(&incoming, MergeStrategy::Overwrite);
        assert_eq!(merged.get_integer("a"), Ok(5));
        assert!(!merged.contains_key("b"));
        // The original is untouched.
        assert_eq!(base.get_integer("b"), Ok(2));
    }

    #[test]
    fn parses_from_json() {
        let data: EventData = serde_json::from_str(r#"{"k": [1, null], "m": {"n": "v"}}"#).unwrap();
        assert_eq!(data.get_list("k").unwrap()[1], Variant::null());
        assert_eq!(data.to_json()["m"]["n"], "v");
    }
}
