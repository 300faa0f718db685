//! Field accumulation for a single push request
//!
//! Every decoder writes into one [`FieldAccumulator`]. Each field is indexed
//! under its trimmed key, its canonical key and its simplified key, so alias
//! lookups match `licensePlate`, `license_plate` and `results[0].plate` alike.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which decoding path produced a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOrigin {
    Query,
    Json,
    Form,
    Text,
    Regex,
}

impl FieldOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldOrigin::Query => "query",
            FieldOrigin::Json => "json",
            FieldOrigin::Form => "form",
            FieldOrigin::Text => "text",
            FieldOrigin::Regex => "regex",
        }
    }
}

impl std::fmt::Display for FieldOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded field
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedField {
    /// Key as it appeared in the payload, trimmed
    pub key: String,

    /// Lowercased key with non-alphanumerics removed
    pub canonical_key: String,

    /// Canonical form of the last path segment, index suffix stripped
    pub simplified_key: String,

    pub value: String,

    pub origin: FieldOrigin,
}

/// Request-local, case-insensitive field store with last-writer-wins lookup
#[derive(Debug, Default)]
pub struct FieldAccumulator {
    fields: Vec<AccumulatedField>,
    /// Lowercased original key → slot, decides in-place replacement
    slots: HashMap<String, usize>,
    /// Every lookup key (original, canonical, simplified) → latest slot
    index: HashMap<String, usize>,
}

impl FieldAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field. Empty keys and absent values are ignored.
    pub fn set(&mut self, key: &str, value: Option<&str>, origin: FieldOrigin) {
        let key = key.trim();
        let Some(value) = value else {
            return;
        };
        if key.is_empty() {
            return;
        }

        let field = AccumulatedField {
            key: key.to_string(),
            canonical_key: canonical_key(key),
            simplified_key: canonical_key(&simplified_key(key)),
            value: value.to_string(),
            origin,
        };

        // Same original key (ignoring case) replaces in place so exports
        // keep a single entry per key.
        let original = key.to_lowercase();
        let slot = match self.slots.get(&original) {
            Some(&i) => {
                self.fields[i] = field;
                i
            }
            None => {
                self.fields.push(field);
                let slot = self.fields.len() - 1;
                self.slots.insert(original.clone(), slot);
                slot
            }
        };

        let entry = &self.fields[slot];
        let lookup_keys = [
            original,
            entry.canonical_key.clone(),
            entry.simplified_key.clone(),
        ];
        for lookup in lookup_keys {
            if !lookup.is_empty() {
                self.index.insert(lookup, slot);
            }
        }
    }

    /// Return the value and origin of the first alias that matches
    pub fn find<S: AsRef<str>>(&self, aliases: &[S]) -> Option<(&str, FieldOrigin)> {
        aliases.iter().find_map(|alias| {
            let alias = alias.as_ref().trim();
            if alias.is_empty() {
                return None;
            }
            self.index
                .get(&alias.to_lowercase())
                .or_else(|| {
                    let canonical = canonical_key(alias);
                    if canonical.is_empty() {
                        None
                    } else {
                        self.index.get(&canonical)
                    }
                })
                .map(|&i| {
                    let field = &self.fields[i];
                    (field.value.as_str(), field.origin)
                })
        })
    }

    /// Fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &AccumulatedField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_value_map(&self) -> FieldMap<String> {
        self.fields
            .iter()
            .map(|f| (f.key.clone(), f.value.clone()))
            .collect()
    }

    pub fn to_source_map(&self) -> FieldMap<FieldOrigin> {
        self.fields
            .iter()
            .map(|f| (f.key.clone(), f.origin))
            .collect()
    }
}

/// Exported snapshot of discovered fields
///
/// Keeps insertion order and answers [`FieldMap::get`] case-insensitively.
/// Serializes as a JSON object in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> FieldMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or replace; a key differing only in case replaces in place
    pub fn insert(&mut self, key: String, value: V) {
        match self.position(&key) {
            Some(i) => self.entries[i] = (key, value),
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        let key = key.to_lowercase();
        self.entries.iter().position(|(k, _)| k.to_lowercase() == key)
    }
}

impl<V> Default for FieldMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FromIterator<(String, V)> for FieldMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<V: Serialize> Serialize for FieldMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Lowercase and drop every non-alphanumeric character
pub fn canonical_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Last path segment of a flattened key with trailing `[n]` suffixes removed
///
/// `results[0].plate` → `plate`, `data/plates[2]` → `plates`.
pub fn simplified_key(key: &str) -> String {
    let segment = key
        .rsplit(|c| c == '.' || c == '/' || c == '\\')
        .next()
        .unwrap_or(key);

    let mut segment = segment.trim();
    while segment.ends_with(']') {
        match segment.rfind('[') {
            Some(open) => segment = &segment[..open],
            None => break,
        }
    }
    segment.to_string()
}
