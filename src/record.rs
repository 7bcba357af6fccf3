//! Records, record schemas and composite keys
//!
//! A record is a flat mapping from field name to an optional categorical value.
//! Values are normalised on the way in (surrounding whitespace trimmed, blank
//! values stored as null), so every consumer sees the same null semantics:
//! an absent field and a null field are the same thing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Canonical rendering of a null key component.
pub const NULL_TOKEN: &str = "\\N";

/// Separator between components of a canonical joined key.
pub const KEY_SEPARATOR: char = '|';

/// Normalise a raw field value: trim, and treat blank as null.
pub fn normalize_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Immutable field → value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Option<String>>",
    into = "BTreeMap<String, Option<String>>"
)]
pub struct Record {
    fields: BTreeMap<String, Option<String>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this record with `field` set to `value`.
    pub fn with(mut self, field: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.set(field, Some(value.as_ref()));
        self
    }

    /// Return a copy of this record with `field` explicitly null.
    pub fn with_null(mut self, field: impl Into<String>) -> Self {
        self.set(field, None);
        self
    }

    pub(crate) fn set(&mut self, field: impl Into<String>, value: Option<&str>) {
        self.fields
            .insert(field.into(), value.and_then(normalize_value));
    }

    /// Value of `field`, or `None` when the field is absent or null.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }

    /// Whether the record mentions `field` at all (null-valued fields included).
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Extract the composite key for the given ordered key fields.
    pub fn key_for(&self, key_fields: &[String]) -> CompositeKey {
        CompositeKey(
            key_fields
                .iter()
                .map(|f| self.get(f).map(str::to_string))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, Option<String>>> for Record {
    fn from(raw: BTreeMap<String, Option<String>>) -> Self {
        let mut record = Record::new();
        for (field, value) in raw {
            record.set(field, value.as_deref());
        }
        record
    }
}

impl From<Record> for BTreeMap<String, Option<String>> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: AsRef<str>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (field, value) in iter {
            record.set(field, Some(value.as_ref()));
        }
        record
    }
}

/// The set of field names observed across a record set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    fields: BTreeSet<String>,
}

impl RecordSchema {
    pub fn from_records(records: &[Record]) -> Self {
        let fields = records
            .iter()
            .flat_map(|r| r.field_names().map(str::to_string))
            .collect();
        Self { fields }
    }

    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Tuple of key component values; `None` is the null sentinel.
///
/// Two records with equal composite keys are the same entity for the tier
/// that defines the key, whatever their other fields hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(Vec<Option<String>>);

impl CompositeKey {
    pub fn new(components: Vec<Option<String>>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[Option<String>] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Canonical joined-key string used as the lookup and persistence key.
    ///
    /// Components are joined with `|`; a null component is `\N`; `\` and `|`
    /// inside values are backslash-escaped. The encoding is injective.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(KEY_SEPARATOR);
            }
            match component {
                None => out.push_str(NULL_TOKEN),
                Some(value) => {
                    for c in value.chars() {
                        if c == '\\' || c == KEY_SEPARATOR {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                }
            }
        }
        out
    }

    /// Parse a canonical joined key of known arity. Returns `None` when the
    /// string is not a valid encoding of exactly `arity` components.
    pub fn parse(canonical: &str, arity: usize) -> Option<CompositeKey> {
        if arity == 0 {
            return canonical.is_empty().then(|| CompositeKey(Vec::new()));
        }

        let mut parts = Vec::with_capacity(arity);
        let mut current = String::new();
        let mut null = false;
        let mut chars = canonical.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next()? {
                    'N' if current.is_empty() && !null => null = true,
                    esc @ ('\\' | KEY_SEPARATOR) if !null => current.push(esc),
                    _ => return None,
                },
                KEY_SEPARATOR => parts.push(finish_component(&mut current, &mut null)?),
                other if !null => current.push(other),
                _ => return None,
            }
        }
        parts.push(finish_component(&mut current, &mut null)?);

        (parts.len() == arity).then(|| CompositeKey(parts))
    }
}

fn finish_component(current: &mut String, null: &mut bool) -> Option<Option<String>> {
    if *null {
        *null = false;
        Some(None)
    } else if current.is_empty() {
        // normalised values are never blank
        None
    } else {
        Some(Some(std::mem::take(current)))
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
