//! The application data tree.
//!
//! Hosts build a [`Fragment`] before a render: an ordered map from names to
//! values, where a value may itself be a fragment or an ordered list of
//! fragments. The template's `<?teng frag?>` directive iterates lists, and
//! variable lookups read scalars out of the innermost open fragment.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::json;

/// Value stored under a name inside a fragment.
///
/// The serde representation is untagged, so a fragment tree deserializes
/// straight from plain JSON: numbers become ints/reals, strings stay strings,
/// objects become fragments and arrays become fragment lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentValue {
    Int(i64),
    Real(f64),
    String(String),
    List(FragmentList),
    Frag(Fragment),
}

impl FragmentValue {
    /// The nested fragment, when this value is one (directly or as a
    /// single-element list).
    #[must_use]
    pub fn fragment(&self) -> Option<&Fragment> {
        match self {
            Self::Frag(frag) => Some(frag),
            _ => None,
        }
    }

    /// Appends this value as JSON.
    pub fn json_to(&self, out: &mut String) {
        match self {
            Self::Int(v) => out.push_str(&v.to_string()),
            Self::Real(v) => json::write_real(out, *v),
            Self::String(v) => json::quote_string(out, v),
            Self::List(list) => list.json_to(out),
            Self::Frag(frag) => frag.json_to(out),
        }
    }
}

impl From<i64> for FragmentValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FragmentValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for FragmentValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for FragmentValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Ordered sequence of fragment values under one name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentList {
    items: Vec<FragmentValue>,
}

impl FragmentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fresh empty fragment and returns it for filling.
    pub fn add_fragment(&mut self) -> &mut Fragment {
        self.items.push(FragmentValue::Frag(Fragment::new()));
        match self.items.last_mut() {
            Some(FragmentValue::Frag(frag)) => frag,
            _ => unreachable!("fragment was just pushed"),
        }
    }

    /// Appends an arbitrary value.
    pub fn add_value(&mut self, value: impl Into<FragmentValue>) {
        self.items.push(value.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FragmentValue> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FragmentValue> {
        self.items.iter()
    }

    pub fn json_to(&self, out: &mut String) {
        out.push('[');
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            item.json_to(out);
        }
        out.push(']');
    }
}

impl<'a> IntoIterator for &'a FragmentList {
    type Item = &'a FragmentValue;
    type IntoIter = std::slice::Iter<'a, FragmentValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Ordered map from names to fragment values.
///
/// Insertion order is preserved in dumps and JSON output for determinism;
/// templates themselves cannot observe it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fragment {
    items: IndexMap<String, FragmentValue>,
}

impl Fragment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a scalar or composite value, replacing any previous value of the
    /// name including fragments and lists.
    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<FragmentValue>) {
        self.items.insert(name.into(), value.into());
    }

    pub fn add_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add_value(name, FragmentValue::String(value.into()));
    }

    pub fn add_int(&mut self, name: impl Into<String>, value: i64) {
        self.add_value(name, FragmentValue::Int(value));
    }

    pub fn add_real(&mut self, name: impl Into<String>, value: f64) {
        self.add_value(name, FragmentValue::Real(value));
    }

    /// Returns the fragment list under `name`, replacing any non-list value
    /// with an empty list first.
    pub fn add_fragment_list(&mut self, name: impl Into<String>) -> &mut FragmentList {
        let entry = self
            .items
            .entry(name.into())
            .or_insert_with(|| FragmentValue::List(FragmentList::new()));
        if !matches!(entry, FragmentValue::List(_)) {
            *entry = FragmentValue::List(FragmentList::new());
        }
        match entry {
            FragmentValue::List(list) => list,
            _ => unreachable!("entry was just made a list"),
        }
    }

    /// Appends a fragment to the list under `name`, creating the list on
    /// first use.
    pub fn add_fragment(&mut self, name: impl Into<String>) -> &mut Fragment {
        self.add_fragment_list(name).add_fragment()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FragmentValue> {
        self.items.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, FragmentValue> {
        self.items.iter()
    }

    /// Serializes the fragment as a JSON object.
    pub fn json_to(&self, out: &mut String) {
        out.push('{');
        for (i, (name, value)) in self.items.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            json::quote_string(out, name);
            out.push(':');
            value.json_to(out);
        }
        out.push('}');
    }

    /// JSON form of the whole tree.
    #[must_use]
    pub fn json(&self) -> String {
        let mut out = String::new();
        self.json_to(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_tree() {
        let mut root = Fragment::new();
        root.add_string("title", "Title");
        let items = root.add_fragment_list("items");
        items.add_fragment().add_string("name", "a");
        items.add_fragment().add_string("name", "b");

        assert_eq!(root.len(), 2);
        assert_eq!(
            root.json(),
            r#"{"title":"Title","items":[{"name":"a"},{"name":"b"}]}"#
        );
    }

    #[test]
    fn scalar_replaces_list() {
        let mut root = Fragment::new();
        root.add_fragment("items").add_int("x", 1);
        root.add_string("items", "gone");
        assert_eq!(root.get("items"), Some(&FragmentValue::String("gone".into())));
    }

    #[test]
    fn deserializes_from_json() {
        let root: Fragment =
            serde_json::from_str(r#"{"title":"T","n":3,"items":[{"name":"a"}]}"#).unwrap();
        assert_eq!(root.get("n"), Some(&FragmentValue::Int(3)));
        assert!(matches!(root.get("items"), Some(FragmentValue::List(l)) if l.len() == 1));
    }
}
