//! String-to-string header map carried by every published/delivered message.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An ordered string-to-string map. Ordering is preserved so that headers
/// round-trip predictably across backends that care about it (NATS); it is
/// not a correctness requirement for backends that don't.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Defensive copy handed to user code; user mutation of the returned
    /// value never affects the delivery record the transport holds.
    pub fn to_owned_copy(&self) -> Headers {
        self.clone()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(IndexMap::from_iter(iter))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let mut h = Headers::new();
        h.insert("k", "v");
        assert_eq!(h.get("k"), Some("v"));
        assert_eq!(h.get("missing"), None);
    }

    #[test]
    fn defensive_copy_is_independent() {
        let mut h = Headers::new();
        h.insert("k", "v");
        let mut copy = h.to_owned_copy();
        copy.insert("k", "mutated");
        assert_eq!(h.get("k"), Some("v"));
        assert_eq!(copy.get("k"), Some("mutated"));
    }

    #[test]
    fn preserves_insertion_order() {
        let mut h = Headers::new();
        h.insert("b", "1");
        h.insert("a", "2");
        let keys: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
