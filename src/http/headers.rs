//! Ordered, case-insensitive header fields.

use serde::{Deserialize, Serialize};

fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Header fields in the order they were added, repeated names included.
///
/// Names compare ASCII-case-insensitively and keep the spelling they were
/// inserted with. The map serializes as an ordered list of `[name, value]`
/// pairs, so a `Set-Cookie` sent twice comes back out of a store twice.
///
/// # Examples
///
/// ```
/// use replay_cache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-Custom", "first");
/// headers.insert("X-Custom", "second");
/// assert_eq!(headers.get_all("x-custom").count(), 2);
///
/// headers.set("x-custom", "only");
/// let all: Vec<_> = headers.get_all("X-Custom").collect();
/// assert_eq!(all, vec!["only"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field after the existing ones, even if the name is present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single `value`.
    ///
    /// The entry keeps the position of the first existing occurrence; if the
    /// name is absent the entry is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        let Some(first) = self.entries.iter().position(|(k, _)| same_name(k, &name)) else {
            self.entries.push((name, value));
            return;
        };

        // Only entries after `first` are dropped, so `first` stays valid.
        let mut index = 0;
        self.entries.retain(|(k, _)| {
            let keep = index <= first || !same_name(k, &name);
            index += 1;
            keep
        });
        self.entries[first] = (name, value);
    }

    /// First value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| same_name(k, name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded under `name`, oldest first.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| same_name(k, name))
            .map(|(_, v)| v.as_str())
    }

    /// Drops every field named `name`; `false` if there was none.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !same_name(k, name));
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of fields, counting each repeated name once per value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
