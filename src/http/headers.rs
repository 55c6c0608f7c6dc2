//! Ordered, case-insensitive header map.
//!
//! Insertion order is preserved. Repeated fields are comma-joined per HTTP
//! field semantics; a repeated field with an empty value keeps the prior
//! value.

/// Header map accumulated while parsing a request.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field/value pair.
    ///
    /// A repeated field comma-joins onto the stored value; an empty value
    /// for a repeated field keeps the prior value.
    pub fn append(&mut self, name: &str, value: &str) {
        if let Some((_, stored)) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            if value.is_empty() {
                return;
            }
            if stored.is_empty() {
                value.clone_into(stored);
            } else {
                stored.push(',');
                stored.push_str(value);
            }
        } else {
            self.entries.push((name.to_owned(), value.to_owned()));
        }
    }

    /// Look up a field by case-insensitive name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether `name`'s value contains `token` as a comma-separated,
    /// case-insensitive element. Used for `Connection: keep-alive, Upgrade`
    /// style fields.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Iterate pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of distinct fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
