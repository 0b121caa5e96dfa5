//! Header and trailer metadata.

use indexmap::IndexMap;
use indexmap::map::Entry;
use tokio::sync::watch;

/// Ordered multimap of lower-cased keys to one or more string values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: IndexMap<String, Vec<String>>,
}

impl Metadata {
    /// Create empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `key` with `value`.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(normalize(key.as_ref()), vec![value.into()]);
    }

    /// Add `value` to the values of `key`, keeping earlier values.
    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        match self.entries.entry(normalize(key.as_ref())) {
            Entry::Occupied(mut entry) => entry.get_mut().push(value.into()),
            Entry::Vacant(entry) => {
                entry.insert(vec![value.into()]);
            }
        }
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&normalize(key))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of `key`, in insertion order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&normalize(key))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Remove `key` and return its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.shift_remove(&normalize(key))
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&normalize(key))
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate keys and their values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Append every value of `other` to this metadata.
    pub fn merge(&mut self, other: Self) {
        for (key, values) in other.entries {
            for value in values {
                self.append(&key, value);
            }
        }
    }
}

fn normalize(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.append(key, value);
        }
        metadata
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// One-shot settable metadata cell shared between the two units of a stream.
///
/// The first `set` wins and is visible to every reader after it returns.
#[derive(Debug)]
pub struct MetadataCell {
    slot: watch::Sender<Option<Metadata>>,
}

impl MetadataCell {
    /// Create an unset cell.
    #[must_use]
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Set the cell. Returns `false` if it was already set.
    pub fn set(&self, metadata: Metadata) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(metadata);
            true
        })
    }

    /// Current value, or `None` if not yet available.
    #[must_use]
    pub fn get(&self) -> Option<Metadata> {
        self.slot.borrow().clone()
    }

    /// Whether the cell has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Wait until the cell is set and return its value.
    pub async fn wait(&self) -> Metadata {
        let mut receiver = self.slot.subscribe();
        receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone())
            .unwrap_or_default()
    }
}

impl Default for MetadataCell {
    fn default() -> Self {
        Self::new()
    }
}
