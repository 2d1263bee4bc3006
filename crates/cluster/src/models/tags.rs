//! Cluster tag set.

use std::collections::BTreeMap;

use crate::aws::Tag;
use crate::constants::VERSION_TAG;

/// Tags owned by a cluster, ordered and unique by key.
///
/// Keys are case-sensitive, matching the services that store them; a later
/// insert for an existing key replaces its value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a tag, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value of a tag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record the controller version under the reserved key.
    pub fn set_version(&mut self, version: &str) {
        self.insert(VERSION_TAG, version);
    }

    /// Tags in wire format, sorted by key.
    #[must_use]
    pub fn to_cfn_tags(&self) -> Vec<Tag> {
        self.0
            .iter()
            .map(|(key, value)| Tag::new(key, value))
            .collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().map(|t| (t.key, t.value)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_version_preserves_other_tags() {
        let cases: [&[(&str, &str)]; 3] = [
            &[],
            &[("test", "testvalue")],
            &[(VERSION_TAG, "OldVersionToBeOverridden"), ("Name", "x")],
        ];

        for existing in cases {
            let mut tags: TagSet = existing.iter().map(|(k, v)| Tag::new(*k, *v)).collect();
            let before = tags.clone();

            tags.set_version("FakeInstalledVersion");
            tags.set_version("FakeInstalledVersion");

            assert_eq!(tags.get(VERSION_TAG), Some("FakeInstalledVersion"));
            assert!(tags.len() <= before.len() + 1);
            for (key, value) in existing {
                if *key != VERSION_TAG {
                    assert_eq!(tags.get(key), Some(*value));
                }
            }
        }
    }

    #[test]
    fn test_cfn_tags_sorted_by_key() {
        let mut tags = TagSet::new();
        tags.insert("zeta", "1");
        tags.insert("alpha", "2");
        tags.insert("alpha", "3");

        assert_eq!(
            tags.to_cfn_tags(),
            vec![Tag::new("alpha", "3"), Tag::new("zeta", "1")]
        );
    }
}
