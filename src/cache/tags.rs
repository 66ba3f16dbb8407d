//! Bidirectional tag index.
//!
//! Tracks tag → keys and key → tags so a store can drop every entry carrying a
//! tag, and forget a key's tags when the entry is evicted or overwritten.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::lock::{LockSite, read_lock, write_lock};

const SOURCE: &str = "cache::tags";

#[derive(Default)]
struct Index {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct TagIndex {
    index: RwLock<Index>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `tags` to `key`, replacing whatever tags it had before.
    pub fn assign(&self, key: &str, tags: &[&str]) {
        let mut index = write_lock(&self.index, LockSite::new(SOURCE, "assign"));
        index.detach(key);
        if tags.is_empty() {
            return;
        }

        for tag in tags {
            index
                .tag_to_keys
                .entry((*tag).to_string())
                .or_default()
                .insert(key.to_string());
        }
        index.key_to_tags.insert(
            key.to_string(),
            tags.iter().map(|tag| (*tag).to_string()).collect(),
        );
    }

    /// Forget `key` entirely.
    pub fn remove_key(&self, key: &str) {
        write_lock(&self.index, LockSite::new(SOURCE, "remove_key")).detach(key);
    }

    /// Remove `tag` and return every key that carried it.
    pub fn take_tag(&self, tag: &str) -> HashSet<String> {
        let mut index = write_lock(&self.index, LockSite::new(SOURCE, "take_tag"));
        let keys = index.tag_to_keys.remove(tag).unwrap_or_default();
        for key in &keys {
            index.detach(key);
        }
        keys
    }

    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        read_lock(&self.index, LockSite::new(SOURCE, "keys_for_tag"))
            .tag_to_keys
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        read_lock(&self.index, LockSite::new(SOURCE, "tags_for_key"))
            .key_to_tags
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut index = write_lock(&self.index, LockSite::new(SOURCE, "clear"));
        index.tag_to_keys.clear();
        index.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        read_lock(&self.index, LockSite::new(SOURCE, "tag_count"))
            .tag_to_keys
            .len()
    }
}

impl Index {
    fn detach(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }
}
