//! # Tag Routing Table
//!
//! Purpose: Maintain the bidirectional tag <-> key index that backs tagged
//! reads and removals.
//!
//! ## Design Principles
//! 1. **Lockstep Directions**: both maps change together under one writer
//!    lock, so the inverse index can never drift.
//! 2. **Snapshot Reads**: `keys_for` returns a copy, never a live reference,
//!    so callers iterate without holding the lock.
//! 3. **Single Tag Per Key**: retagging removes the old edge first.

use std::sync::Arc;

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

/// Bidirectional tag index guarded by a single reader/writer lock.
pub struct TagTable {
    inner: RwLock<TagState>,
}

struct TagState {
    /// Tag -> set of keys carrying it.
    tag_to_keys: HashMap<Arc<str>, HashSet<Arc<str>, RandomState>, RandomState>,
    /// Key -> its single tag.
    key_to_tag: HashMap<Arc<str>, Arc<str>, RandomState>,
}

impl TagTable {
    /// Creates an empty tag table.
    pub fn new() -> Self {
        TagTable {
            inner: RwLock::new(TagState {
                tag_to_keys: HashMap::with_hasher(RandomState::new()),
                key_to_tag: HashMap::with_hasher(RandomState::new()),
            }),
        }
    }

    /// Sets or clears the tag carried by a key.
    ///
    /// Any existing tag edge is removed first; `None` leaves the key untagged.
    pub fn set_tag(&self, key: &str, tag: Option<&str>) {
        let mut state = self.inner.write();
        state.unlink(key);

        if let Some(tag) = tag {
            let key: Arc<str> = Arc::from(key);
            let tag: Arc<str> = match state.tag_to_keys.get_key_value(tag) {
                Some((existing, _)) => Arc::clone(existing),
                None => Arc::from(tag),
            };
            state
                .tag_to_keys
                .entry(Arc::clone(&tag))
                .or_insert_with(|| HashSet::with_hasher(RandomState::new()))
                .insert(Arc::clone(&key));
            state.key_to_tag.insert(key, tag);
        }
    }

    /// Drops a key from both directions of the index.
    pub fn remove_key(&self, key: &str) {
        self.inner.write().unlink(key);
    }

    /// Returns a snapshot copy of the keys carrying a tag.
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        let state = self.inner.read();
        match state.tag_to_keys.get(tag) {
            Some(keys) => keys.iter().map(|key| key.to_string()).collect(),
            None => Vec::new(),
        }
    }

    /// Returns the tag a key carries, if any.
    pub fn tag_of(&self, key: &str) -> Option<String> {
        self.inner.read().key_to_tag.get(key).map(|tag| tag.to_string())
    }

    /// Drops every edge in the table.
    pub fn clear(&self) {
        let mut state = self.inner.write();
        state.tag_to_keys.clear();
        state.key_to_tag.clear();
    }
}

impl Default for TagTable {
    fn default() -> Self {
        TagTable::new()
    }
}

impl TagState {
    /// Removes the key's tag edge, if present, from both maps.
    fn unlink(&mut self, key: &str) {
        if let Some(tag) = self.key_to_tag.remove(key) {
            if let Some(keys) = self.tag_to_keys.get_mut(tag.as_ref()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag.as_ref());
                }
            }
        }
    }
}

/// Matches `text` against a glob pattern whose only metacharacter is `'*'`.
///
/// Matching is case-sensitive. `'*'` matches any run of bytes, including an
/// empty one.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let mut pi = 0;
    let mut ti = 0;
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == t[ti] && p[pi] != b'*' {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            // Backtrack: let the last '*' swallow one more byte.
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_key_appears_exactly_once() {
        let table = TagTable::new();
        table.set_tag("alpha", Some("news"));
        table.set_tag("alpha", Some("news"));

        let keys = table.keys_for("news");
        assert_eq!(keys, vec!["alpha".to_string()]);
    }

    #[test]
    fn retag_moves_key_to_new_tag_only() {
        let table = TagTable::new();
        table.set_tag("alpha", Some("t1"));
        table.set_tag("alpha", Some("t2"));

        assert!(table.keys_for("t1").is_empty());
        assert_eq!(table.keys_for("t2"), vec!["alpha".to_string()]);
        assert_eq!(table.tag_of("alpha"), Some("t2".to_string()));
    }

    #[test]
    fn untag_and_remove_drop_both_directions() {
        let table = TagTable::new();
        table.set_tag("alpha", Some("news"));
        table.set_tag("alpha", None);
        assert!(table.keys_for("news").is_empty());
        assert!(table.tag_of("alpha").is_none());

        table.set_tag("beta", Some("news"));
        table.remove_key("beta");
        assert!(table.keys_for("news").is_empty());
        assert!(table.tag_of("beta").is_none());
    }

    #[test]
    fn keys_for_returns_a_snapshot() {
        let table = TagTable::new();
        table.set_tag("alpha", Some("news"));
        let snapshot = table.keys_for("news");
        table.remove_key("alpha");
        // The snapshot is unaffected by later mutation.
        assert_eq!(snapshot, vec!["alpha".to_string()]);
    }

    #[test]
    fn glob_star_matches_everything() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn glob_literal_is_exact_and_case_sensitive() {
        assert!(glob_match("alpha", "alpha"));
        assert!(!glob_match("alpha", "Alpha"));
        assert!(!glob_match("alpha", "alpha2"));
    }

    #[test]
    fn glob_star_segments() {
        assert!(glob_match("user:*", "user:42"));
        assert!(!glob_match("user:*", "session:42"));
        assert!(glob_match("*:42", "user:42"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abcdf"));
        assert!(glob_match("a**b", "ab"));
    }
}
