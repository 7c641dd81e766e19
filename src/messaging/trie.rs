//! Reverse trie over topic keys.
//!
//! Each level of a [`Ssid`](super::ssid::Ssid) selects one child. A node
//! stores at most one value; matching a concrete key yields the value of
//! every node it visits, following both the literal child and the wildcard
//! child at each topic level. Locks are per node, so work on disjoint
//! subtrees never contends.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::ssid::WILDCARD;

/// Child count above which a node's children move from a linear array to a map.
pub const ARRAY_CUTOFF: usize = 64;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

enum Children<V> {
    Array(Vec<(u32, Arc<Node<V>>)>),
    Map(HashMap<u32, Arc<Node<V>>>),
}

impl<V> Children<V> {
    fn get(&self, key: u32) -> Option<&Arc<Node<V>>> {
        match self {
            Children::Array(entries) => entries
                .iter()
                .find(|(candidate, _)| *candidate == key)
                .map(|(_, child)| child),
            Children::Map(map) => map.get(&key),
        }
    }

    /// Insert a child that is known to be absent. Promotion is one-way.
    fn insert(&mut self, key: u32, child: Arc<Node<V>>) {
        if let Children::Array(entries) = self {
            if entries.len() >= ARRAY_CUTOFF {
                let map: HashMap<u32, Arc<Node<V>>> = entries.drain(..).collect();
                *self = Children::Map(map);
            }
        }
        match self {
            Children::Array(entries) => entries.push((key, child)),
            Children::Map(map) => {
                map.insert(key, child);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Node<V>>> {
        match self {
            Children::Array(entries) => entries.iter().map(|(_, c)| Arc::clone(c)).collect(),
            Children::Map(map) => map.values().cloned().collect(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Children::Array(entries) => entries.len(),
            Children::Map(map) => map.len(),
        }
    }
}

struct Node<V> {
    level: i32,
    value: Mutex<Option<V>>,
    children: RwLock<Children<V>>,
}

impl<V> Node<V> {
    fn new(level: i32) -> Self {
        Self {
            level,
            value: Mutex::new(None),
            children: RwLock::new(Children::Array(Vec::new())),
        }
    }

    fn child(&self, key: u32) -> Option<Arc<Node<V>>> {
        self.children.read().get(key).cloned()
    }

    fn child_or_insert(&self, key: u32) -> Arc<Node<V>> {
        if let Some(child) = self.child(key) {
            return child;
        }
        let mut children = self.children.write();
        if let Some(child) = children.get(key) {
            return Arc::clone(child);
        }
        let child = Arc::new(Node::new(self.level + 1));
        children.insert(key, Arc::clone(&child));
        child
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Concurrent topic index keyed by topic-key integer sequences.
pub struct TopicIndex<V> {
    root: Arc<Node<V>>,
    count: AtomicUsize,
}

impl<V: Clone> Default for TopicIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TopicIndex<V> {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::new(-1)),
            count: AtomicUsize::new(0),
        }
    }

    fn walk(&self, key: &[u32]) -> Option<Arc<Node<V>>> {
        let mut node = Arc::clone(&self.root);
        for part in key {
            node = node.child(*part)?;
        }
        Some(node)
    }

    fn walk_or_create(&self, key: &[u32]) -> Arc<Node<V>> {
        let mut node = Arc::clone(&self.root);
        for part in key {
            node = node.child_or_insert(*part);
        }
        node
    }

    /// Store `value` at `key`. Returns false, leaving the index untouched, when
    /// the terminal node already holds a value.
    pub fn add(&self, key: &[u32], value: V) -> bool {
        let node = self.walk_or_create(key);
        let mut slot = node.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Clear and return the value at `key`.
    pub fn remove(&self, key: &[u32]) -> Option<V> {
        self.remove_if(key, |_| true)
    }

    /// Clear the value at `key` only when `predicate` accepts it. The check and
    /// the removal happen under the node's lock.
    pub fn remove_if<P>(&self, key: &[u32], predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        let node = self.walk(key)?;
        let mut slot = node.value.lock();
        if !slot.as_ref().is_some_and(predicate) {
            return None;
        }
        let removed = slot.take();
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Exact lookup; wildcards are not expanded.
    pub fn get(&self, key: &[u32]) -> Option<V> {
        self.walk(key).and_then(|node| node.value.lock().clone())
    }

    /// Return the value at `key`, creating it with `factory` when absent.
    pub fn get_or_add<F>(&self, key: &[u32], factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        let node = self.walk_or_create(key);
        let mut slot = node.value.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let value = factory();
        *slot = Some(value.clone());
        self.count.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Insert with `factory` when absent, otherwise replace the stored value with
    /// `updater(existing)`. Returns the value now stored.
    pub fn add_or_update<F, U>(&self, key: &[u32], factory: F, updater: U) -> V
    where
        F: FnOnce() -> V,
        U: FnOnce(&V) -> V,
    {
        let node = self.walk_or_create(key);
        let mut slot = node.value.lock();
        let value = match slot.as_ref() {
            Some(existing) => updater(existing),
            None => {
                self.count.fetch_add(1, Ordering::Relaxed);
                factory()
            }
        };
        *slot = Some(value.clone());
        value
    }

    /// Values whose patterns match the concrete key `key`.
    ///
    /// Every visited node contributes its value, so a pattern also matches all
    /// topics below it, and a value stored at the empty key matches every
    /// publish. The tenant level is never expanded through the wildcard.
    pub fn matches<'a>(&'a self, key: &'a [u32]) -> Matches<'a, V> {
        Matches {
            key,
            stack: vec![(Arc::clone(&self.root), 0)],
        }
    }

    /// Every stored value, in no particular order.
    pub fn values(&self) -> Values<V> {
        Values {
            stack: vec![Arc::clone(&self.root)],
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the node at `key` has outgrown the child array.
    pub fn is_promoted(&self, key: &[u32]) -> bool {
        self.walk(key)
            .map(|node| matches!(*node.children.read(), Children::Map(_)))
            .unwrap_or(false)
    }

    /// Number of direct children under `key`.
    pub fn child_count(&self, key: &[u32]) -> usize {
        self.walk(key)
            .map(|node| node.children.read().len())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

/// Lazy match traversal with an explicit frontier stack.
pub struct Matches<'a, V> {
    key: &'a [u32],
    stack: Vec<(Arc<Node<V>>, usize)>,
}

impl<V: Clone> Iterator for Matches<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        while let Some((node, depth)) = self.stack.pop() {
            if let Some(&part) = self.key.get(depth) {
                if let Some(child) = node.child(part) {
                    self.stack.push((child, depth + 1));
                }
                if depth > 0 && part != WILDCARD {
                    if let Some(child) = node.child(WILDCARD) {
                        self.stack.push((child, depth + 1));
                    }
                }
            }
            let value = node.value.lock().clone();
            if value.is_some() {
                return value;
            }
        }
        None
    }
}

/// Lazy full traversal.
pub struct Values<V> {
    stack: Vec<Arc<Node<V>>>,
}

impl<V: Clone> Iterator for Values<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        while let Some(node) = self.stack.pop() {
            self.stack.extend(node.children.read().snapshot());
            let value = node.value.lock().clone();
            if value.is_some() {
                return value;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ssid::Ssid;

    fn key(tenant: u32, topic: &str) -> Ssid {
        Ssid::new(tenant, topic)
    }

    fn sorted(mut values: Vec<&'static str>) -> Vec<&'static str> {
        values.sort_unstable();
        values
    }

    #[test]
    fn test_add_refuses_occupied_node() {
        let index = TopicIndex::new();
        let k = key(1, "a/b/");
        assert!(index.add(k.as_slice(), "first"));
        assert!(!index.add(k.as_slice(), "second"));
        assert_eq!(index.get(k.as_slice()), Some("first"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_clears_value() {
        let index = TopicIndex::new();
        let k = key(1, "a/b/");
        index.add(k.as_slice(), "v");
        assert_eq!(index.remove(k.as_slice()), Some("v"));
        assert_eq!(index.remove(k.as_slice()), None);
        assert_eq!(index.get(k.as_slice()), None);
        assert!(index.is_empty());
        assert_eq!(index.remove(key(1, "never/").as_slice()), None);
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let index = TopicIndex::new();
        let k = key(1, "a/");
        index.add(k.as_slice(), 5);
        assert_eq!(index.remove_if(k.as_slice(), |v| *v == 6), None);
        assert_eq!(index.remove_if(k.as_slice(), |v| *v == 5), Some(5));
    }

    #[test]
    fn test_get_or_add_and_add_or_update() {
        let index = TopicIndex::new();
        let k = key(3, "x/");
        assert_eq!(index.get_or_add(k.as_slice(), || 1), 1);
        assert_eq!(index.get_or_add(k.as_slice(), || 2), 1);
        assert_eq!(index.add_or_update(k.as_slice(), || 10, |v| v + 1), 2);
        let other = key(3, "y/");
        assert_eq!(index.add_or_update(other.as_slice(), || 10, |v| v + 1), 10);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_match_follows_wildcard_branch() {
        let index = TopicIndex::new();
        index.add(key(7, "a/+/").as_slice(), "wild");
        for topic in ["a/x/", "a/y/", "a/anything/"] {
            let k = key(7, topic);
            let found: Vec<_> = index.matches(k.as_slice()).collect();
            assert_eq!(found, vec!["wild"], "topic {topic}");
        }
    }

    #[test]
    fn test_match_is_exact_on_literals() {
        let index = TopicIndex::new();
        index.add(key(7, "a/b/").as_slice(), "exact");
        let k = key(7, "a/c/");
        assert_eq!(index.matches(k.as_slice()).count(), 0);
        let k = key(7, "a/b/");
        assert_eq!(index.matches(k.as_slice()).collect::<Vec<_>>(), vec!["exact"]);
    }

    #[test]
    fn test_match_yields_prefixes_and_root() {
        let index = TopicIndex::new();
        index.add(&[], "root");
        index.add(key(7, "").as_slice(), "tenant");
        index.add(key(7, "a/").as_slice(), "a");
        index.add(key(7, "a/b/").as_slice(), "a/b");
        index.add(key(7, "a/b/c/").as_slice(), "a/b/c");
        let k = key(7, "a/b/");
        let found = sorted(index.matches(k.as_slice()).collect());
        assert_eq!(found, sorted(vec!["root", "tenant", "a", "a/b"]));
    }

    #[test]
    fn test_match_never_crosses_tenants() {
        let index = TopicIndex::new();
        index.add(key(1, "a/").as_slice(), "one");
        index.add(&[WILDCARD, crate::messaging::ssid::hash_segment("a")], "sentinel");
        let k = key(2, "a/");
        assert_eq!(index.matches(k.as_slice()).count(), 0);
    }

    #[test]
    fn test_match_combines_literal_and_wildcard() {
        let index = TopicIndex::new();
        index.add(key(7, "news/sports/").as_slice(), "c1");
        index.add(key(7, "news/+/").as_slice(), "c2");
        index.add(key(7, "+/sports/").as_slice(), "c3");
        let k = key(7, "news/sports/");
        assert_eq!(
            sorted(index.matches(k.as_slice()).collect()),
            vec!["c1", "c2", "c3"]
        );
        let k = key(7, "news/weather/");
        assert_eq!(index.matches(k.as_slice()).collect::<Vec<_>>(), vec!["c2"]);
    }

    #[test]
    fn test_deep_topics_match_without_recursion() {
        let index = TopicIndex::new();
        let topic = "seg/".repeat(500);
        index.add(key(1, &topic).as_slice(), "deep");
        let k = key(1, &topic);
        assert_eq!(index.matches(k.as_slice()).collect::<Vec<_>>(), vec!["deep"]);
    }

    #[test]
    fn test_children_promote_past_cutoff() {
        let index = TopicIndex::new();
        let parent = key(1, "fan/");
        for i in 0..ARRAY_CUTOFF {
            index.add(key(1, &format!("fan/{i}/")).as_slice(), i);
        }
        assert!(!index.is_promoted(parent.as_slice()));
        index.add(key(1, "fan/last/").as_slice(), usize::MAX);
        assert!(index.is_promoted(parent.as_slice()));
        assert_eq!(index.child_count(parent.as_slice()), ARRAY_CUTOFF + 1);
        for i in 0..ARRAY_CUTOFF {
            assert_eq!(index.get(key(1, &format!("fan/{i}/")).as_slice()), Some(i));
        }
    }

    #[test]
    fn test_values_visits_everything() {
        let index = TopicIndex::new();
        for (i, topic) in ["a/", "a/b/", "c/", "c/+/d/"].iter().enumerate() {
            index.add(key(1, topic).as_slice(), i);
        }
        let mut all: Vec<_> = index.values().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_concurrent_inserts_on_disjoint_subtrees() {
        let index = Arc::new(TopicIndex::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let k = key(t, &format!("load/{i}/"));
                        assert!(index.add(k.as_slice(), (t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.len(), 8 * 200);
        let k = key(3, "load/17/");
        assert_eq!(index.matches(k.as_slice()).collect::<Vec<_>>(), vec![(3, 17)]);
    }
}
