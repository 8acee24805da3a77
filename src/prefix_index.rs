// bgpsentry: Detection of Routing-Security Anomalies in Streams of BGP Updates
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Longest-prefix-match index over all tracked prefixes.
//!
//! The index is an arena-allocated binary trie over the address bits. Nodes refer to their
//! parent and children by index into the arena, so the index owns all nodes and no node owns
//! another one. IPv4 and IPv6 prefixes live in two separate sub-tries, rooted at the nodes `0`
//! and `1`. Insertion and lookup walk at most one node per prefix bit.
//!
//! Lookups take a shared read lock and may run concurrently from all workers. Insertion of a new
//! prefix takes the write lock once; afterwards, the per-prefix state is only reached through the
//! [`PrefixEntry`] handle, which serializes updates of that prefix on its own mutex.

use std::{
    net::IpAddr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{state::PrefixEntry, Prefix};

const V4_ROOT: usize = 0;
const V6_ROOT: usize = 1;

#[derive(Debug, Default)]
struct Node {
    parent: Option<usize>,
    children: [Option<usize>; 2],
    entry: Option<Arc<PrefixEntry>>,
}

#[derive(Debug)]
struct Trie {
    nodes: Vec<Node>,
    len: usize,
}

impl Default for Trie {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default(), Node::default()],
            len: 0,
        }
    }
}

/// Address bits left-aligned in a `u128`, together with the prefix length and the root node of
/// its address family.
fn key(prefix: &Prefix) -> (usize, u128, u8) {
    match prefix.network() {
        IpAddr::V4(a) => (V4_ROOT, (u32::from(a) as u128) << 96, prefix.prefix_len()),
        IpAddr::V6(a) => (V6_ROOT, u128::from(a), prefix.prefix_len()),
    }
}

fn bit(key: u128, i: u8) -> usize {
    ((key >> (127 - i as u32)) & 1) as usize
}

impl Trie {
    /// Walk along the prefix bits as far as the trie reaches. Calls `visit(depth, node)` on every
    /// node on the way, including the root (depth 0).
    fn walk(&self, prefix: &Prefix, mut visit: impl FnMut(u8, &Node)) -> Option<usize> {
        let (mut idx, key, len) = key(prefix);
        visit(0, &self.nodes[idx]);
        for depth in 0..len {
            idx = self.nodes[idx].children[bit(key, depth)]?;
            visit(depth + 1, &self.nodes[idx]);
        }
        Some(idx)
    }

    fn find(&self, prefix: &Prefix) -> Option<&Node> {
        self.walk(prefix, |_, _| {}).map(|idx| &self.nodes[idx])
    }

    /// Deepest node on the path of `prefix`, and whether it is the node of `prefix` itself.
    fn deepest(&self, prefix: &Prefix) -> (usize, bool) {
        let (mut idx, key, len) = key(prefix);
        for depth in 0..len {
            match self.nodes[idx].children[bit(key, depth)] {
                Some(child) => idx = child,
                None => return (idx, false),
            }
        }
        (idx, true)
    }

    fn insert(&mut self, prefix: Prefix) -> Arc<PrefixEntry> {
        let (mut idx, key, len) = key(&prefix);
        for depth in 0..len {
            let b = bit(key, depth);
            idx = match self.nodes[idx].children[b] {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node {
                        parent: Some(idx),
                        ..Default::default()
                    });
                    self.nodes[idx].children[b] = Some(child);
                    child
                }
            };
        }
        match &self.nodes[idx].entry {
            Some(entry) => entry.clone(),
            None => {
                let entry = Arc::new(PrefixEntry::new(prefix));
                self.nodes[idx].entry = Some(entry.clone());
                self.len += 1;
                entry
            }
        }
    }
}

/// Concurrent longest-prefix-match index, mapping each tracked prefix to its [`PrefixEntry`].
#[derive(Debug, Default)]
pub struct PrefixIndex {
    trie: RwLock<Trie>,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Trie> {
        self.trie.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Trie> {
        self.trie.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the entry of `prefix`, or return the existing one. The prefix is expected in
    /// canonical form.
    pub fn insert(&self, prefix: Prefix) -> Arc<PrefixEntry> {
        if let Some(entry) = self.lookup(&prefix) {
            return entry;
        }
        self.write().insert(prefix)
    }

    /// Entry of exactly `prefix`, if tracked.
    pub fn lookup(&self, prefix: &Prefix) -> Option<Arc<PrefixEntry>> {
        self.read().find(prefix).and_then(|n| n.entry.clone())
    }

    /// The most specific strict ancestor of `prefix` that is tracked, if any.
    pub fn longest_covering_parent(&self, prefix: &Prefix) -> Option<Arc<PrefixEntry>> {
        let trie = self.read();
        let (idx, exact) = trie.deepest(prefix);
        let mut current = if exact {
            trie.nodes[idx].parent
        } else {
            Some(idx)
        };
        while let Some(i) = current {
            if let Some(entry) = &trie.nodes[i].entry {
                return Some(entry.clone());
            }
            current = trie.nodes[i].parent;
        }
        None
    }

    /// All tracked strict ancestors of `prefix`, from the least to the most specific one.
    pub fn covering_parents(&self, prefix: &Prefix) -> Vec<Arc<PrefixEntry>> {
        let len = prefix.prefix_len();
        let mut parents = Vec::new();
        self.read().walk(prefix, |depth, node| {
            if depth < len {
                parents.extend(node.entry.clone());
            }
        });
        parents
    }

    /// Tracked prefixes directly below `prefix`, i.e., those whose longest covering parent is
    /// `prefix`. Returns nothing if `prefix` is not in the trie.
    pub fn more_specifics(&self, prefix: &Prefix) -> Vec<Prefix> {
        let trie = self.read();
        let (idx, exact) = trie.deepest(prefix);
        if !exact {
            return Vec::new();
        }
        let mut result = Vec::new();
        let mut stack: Vec<usize> = trie.nodes[idx].children.iter().flatten().copied().collect();
        while let Some(i) = stack.pop() {
            let node = &trie.nodes[i];
            match &node.entry {
                Some(entry) => result.push(entry.prefix),
                None => stack.extend(node.children.iter().flatten()),
            }
        }
        result.sort();
        result
    }

    /// Number of tracked prefixes.
    pub fn len(&self) -> usize {
        self.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tracked entries, in no particular order.
    pub fn entries(&self) -> Vec<Arc<PrefixEntry>> {
        self.read()
            .nodes
            .iter()
            .filter_map(|n| n.entry.clone())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn insert_and_lookup() {
        let index = PrefixIndex::new();
        assert!(index.is_empty());
        let a = index.insert(p("10.0.0.0/8"));
        let b = index.insert(p("10.0.0.0/8"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&p("10.0.0.0/8")).unwrap().prefix, p("10.0.0.0/8"));
        assert!(index.lookup(&p("10.0.0.0/9")).is_none());
        assert!(index.lookup(&p("11.0.0.0/8")).is_none());
    }

    #[test]
    fn longest_covering_parent() {
        let index = PrefixIndex::new();
        index.insert(p("10.0.0.0/8"));
        index.insert(p("10.1.0.0/16"));
        index.insert(p("10.1.2.0/24"));
        index.insert(p("0.0.0.0/0"));

        let parent = |s: &str| index.longest_covering_parent(&p(s)).map(|e| e.prefix);
        assert_eq!(parent("10.1.2.0/24"), Some(p("10.1.0.0/16")));
        assert_eq!(parent("10.1.2.128/25"), Some(p("10.1.2.0/24")));
        assert_eq!(parent("10.1.0.0/16"), Some(p("10.0.0.0/8")));
        assert_eq!(parent("10.2.0.0/16"), Some(p("10.0.0.0/8")));
        assert_eq!(parent("10.0.0.0/8"), Some(p("0.0.0.0/0")));
        assert_eq!(parent("0.0.0.0/0"), None);
        assert_eq!(parent("192.168.0.0/16"), Some(p("0.0.0.0/0")));

        let parents: Vec<_> = index
            .covering_parents(&p("10.1.2.0/24"))
            .into_iter()
            .map(|e| e.prefix)
            .collect();
        assert_eq!(
            parents,
            vec![p("0.0.0.0/0"), p("10.0.0.0/8"), p("10.1.0.0/16")]
        );
    }

    #[test]
    fn families_are_separate() {
        let index = PrefixIndex::new();
        index.insert(p("0.0.0.0/0"));
        index.insert(p("2001:db8::/32"));
        assert!(index.longest_covering_parent(&p("::/1")).is_none());
        assert_eq!(
            index
                .longest_covering_parent(&p("2001:db8:1::/48"))
                .map(|e| e.prefix),
            Some(p("2001:db8::/32"))
        );
        assert!(index.lookup(&p("::/0")).is_none());
        assert_eq!(index.entries().len(), 2);
    }

    #[test]
    fn more_specifics() {
        let index = PrefixIndex::new();
        index.insert(p("10.0.0.0/8"));
        index.insert(p("10.1.0.0/16"));
        index.insert(p("10.1.2.0/24"));
        index.insert(p("10.128.0.0/9"));
        assert_eq!(
            index.more_specifics(&p("10.0.0.0/8")),
            vec![p("10.1.0.0/16"), p("10.128.0.0/9")]
        );
        assert_eq!(index.more_specifics(&p("10.1.0.0/16")), vec![p("10.1.2.0/24")]);
        assert!(index.more_specifics(&p("192.168.0.0/16")).is_empty());
    }
}
