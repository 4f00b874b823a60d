// Copyright 2025 casline Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Index-linked LRU list with a hot prefix.
//!
//! The list does not own its nodes. Nodes live in a per-shard arena addressed by cache line, and every list operation
//! borrows the arena through [`Nodes`].

use casline_common::{code::CacheLine, strict_assert, strict_assert_eq};

/// Ratio between the length of a list and its hot prefix.
pub const LRU_HOT_RATIO: u32 = 2;

/// Links of a cache line in an LRU list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruNode {
    pub(crate) prev: Option<CacheLine>,
    pub(crate) next: Option<CacheLine>,
    pub(crate) hot: bool,
}

/// Arena of list nodes.
pub(crate) trait Nodes {
    fn node(&self, line: CacheLine) -> &LruNode;
    fn node_mut(&mut self, line: CacheLine) -> &mut LruNode;
}

/// Doubly linked LRU list, most recently used at the head.
///
/// With hot tracking enabled the first `len / LRU_HOT_RATIO` nodes are hot. `last_hot` points at the last of them.
#[derive(Debug, Clone, Default)]
pub struct LruList {
    head: Option<CacheLine>,
    tail: Option<CacheLine>,
    last_hot: Option<CacheLine>,
    num_nodes: u32,
    num_hot: u32,
    track_hot: bool,
}

impl LruList {
    pub(crate) fn new(track_hot: bool) -> Self {
        Self {
            track_hot,
            ..Default::default()
        }
    }

    /// Most recently used line.
    pub fn head(&self) -> Option<CacheLine> {
        self.head
    }

    /// Least recently used line.
    pub fn tail(&self) -> Option<CacheLine> {
        self.tail
    }

    /// Last line of the hot prefix.
    pub fn last_hot(&self) -> Option<CacheLine> {
        self.last_hot
    }

    /// Number of lines.
    pub fn len(&self) -> u32 {
        self.num_nodes
    }

    /// Returns true if the list has no lines.
    pub fn is_empty(&self) -> bool {
        self.num_nodes == 0
    }

    /// Number of hot lines.
    pub fn num_hot(&self) -> u32 {
        self.num_hot
    }

    /// Move `last_hot` by one node and return the node whose hot bit flips.
    fn update_last_hot(&mut self, nodes: &impl Nodes, change: i64) -> Option<CacheLine> {
        let old = self.last_hot;
        match change {
            0 => return None,
            1 => {
                self.last_hot = match old {
                    None => self.head,
                    Some(last_hot) => {
                        let next = nodes.node(last_hot).next;
                        strict_assert!(next.is_some());
                        next
                    }
                };
                self.last_hot
            }
            -1 => {
                strict_assert!(old.is_some());
                self.last_hot = old.and_then(|last_hot| nodes.node(last_hot).prev);
                old
            }
            _ => unreachable!("hot prefix moves by one node at a time, change: {change}"),
        }
    }

    fn balance(&mut self, nodes: &mut impl Nodes) {
        if !self.track_hot {
            return;
        }
        let target = self.num_nodes / LRU_HOT_RATIO;
        let change = target as i64 - self.num_hot as i64;
        self.num_hot = target;

        if let Some(pivot) = self.update_last_hot(nodes, change) {
            nodes.node_mut(pivot).hot = change > 0;
        }
    }

    fn add_head_nobalance(&mut self, nodes: &mut impl Nodes, line: CacheLine) {
        strict_assert_eq!(*nodes.node(line), LruNode::default());

        let Some(head) = self.head else {
            strict_assert!(self.tail.is_none());
            self.head = Some(line);
            self.tail = Some(line);
            self.num_nodes = 1;
            return;
        };

        let head_hot = nodes.node(head).hot;
        {
            let node = nodes.node_mut(line);
            node.next = Some(head);
            node.hot = self.track_hot;
        }
        nodes.node_mut(head).prev = Some(line);
        self.head = Some(line);

        if self.track_hot {
            if !head_hot {
                self.last_hot = Some(line);
            }
            self.num_hot += 1;
        }
        self.num_nodes += 1;
    }

    fn remove_nobalance(&mut self, nodes: &mut impl Nodes, line: CacheLine) {
        let node = *nodes.node(line);
        strict_assert!(self.num_nodes > 0);
        strict_assert_eq!(node.prev.is_none(), self.head == Some(line));
        strict_assert_eq!(node.next.is_none(), self.tail == Some(line));

        match node.prev {
            Some(prev) => nodes.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => nodes.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        if self.last_hot == Some(line) {
            self.last_hot = node.prev;
        }

        self.num_nodes -= 1;
        if node.hot {
            strict_assert!(self.num_hot > 0);
            self.num_hot -= 1;
        }
        *nodes.node_mut(line) = LruNode::default();
    }

    /// Insert a line at the head.
    pub(crate) fn add_head(&mut self, nodes: &mut impl Nodes, line: CacheLine) {
        self.add_head_nobalance(nodes, line);
        self.balance(nodes);
    }

    /// Unlink a line.
    pub(crate) fn remove(&mut self, nodes: &mut impl Nodes, line: CacheLine) {
        self.remove_nobalance(nodes, line);
        self.balance(nodes);
    }

    /// Move a line to the head.
    pub(crate) fn set_hot(&mut self, nodes: &mut impl Nodes, line: CacheLine) {
        self.remove_nobalance(nodes, line);
        self.add_head_nobalance(nodes, line);
        self.balance(nodes);
    }

    /// Lines from head to tail.
    #[cfg(test)]
    pub(crate) fn dump(&self, nodes: &impl Nodes) -> Vec<CacheLine> {
        let mut lines = vec![];
        let mut cursor = self.head;
        while let Some(line) = cursor {
            lines.push(line);
            cursor = nodes.node(line).next;
        }
        lines
    }
}
