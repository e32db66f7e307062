// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node routing and topic subscription tables.
//!
//! Both tables are shared read-mostly state: receivers mutate them on
//! authentication, subscription, and teardown; senders read them on
//! every outbound frame. `parking_lot::RwLock` keeps the read path
//! cheap.
//!
//! [`RoutingTable`] maps a node id to the receiver threads owning live
//! authenticated connections from that node. Ownership is refcounted:
//! a node with two connections on the same receiver contributes one
//! entry with `refs == 2`, and the entry drops only when the last
//! connection goes away.
//!
//! [`SubscribeTable`] maps an application message type to the set of
//! `(node, receiver)` pairs that asked for it.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    rsvr_id: usize,
    refs: u32,
}

/// node id → receiver threads holding authenticated connections.
#[derive(Debug, Default)]
pub struct RoutingTable {
    map: RwLock<HashMap<i32, Vec<Owner>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authenticated connection for `node` on `rsvr_id`.
    pub fn add(&self, node: i32, rsvr_id: usize) {
        let mut map = self.map.write();
        let owners = map.entry(node).or_default();
        match owners.iter_mut().find(|o| o.rsvr_id == rsvr_id) {
            Some(owner) => owner.refs += 1,
            None => owners.push(Owner { rsvr_id, refs: 1 }),
        }
    }

    /// Drop one connection reference for `node` on `rsvr_id`; the node
    /// entry disappears when its last reference does.
    pub fn remove(&self, node: i32, rsvr_id: usize) {
        let mut map = self.map.write();
        if let Some(owners) = map.get_mut(&node) {
            if let Some(pos) = owners.iter().position(|o| o.rsvr_id == rsvr_id) {
                owners[pos].refs -= 1;
                if owners[pos].refs == 0 {
                    owners.swap_remove(pos);
                }
            }
            if owners.is_empty() {
                map.remove(&node);
            }
        }
    }

    /// Pick one receiver owning `node`, uniformly at random when the
    /// node is multihomed. `None` when the node has no live link.
    pub fn pick(&self, node: i32) -> Option<usize> {
        let map = self.map.read();
        let owners = map.get(&node)?;
        match owners.len() {
            0 => None,
            1 => Some(owners[0].rsvr_id),
            n => Some(owners[fastrand::usize(..n)].rsvr_id),
        }
    }

    /// All receivers currently owning a link from `node`.
    pub fn owners(&self, node: i32) -> Vec<usize> {
        self.map
            .read()
            .get(&node)
            .map(|v| v.iter().map(|o| o.rsvr_id).collect())
            .unwrap_or_default()
    }

    /// Node ids with at least one live link.
    pub fn nodes(&self) -> Vec<i32> {
        self.map.read().keys().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubEntry {
    pub node: i32,
    pub rsvr_id: usize,
}

/// message type → subscribed `(node, receiver)` pairs.
#[derive(Debug, Default)]
pub struct SubscribeTable {
    map: RwLock<HashMap<u16, Vec<SubEntry>>>,
}

impl SubscribeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` (reachable via `rsvr_id`) for `msg_type`.
    /// Duplicate registrations are coalesced.
    pub fn subscribe(&self, msg_type: u16, node: i32, rsvr_id: usize) {
        let mut map = self.map.write();
        let subs = map.entry(msg_type).or_default();
        let entry = SubEntry { node, rsvr_id };
        if !subs.contains(&entry) {
            subs.push(entry);
        }
    }

    /// Remove every subscription held by `node` via `rsvr_id`. Called
    /// on connection teardown.
    pub fn unsubscribe_node(&self, node: i32, rsvr_id: usize) {
        let mut map = self.map.write();
        map.retain(|_, subs| {
            subs.retain(|s| !(s.node == node && s.rsvr_id == rsvr_id));
            !subs.is_empty()
        });
    }

    /// Current subscribers of `msg_type`.
    pub fn subscribers(&self, msg_type: u16) -> Vec<SubEntry> {
        self.map
            .read()
            .get(&msg_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_refcount() {
        let table = RoutingTable::new();
        table.add(7, 0);
        table.add(7, 0); // second connection, same receiver
        table.add(7, 1);
        assert_eq!(table.owners(7).len(), 2);

        table.remove(7, 0);
        assert_eq!(table.owners(7).len(), 2); // refs 2 -> 1, entry stays
        table.remove(7, 0);
        assert_eq!(table.owners(7), vec![1]);
        table.remove(7, 1);
        assert!(table.pick(7).is_none());
        assert!(table.nodes().is_empty());
    }

    #[test]
    fn test_routing_pick_among_owners() {
        let table = RoutingTable::new();
        table.add(3, 0);
        table.add(3, 1);
        for _ in 0..50 {
            let rsvr = table.pick(3).unwrap();
            assert!(rsvr == 0 || rsvr == 1);
        }
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let table = RoutingTable::new();
        table.remove(99, 0);
        table.add(1, 0);
        table.remove(1, 5); // wrong receiver
        assert_eq!(table.owners(1), vec![0]);
    }

    #[test]
    fn test_subscribe_dedup_and_teardown() {
        let subs = SubscribeTable::new();
        subs.subscribe(0x20, 1, 0);
        subs.subscribe(0x20, 1, 0); // duplicate
        subs.subscribe(0x20, 2, 1);
        subs.subscribe(0x21, 1, 0);
        assert_eq!(subs.subscribers(0x20).len(), 2);

        subs.unsubscribe_node(1, 0);
        assert_eq!(
            subs.subscribers(0x20),
            vec![SubEntry { node: 2, rsvr_id: 1 }]
        );
        assert!(subs.subscribers(0x21).is_empty());
    }
}
