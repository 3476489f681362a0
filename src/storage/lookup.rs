use std::cmp::Ordering;

use crate::error::TreeResult;
use crate::storage::page::Node;

/// Where a key lands in a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The key is stored at this index.
    Found(u16),
    /// The key is absent and belongs at this index.
    Insert(u16),
}

/// Returns the last index whose key is `<= key`.
///
/// Index 0 is never compared: its key is a copy of the parent's separator,
/// so it is the answer whenever no later key qualifies. For an internal node
/// this is the child to descend into.
pub fn lookup_le(node: &Node, key: &[u8]) -> TreeResult<u16> {
    let nkeys = node.nkeys();
    let mut found = 0;
    for i in 1..nkeys {
        match node.key(i)?.cmp(key) {
            Ordering::Less => found = i,
            Ordering::Equal => return Ok(i),
            Ordering::Greater => break,
        }
    }
    Ok(found)
}

/// Resolve `lookup_le` against a leaf into "found" or "insert here".
///
/// On the leftmost path the first key may be greater than `key`; the new
/// record then goes in front of it.
pub fn leaf_slot(node: &Node, key: &[u8]) -> TreeResult<Slot> {
    if node.nkeys() == 0 {
        return Ok(Slot::Insert(0));
    }
    let idx = lookup_le(node, key)?;
    Ok(match node.key(idx)?.cmp(key) {
        Ordering::Equal => Slot::Found(idx),
        Ordering::Less => Slot::Insert(idx + 1),
        Ordering::Greater => Slot::Insert(idx),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::NodeType;
    use crate::storage::split::node_append_kv;

    fn leaf(keys: &[&str]) -> Node {
        let mut node = Node::new(NodeType::Leaf, keys.len() as u16);
        for (i, k) in keys.iter().enumerate() {
            node_append_kv(&mut node, i as u16, 0, k.as_bytes(), b"v").unwrap();
        }
        node
    }

    #[test]
    fn lookup_picks_last_key_not_greater() {
        let node = leaf(&["b", "d", "f"]);
        assert_eq!(lookup_le(&node, b"d").unwrap(), 1);
        assert_eq!(lookup_le(&node, b"e").unwrap(), 1);
        assert_eq!(lookup_le(&node, b"z").unwrap(), 2);
        // below the first key still falls back to index 0
        assert_eq!(lookup_le(&node, b"a").unwrap(), 0);
    }

    #[test]
    fn leaf_slot_distinguishes_found_and_insert() {
        let node = leaf(&["b", "d", "f"]);
        assert_eq!(leaf_slot(&node, b"d").unwrap(), Slot::Found(1));
        assert_eq!(leaf_slot(&node, b"b").unwrap(), Slot::Found(0));
        assert_eq!(leaf_slot(&node, b"a").unwrap(), Slot::Insert(0));
        assert_eq!(leaf_slot(&node, b"c").unwrap(), Slot::Insert(1));
        assert_eq!(leaf_slot(&node, b"g").unwrap(), Slot::Insert(3));
        assert_eq!(leaf_slot(&Node::new(NodeType::Leaf, 0), b"x").unwrap(), Slot::Insert(0));
    }
}
