use crate::error::{TreeError, TreeResult};
use crate::storage::page::{Node, NodeType, HEADER, MERGE_THRESHOLD, PAGE_SIZE};
use crate::storage::split::{balanced_split_point, node_append_range, node_slice};

/// What to do with a child that shrank after a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebalance {
    /// Leave the child as it is.
    Keep,
    /// Fold the child into its left sibling.
    MergeLeft,
    /// Fold the right sibling into the child.
    MergeRight,
    /// Even out the records shared with the left sibling.
    RedistributeLeft,
    /// Even out the records shared with the right sibling.
    RedistributeRight,
}

/// New leaf with the record at `idx` removed.
pub fn leaf_delete(old: &Node, idx: u16) -> TreeResult<Node> {
    let nkeys = old.nkeys();
    if idx >= nkeys {
        return Err(TreeError::OutOfRange { index: idx as usize, nkeys });
    }
    let mut new = Node::new(NodeType::Leaf, nkeys - 1);
    node_append_range(&mut new, old, 0, 0, idx)?;
    node_append_range(&mut new, old, idx, idx + 1, nkeys - idx - 1)?;
    Ok(new)
}

/// Size of the node `node_merge(left, right)` would produce.
pub fn merged_size(left: &Node, right: &Node) -> TreeResult<usize> {
    Ok(left.nbytes()? + right.nbytes()? - HEADER)
}

/// Concatenate two adjacent siblings into one node.
pub fn node_merge(left: &Node, right: &Node) -> TreeResult<Node> {
    let node_type = left.node_type()?;
    if right.node_type()? != node_type {
        return Err(TreeError::Corrupt(
            "cannot merge a leaf with an internal node".to_string(),
        ));
    }
    let (lkeys, rkeys) = (left.nkeys(), right.nkeys());
    let mut new = Node::new(node_type, lkeys + rkeys);
    node_append_range(&mut new, left, 0, 0, lkeys)?;
    node_append_range(&mut new, right, lkeys, 0, rkeys)?;
    Ok(new)
}

/// Re-split two adjacent siblings at the byte-balanced record boundary.
pub fn node_redistribute(left: &Node, right: &Node) -> TreeResult<(Node, Node)> {
    let merged = node_merge(left, right)?;
    let nkeys = merged.nkeys();
    let mid = balanced_split_point(&merged, 0, nkeys)?.ok_or_else(|| {
        TreeError::Corrupt("siblings do not fit back into two pages".to_string())
    })?;
    Ok((node_slice(&merged, 0, mid)?, node_slice(&merged, mid, nkeys)?))
}

/// Decide how to restore occupancy for `updated`, a child that just lost a
/// record. Merging is preferred, left sibling first; a sibling that cannot
/// absorb the child shares records with it instead.
pub fn plan_rebalance(
    updated: &Node,
    left: Option<&Node>,
    right: Option<&Node>,
) -> TreeResult<Rebalance> {
    if updated.nbytes()? >= MERGE_THRESHOLD {
        return Ok(Rebalance::Keep);
    }
    if let Some(left) = left {
        if merged_size(left, updated)? <= PAGE_SIZE {
            return Ok(Rebalance::MergeLeft);
        }
    }
    if let Some(right) = right {
        if merged_size(updated, right)? <= PAGE_SIZE {
            return Ok(Rebalance::MergeRight);
        }
    }
    Ok(match (left, right) {
        (Some(_), _) => Rebalance::RedistributeLeft,
        (None, Some(_)) => Rebalance::RedistributeRight,
        (None, None) => Rebalance::Keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::split::node_append_kv;

    fn leaf_of(sizes: &[(u8, usize)]) -> Node {
        let mut node = Node::new(NodeType::Leaf, sizes.len() as u16);
        for (i, (k, vlen)) in sizes.iter().enumerate() {
            node_append_kv(&mut node, i as u16, 0, &[*k], &vec![*k; *vlen]).unwrap();
        }
        node
    }

    #[test]
    fn delete_drops_only_the_target() {
        let node = leaf_of(&[(1, 3), (2, 3), (3, 3)]);
        let new = leaf_delete(&node, 1).unwrap();
        assert_eq!(new.nkeys(), 2);
        assert_eq!(new.key(0).unwrap(), &[1]);
        assert_eq!(new.key(1).unwrap(), &[3]);
        assert!(leaf_delete(&node, 3).is_err());
    }

    #[test]
    fn merging_two_minimum_nodes_fits_a_page() {
        let left = leaf_of(&[(1, MERGE_THRESHOLD - 30)]);
        let right = leaf_of(&[(2, MERGE_THRESHOLD - 30)]);
        assert!(left.nbytes().unwrap() < MERGE_THRESHOLD);
        let merged = node_merge(&left, &right).unwrap();
        assert_eq!(merged.nbytes().unwrap(), merged_size(&left, &right).unwrap());
        assert!(merged.nbytes().unwrap() <= PAGE_SIZE);
        assert_eq!(merged.key(1).unwrap(), &[2]);
    }

    #[test]
    fn plan_prefers_left_then_right() {
        let small = leaf_of(&[(5, 10)]);
        let roomy = leaf_of(&[(1, 100)]);
        let full = leaf_of(&[(8, 2020), (9, 2020)]);
        assert_eq!(plan_rebalance(&small, Some(&roomy), Some(&roomy)).unwrap(), Rebalance::MergeLeft);
        assert_eq!(plan_rebalance(&small, Some(&full), Some(&roomy)).unwrap(), Rebalance::MergeRight);
        assert_eq!(plan_rebalance(&small, None, Some(&roomy)).unwrap(), Rebalance::MergeRight);
        assert_eq!(plan_rebalance(&small, None, None).unwrap(), Rebalance::Keep);
        assert_eq!(
            plan_rebalance(&roomy, Some(&full), None).unwrap(),
            Rebalance::RedistributeLeft
        );
        assert_eq!(plan_rebalance(&full, Some(&roomy), None).unwrap(), Rebalance::Keep);
    }

    #[test]
    fn redistribution_refills_an_underfull_sibling() {
        let big: Vec<(u8, usize)> = (1..=30).map(|k| (k, 120)).collect();
        let left = leaf_of(&big);
        let right = leaf_of(&[(200, 100)]);
        assert!(merged_size(&left, &right).unwrap() > PAGE_SIZE);
        assert_eq!(
            plan_rebalance(&right, Some(&left), None).unwrap(),
            Rebalance::RedistributeLeft
        );
        let (l, r) = node_redistribute(&left, &right).unwrap();
        assert_eq!(l.nkeys() + r.nkeys(), 31);
        assert!(l.nbytes().unwrap() >= MERGE_THRESHOLD);
        assert!(r.nbytes().unwrap() >= MERGE_THRESHOLD);
        assert_eq!(r.key(r.nkeys() - 1).unwrap(), &[200]);
    }
}
