use log::trace;

use crate::error::{TreeError, TreeResult};
use crate::storage::page::{Node, NodeType, PagePtr, KV_HEADER, PAGE_SIZE};

/// A freshly allocated child together with its first key, ready to be
/// linked into a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLink {
    pub ptr: PagePtr,
    pub key: Vec<u8>,
}

/// Write one record into slot `idx` of `dst` and advance the next offset.
///
/// Slots must be filled in order: the record is placed where the offset of
/// `idx` says the previous record ended.
pub fn node_append_kv(
    dst: &mut Node,
    idx: u16,
    ptr: PagePtr,
    key: &[u8],
    val: &[u8],
) -> TreeResult<()> {
    dst.set_ptr(idx, ptr)?;
    let pos = dst.kv_pos(idx)?;
    let klen = u16::try_from(key.len()).map_err(|_| TreeError::KeyTooLarge(key.len()))?;
    let vlen = u16::try_from(val.len()).map_err(|_| TreeError::ValueTooLarge(val.len()))?;
    dst.write_u16(pos, klen)?;
    dst.write_u16(pos + 2, vlen)?;
    dst.bytes_mut(pos + KV_HEADER, key.len())?.copy_from_slice(key);
    dst.bytes_mut(pos + KV_HEADER + key.len(), val.len())?.copy_from_slice(val);

    let end = dst.offset(idx)? as usize + KV_HEADER + key.len() + val.len();
    let end = u16::try_from(end).map_err(|_| TreeError::PageOverflow(end))?;
    dst.set_offset(idx + 1, end)
}

/// Copy records `[src_start, src_start + n)` of `src` into `dst` starting at
/// slot `dst_start`, re-basing their offsets onto `dst`'s record area.
pub fn node_append_range(
    dst: &mut Node,
    src: &Node,
    dst_start: u16,
    src_start: u16,
    n: u16,
) -> TreeResult<()> {
    if src_start as usize + n as usize > src.nkeys() as usize {
        return Err(TreeError::OutOfRange {
            index: src_start as usize + n as usize,
            nkeys: src.nkeys(),
        });
    }
    if dst_start as usize + n as usize > dst.nkeys() as usize {
        return Err(TreeError::OutOfRange {
            index: dst_start as usize + n as usize,
            nkeys: dst.nkeys(),
        });
    }
    if n == 0 {
        return Ok(());
    }

    for i in 0..n {
        dst.set_ptr(dst_start + i, src.ptr(src_start + i)?)?;
    }

    let dst_begin = dst.offset(dst_start)?;
    let src_begin = src.offset(src_start)?;
    for i in 1..=n {
        let rebased = src.offset(src_start + i)? as usize - src_begin as usize + dst_begin as usize;
        let rebased = u16::try_from(rebased).map_err(|_| TreeError::PageOverflow(rebased))?;
        dst.set_offset(dst_start + i, rebased)?;
    }

    let begin = src.kv_pos(src_start)?;
    let end = src.kv_pos(src_start + n)?;
    let at = dst.kv_pos(dst_start)?;
    dst.bytes_mut(at, end - begin)?
        .copy_from_slice(src.bytes(begin, end - begin)?);
    Ok(())
}

/// New leaf with `(key, val)` inserted at `idx`.
pub fn leaf_insert(old: &Node, idx: u16, key: &[u8], val: &[u8]) -> TreeResult<Node> {
    let nkeys = old.nkeys();
    if idx > nkeys {
        return Err(TreeError::OutOfRange { index: idx as usize, nkeys });
    }
    let mut new = Node::new(NodeType::Leaf, nkeys + 1);
    node_append_range(&mut new, old, 0, 0, idx)?;
    node_append_kv(&mut new, idx, 0, key, val)?;
    node_append_range(&mut new, old, idx + 1, idx, nkeys - idx)?;
    Ok(new)
}

/// New leaf with the value at `idx` replaced.
pub fn leaf_update(old: &Node, idx: u16, key: &[u8], val: &[u8]) -> TreeResult<Node> {
    let nkeys = old.nkeys();
    if idx >= nkeys {
        return Err(TreeError::OutOfRange { index: idx as usize, nkeys });
    }
    let mut new = Node::new(NodeType::Leaf, nkeys);
    node_append_range(&mut new, old, 0, 0, idx)?;
    node_append_kv(&mut new, idx, 0, key, val)?;
    node_append_range(&mut new, old, idx + 1, idx + 1, nkeys - idx - 1)?;
    Ok(new)
}

/// New internal node where the `replaced` children starting at `idx` are
/// swapped for `kids`. Each kid's first key becomes its separator.
pub fn internal_replace(
    old: &Node,
    idx: u16,
    replaced: u16,
    kids: &[ChildLink],
) -> TreeResult<Node> {
    let nkeys = old.nkeys();
    if idx as usize + replaced as usize > nkeys as usize {
        return Err(TreeError::OutOfRange {
            index: idx as usize + replaced as usize,
            nkeys,
        });
    }
    let inc = kids.len() as u16;
    let total = nkeys - replaced + inc;
    let mut new = Node::new(NodeType::Internal, total);
    node_append_range(&mut new, old, 0, 0, idx)?;
    for (i, kid) in kids.iter().enumerate() {
        node_append_kv(&mut new, idx + i as u16, kid.ptr, &kid.key, &[])?;
    }
    node_append_range(&mut new, old, idx + inc, idx + replaced, nkeys - idx - replaced)?;
    Ok(new)
}

/// Copy records `[start, end)` into a node of their own.
pub fn node_slice(node: &Node, start: u16, end: u16) -> TreeResult<Node> {
    if start > end || end > node.nkeys() {
        return Err(TreeError::OutOfRange { index: end as usize, nkeys: node.nkeys() });
    }
    let mut new = Node::new(node.node_type()?, end - start);
    node_append_range(&mut new, node, 0, start, end - start)?;
    Ok(new)
}

/// The index splitting `[start, end)` into two page-sized halves whose
/// larger half is as small as possible, if any such index exists.
pub fn balanced_split_point(node: &Node, start: u16, end: u16) -> TreeResult<Option<u16>> {
    let mut best: Option<(u16, usize)> = None;
    for mid in start + 1..end {
        let left = node.range_bytes(start, mid)?;
        let right = node.range_bytes(mid, end)?;
        if left > PAGE_SIZE || right > PAGE_SIZE {
            continue;
        }
        let worst = left.max(right);
        if best.is_none_or(|(_, w)| worst < w) {
            best = Some((mid, worst));
        }
    }
    Ok(best.map(|(mid, _)| mid))
}

/// Split a possibly oversized node into one to three page-sized siblings.
///
/// The records of the returned nodes, read in order, are exactly the
/// records of `old`.
pub fn node_split(old: &Node) -> TreeResult<Vec<Node>> {
    let nkeys = old.nkeys();
    let total = old.nbytes()?;
    if total <= PAGE_SIZE {
        return Ok(vec![old.clone()]);
    }

    if let Some(mid) = balanced_split_point(old, 0, nkeys)? {
        trace!("splitting {}-byte node at record {} of {}", total, mid, nkeys);
        return Ok(vec![node_slice(old, 0, mid)?, node_slice(old, mid, nkeys)?]);
    }

    // Three ways: fill the right sibling as far as it goes, then balance
    // what remains on the left.
    let mut right_start = nkeys;
    while right_start > 0 && old.range_bytes(right_start - 1, nkeys)? <= PAGE_SIZE {
        right_start -= 1;
    }
    if right_start == nkeys || right_start == 0 {
        return Err(TreeError::PageOverflow(total));
    }
    let right = node_slice(old, right_start, nkeys)?;
    if old.range_bytes(0, right_start)? <= PAGE_SIZE {
        return Ok(vec![node_slice(old, 0, right_start)?, right]);
    }
    match balanced_split_point(old, 0, right_start)? {
        Some(mid) => {
            trace!(
                "splitting {}-byte node at records {} and {} of {}",
                total, mid, right_start, nkeys
            );
            Ok(vec![
                node_slice(old, 0, mid)?,
                node_slice(old, mid, right_start)?,
                right,
            ])
        }
        None => Err(TreeError::PageOverflow(total)),
    }
}
