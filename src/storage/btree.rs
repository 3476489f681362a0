use log::{debug, trace, warn};

use crate::error::{TreeError, TreeResult};
use crate::storage::lookup::{leaf_slot, lookup_le, Slot};
use crate::storage::merge::{leaf_delete, node_merge, node_redistribute, plan_rebalance, Rebalance};
use crate::storage::page::{
    Node, NodeType, PagePtr, MAX_KEY_SIZE, MAX_VAL_SIZE, MERGE_THRESHOLD, PAGE_SIZE,
};
use crate::storage::pager::PageStore;
use crate::storage::split::{
    internal_replace, leaf_insert, leaf_update, node_append_kv, node_split, ChildLink,
};

/// A copy-on-write B+tree over byte keys and values.
///
/// Pages are never changed once allocated. Every insert or delete rebuilds
/// the nodes on the path from the affected leaf up to the root as new pages:
///
///   1. Descend from the root, picking children with `lookup_le`.
///   2. Build the new leaf (insert, update or delete one record).
///   3. On the way back up, split an oversized child into 2–3 pages, or
///      merge / redistribute an underfull child with a sibling, and build a
///      new parent that points at the replacement pages.
///   4. At the top, grow a new root over a split root, or collapse a root
///      left with a single child.
///   5. Commit the new root pointer, then release every page the new path
///      superseded.
///
/// If any step fails the root pointer is left alone and the pages already
/// allocated for the new path are released again.
pub struct BTree<S: PageStore> {
    root: PagePtr,
    store: S,
}

impl<S: PageStore> BTree<S> {
    /// An empty tree on `store`.
    pub fn new(store: S) -> Self {
        BTree { root: 0, store }
    }

    /// A tree whose root page is already in `store`. `0` opens an empty tree.
    pub fn open(store: S, root: PagePtr) -> Self {
        BTree { root, store }
    }

    /// The current root pointer. Callers persist this after mutations.
    pub fn root(&self) -> PagePtr {
        self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Look up `key`, returning a copy of its value.
    pub fn get(&mut self, key: &[u8]) -> TreeResult<Option<Vec<u8>>> {
        check_key(key)?;
        let mut ptr = self.root;
        if ptr == 0 {
            return Ok(None);
        }
        loop {
            let node = self.store.fetch(ptr)?;
            match node.node_type()? {
                NodeType::Leaf => {
                    return match leaf_slot(&node, key)? {
                        Slot::Found(idx) => Ok(Some(node.val(idx)?.to_vec())),
                        Slot::Insert(_) => Ok(None),
                    };
                }
                NodeType::Internal => {
                    let idx = lookup_le(&node, key)?;
                    ptr = node.ptr(idx)?;
                    trace!("get: descending from internal to child {} (slot {})", ptr, idx);
                }
            }
        }
    }

    /// Insert or update `key`, returning the value it replaced.
    pub fn insert(&mut self, key: &[u8], val: &[u8]) -> TreeResult<Option<Vec<u8>>> {
        check_key(key)?;
        if val.len() > MAX_VAL_SIZE {
            return Err(TreeError::ValueTooLarge(val.len()));
        }
        debug!("insert() → root {} for key of {} bytes", self.root, key.len());

        let mut path = PathWriter::new(&mut self.store);
        match insert_root(&mut path, self.root, key, val) {
            Ok((new_root, previous)) => {
                self.root = new_root;
                path.commit();
                Ok(previous)
            }
            Err(e) => {
                path.abandon();
                Err(e)
            }
        }
    }

    /// Remove `key`. Returns `false`, leaving the tree untouched, if it was
    /// not present.
    pub fn delete(&mut self, key: &[u8]) -> TreeResult<bool> {
        check_key(key)?;
        if self.root == 0 {
            return Ok(false);
        }
        debug!("delete() → root {} for key of {} bytes", self.root, key.len());

        let mut path = PathWriter::new(&mut self.store);
        match delete_root(&mut path, self.root, key) {
            Ok(Some(new_root)) => {
                self.root = new_root;
                path.commit();
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                path.abandon();
                Err(e)
            }
        }
    }
}

fn check_key(key: &[u8]) -> TreeResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(TreeError::KeyTooLarge(key.len()));
    }
    Ok(())
}

/// Page bookkeeping for one path rewrite: what was allocated for the new
/// path, and what the new path replaces.
struct PathWriter<'s, S: PageStore> {
    store: &'s mut S,
    allocated: Vec<PagePtr>,
    superseded: Vec<PagePtr>,
}

impl<'s, S: PageStore> PathWriter<'s, S> {
    fn new(store: &'s mut S) -> Self {
        PathWriter {
            store,
            allocated: Vec::new(),
            superseded: Vec::new(),
        }
    }

    fn fetch(&mut self, ptr: PagePtr) -> TreeResult<Node> {
        self.store.fetch(ptr)
    }

    fn alloc(&mut self, node: &Node) -> TreeResult<PagePtr> {
        let ptr = self.store.allocate(node)?;
        self.allocated.push(ptr);
        Ok(ptr)
    }

    /// Allocate each node and pair it with its first key.
    fn alloc_links(&mut self, nodes: &[Node]) -> TreeResult<Vec<ChildLink>> {
        let mut links = Vec::with_capacity(nodes.len());
        for node in nodes {
            let ptr = self.alloc(node)?;
            links.push(ChildLink { ptr, key: node.key(0)?.to_vec() });
        }
        Ok(links)
    }

    fn supersede(&mut self, ptr: PagePtr) {
        self.superseded.push(ptr);
    }

    /// Called once the new root is in place. The mutation has happened by
    /// now, so a page that cannot be released is only logged.
    fn commit(self) {
        trace!(
            "commit: {} pages written, {} released",
            self.allocated.len(),
            self.superseded.len()
        );
        for ptr in self.superseded {
            if let Err(e) = self.store.release(ptr) {
                warn!("could not release superseded page {}: {}", ptr, e);
            }
        }
    }

    /// Drop the half-built path. Nothing links to these pages yet.
    fn abandon(self) {
        for ptr in self.allocated.into_iter().rev() {
            if let Err(e) = self.store.release(ptr) {
                warn!("could not release abandoned page {}: {}", ptr, e);
            }
        }
    }
}

fn insert_root<S: PageStore>(
    path: &mut PathWriter<'_, S>,
    root: PagePtr,
    key: &[u8],
    val: &[u8],
) -> TreeResult<(PagePtr, Option<Vec<u8>>)> {
    if root == 0 {
        debug!("  → empty tree, allocating the first leaf");
        let mut leaf = Node::new(NodeType::Leaf, 1);
        node_append_kv(&mut leaf, 0, 0, key, val)?;
        return Ok((path.alloc(&leaf)?, None));
    }

    let node = path.fetch(root)?;
    let mut previous = None;
    let updated = tree_insert(path, &node, key, val, &mut previous)?;
    path.supersede(root);

    let parts = node_split(&updated)?;
    if parts.len() == 1 {
        return Ok((path.alloc(&parts[0])?, previous));
    }

    Ok((grow_root(path, &parts)?, previous))
}

/// Allocate the pieces of a split root under a new internal root.
fn grow_root<S: PageStore>(path: &mut PathWriter<'_, S>, parts: &[Node]) -> TreeResult<PagePtr> {
    debug!("  → root split into {} pages, tree grows by one level", parts.len());
    let links = path.alloc_links(parts)?;
    let mut new_root = Node::new(NodeType::Internal, links.len() as u16);
    for (i, link) in links.iter().enumerate() {
        node_append_kv(&mut new_root, i as u16, link.ptr, &link.key, &[])?;
    }
    path.alloc(&new_root)
}

/// Rebuild `node` with `(key, val)` applied. The result may exceed a page;
/// the caller splits it.
fn tree_insert<S: PageStore>(
    path: &mut PathWriter<'_, S>,
    node: &Node,
    key: &[u8],
    val: &[u8],
    previous: &mut Option<Vec<u8>>,
) -> TreeResult<Node> {
    match node.node_type()? {
        NodeType::Leaf => match leaf_slot(node, key)? {
            Slot::Found(idx) => {
                trace!("  → updating record {} in leaf", idx);
                *previous = Some(node.val(idx)?.to_vec());
                leaf_update(node, idx, key, val)
            }
            Slot::Insert(idx) => {
                trace!("  → inserting at record {} in leaf", idx);
                leaf_insert(node, idx, key, val)
            }
        },
        NodeType::Internal => {
            let idx = lookup_le(node, key)?;
            let kid_ptr = node.ptr(idx)?;
            let kid = path.fetch(kid_ptr)?;
            let updated = tree_insert(path, &kid, key, val, previous)?;
            path.supersede(kid_ptr);

            let parts = node_split(&updated)?;
            if parts.len() > 1 {
                debug!("  → child {} split into {} pages", kid_ptr, parts.len());
            }
            let links = path.alloc_links(&parts)?;
            internal_replace(node, idx, 1, &links)
        }
    }
}

/// Returns the new root pointer, or `None` if the key was absent.
fn delete_root<S: PageStore>(
    path: &mut PathWriter<'_, S>,
    root: PagePtr,
    key: &[u8],
) -> TreeResult<Option<PagePtr>> {
    let node = path.fetch(root)?;
    let mut updated = match tree_delete(path, &node, key)? {
        Some(updated) => updated,
        None => return Ok(None),
    };
    path.supersede(root);

    loop {
        if updated.nkeys() == 0 {
            debug!("  → last key removed, tree is empty");
            return Ok(Some(0));
        }
        if updated.node_type()? == NodeType::Internal && updated.nkeys() == 1 {
            let only = updated.ptr(0)?;
            let kid = path.fetch(only)?;
            if kid.node_type()? == NodeType::Internal && kid.nkeys() == 1 {
                path.supersede(only);
                updated = kid;
                continue;
            }
            debug!("  → root has a single child {}, tree shrinks by one level", only);
            return Ok(Some(only));
        }
        let parts = node_split(&updated)?;
        if parts.len() > 1 {
            return grow_root(path, &parts).map(Some);
        }
        return Ok(Some(path.alloc(&updated)?));
    }
}

/// Rebuild `node` without `key`, or `None` if it is not in this subtree.
fn tree_delete<S: PageStore>(
    path: &mut PathWriter<'_, S>,
    node: &Node,
    key: &[u8],
) -> TreeResult<Option<Node>> {
    match node.node_type()? {
        NodeType::Leaf => match leaf_slot(node, key)? {
            Slot::Found(idx) => leaf_delete(node, idx).map(Some),
            Slot::Insert(_) => Ok(None),
        },
        NodeType::Internal => internal_delete(path, node, key),
    }
}

fn internal_delete<S: PageStore>(
    path: &mut PathWriter<'_, S>,
    node: &Node,
    key: &[u8],
) -> TreeResult<Option<Node>> {
    let idx = lookup_le(node, key)?;
    let kid_ptr = node.ptr(idx)?;
    let kid = path.fetch(kid_ptr)?;
    let updated = match tree_delete(path, &kid, key)? {
        Some(updated) => updated,
        None => return Ok(None),
    };
    path.supersede(kid_ptr);

    // A longer first key in a grandchild can push an internal child past a
    // page even though a record was removed.
    if updated.nbytes()? > PAGE_SIZE {
        let parts = node_split(&updated)?;
        debug!("  → child {} split into {} pages after a separator grew", kid_ptr, parts.len());
        let links = path.alloc_links(&parts)?;
        return internal_replace(node, idx, 1, &links).map(Some);
    }

    let nkeys = node.nkeys();
    let (left, right) = if updated.nbytes()? < MERGE_THRESHOLD {
        let left = if idx > 0 { Some(path.fetch(node.ptr(idx - 1)?)?) } else { None };
        let right = if idx + 1 < nkeys { Some(path.fetch(node.ptr(idx + 1)?)?) } else { None };
        (left, right)
    } else {
        (None, None)
    };

    let plan = plan_rebalance(&updated, left.as_ref(), right.as_ref())?;
    match (plan, left, right) {
        (Rebalance::MergeLeft, Some(left), _) => {
            debug!("  → merging child {} into its left sibling", kid_ptr);
            let merged = node_merge(&left, &updated)?;
            path.supersede(node.ptr(idx - 1)?);
            let links = path.alloc_links(std::slice::from_ref(&merged))?;
            internal_replace(node, idx - 1, 2, &links).map(Some)
        }
        (Rebalance::MergeRight, _, Some(right)) => {
            debug!("  → merging the right sibling into child {}", kid_ptr);
            let merged = node_merge(&updated, &right)?;
            path.supersede(node.ptr(idx + 1)?);
            let links = path.alloc_links(std::slice::from_ref(&merged))?;
            internal_replace(node, idx, 2, &links).map(Some)
        }
        (Rebalance::RedistributeLeft, Some(left), _) => {
            let (l, r) = node_redistribute(&left, &updated)?;
            if l.nkeys() == left.nkeys() {
                return keep_child(path, node, idx, updated).map(Some);
            }
            debug!(
                "  → moving {} records from the left sibling into child {}",
                left.nkeys().abs_diff(l.nkeys()),
                kid_ptr
            );
            path.supersede(node.ptr(idx - 1)?);
            let links = path.alloc_links(&[l, r])?;
            internal_replace(node, idx - 1, 2, &links).map(Some)
        }
        (Rebalance::RedistributeRight, _, Some(right)) => {
            let (l, r) = node_redistribute(&updated, &right)?;
            if r.nkeys() == right.nkeys() {
                return keep_child(path, node, idx, updated).map(Some);
            }
            debug!(
                "  → moving {} records from the right sibling into child {}",
                right.nkeys().abs_diff(r.nkeys()),
                kid_ptr
            );
            path.supersede(node.ptr(idx + 1)?);
            let links = path.alloc_links(&[l, r])?;
            internal_replace(node, idx, 2, &links).map(Some)
        }
        _ => keep_child(path, node, idx, updated).map(Some),
    }
}

/// Link `updated` in place of child `idx`. An emptied only child is
/// dropped, leaving the parent empty for its own parent to deal with.
fn keep_child<S: PageStore>(
    path: &mut PathWriter<'_, S>,
    node: &Node,
    idx: u16,
    updated: Node,
) -> TreeResult<Node> {
    if updated.nkeys() == 0 {
        return internal_replace(node, idx, 1, &[]);
    }
    let links = path.alloc_links(std::slice::from_ref(&updated))?;
    internal_replace(node, idx, 1, &links)
}
