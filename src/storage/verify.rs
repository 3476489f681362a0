use std::fmt;

use crate::error::{TreeError, TreeResult};
use crate::storage::btree::BTree;
use crate::storage::page::{NodeType, PagePtr, PAGE_SIZE};
use crate::storage::pager::PageStore;

/// Shape of a tree as seen by [`BTree::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels; 0 for an empty tree.
    pub height: usize,
    pub leaf_pages: usize,
    pub internal_pages: usize,
    /// Number of key/value pairs stored in leaves.
    pub keys: usize,
    /// Bytes occupied across all pages.
    pub bytes: usize,
}

impl TreeStats {
    pub fn pages(&self) -> usize {
        self.leaf_pages + self.internal_pages
    }
}

impl fmt::Display for TreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "height {}, {} keys in {} leaf and {} internal pages ({} bytes used)",
            self.height, self.keys, self.leaf_pages, self.internal_pages, self.bytes
        )
    }
}

impl<S: PageStore> BTree<S> {
    /// Walk every page reachable from the root and check the structural
    /// invariants: page size, key order, offsets, non-empty non-root nodes,
    /// non-zero child pointers, separators equal to the child's first key,
    /// keys below the next separator, and leaves all at one depth.
    pub fn verify(&mut self) -> TreeResult<TreeStats> {
        let mut stats = TreeStats::default();
        let root = self.root();
        if root == 0 {
            return Ok(stats);
        }
        let mut walk = Walk {
            stats: &mut stats,
            leaf_depth: None,
        };
        walk.visit(self.store_mut(), root, 1, None, None)?;
        Ok(stats)
    }
}

struct Walk<'a> {
    stats: &'a mut TreeStats,
    leaf_depth: Option<usize>,
}

impl Walk<'_> {
    fn visit<S: PageStore>(
        &mut self,
        store: &mut S,
        ptr: PagePtr,
        depth: usize,
        separator: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> TreeResult<()> {
        let node = store.fetch(ptr)?;
        let nkeys = node.nkeys();
        let nbytes = node.nbytes()?;
        let corrupt = |what: String| TreeError::Corrupt(format!("page {}: {}", ptr, what));

        if nbytes > PAGE_SIZE {
            return Err(corrupt(format!("{} bytes exceed the page size", nbytes)));
        }
        if nkeys == 0 {
            return Err(corrupt("node has no keys".to_string()));
        }
        for i in 1..=nkeys {
            if node.offset(i)? < node.offset(i - 1)? {
                return Err(corrupt(format!("offset {} decreases", i)));
            }
        }
        for i in 1..nkeys {
            if node.key(i - 1)? >= node.key(i)? {
                return Err(corrupt(format!("keys {} and {} are out of order", i - 1, i)));
            }
        }
        if let Some(separator) = separator {
            if node.key(0)? != separator {
                return Err(corrupt("first key differs from the parent separator".to_string()));
            }
        }
        if let Some(upper) = upper {
            if node.key(nkeys - 1)? >= upper {
                return Err(corrupt("keys reach past the next separator".to_string()));
            }
        }

        self.stats.bytes += nbytes;
        self.stats.height = self.stats.height.max(depth);
        match node.node_type()? {
            NodeType::Leaf => {
                match self.leaf_depth {
                    Some(expected) if expected != depth => {
                        return Err(corrupt(format!(
                            "leaf at depth {} but others at {}",
                            depth, expected
                        )));
                    }
                    _ => self.leaf_depth = Some(depth),
                }
                self.stats.leaf_pages += 1;
                self.stats.keys += nkeys as usize;
            }
            NodeType::Internal => {
                self.stats.internal_pages += 1;
                for i in 0..nkeys {
                    let kid = node.ptr(i)?;
                    if kid == 0 {
                        return Err(corrupt(format!("child pointer {} is null", i)));
                    }
                    let next = if i + 1 < nkeys { Some(node.key(i + 1)?) } else { upper };
                    self.visit(store, kid, depth + 1, Some(node.key(i)?), next)?;
                }
            }
        }
        Ok(())
    }
}
