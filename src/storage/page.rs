// ┌─────────────────────────────────────────────────────────────────────────┐
// │ Offset              │ Length   │ Description                            │
// │─────────────────────┼──────────┼────────────────────────────────────────│
// │   0                 │   2      │ NODE_TYPE (1 = internal, 2 = leaf)     │
// │   2                 │   2      │ NKEYS (u16)                            │
// │   4                 │ 8*nkeys  │ child pointers (u64, zero for leaves)  │
// │   4 + 8*nkeys       │ 2*nkeys  │ offsets of records 1..=nkeys (u16)     │
// │   4 + 10*nkeys      │   ...    │ records                                │
// └─────────────────────────────────────────────────────────────────────────┘

// ┌───────────────────────────────────────────────────────────────────────┐
// │ Offset (from record start)   │ Length │ Description                   │
// │──────────────────────────────┼────────┼───────────────────────────────│
// │        0                     │   2    │ KEY_LEN (u16, little-endian)  │
// │        2                     │   2    │ VAL_LEN (u16, little-endian)  │
// │        4                     │   K    │ KEY_BYTES                     │
// │        4 + K                 │   V    │ VAL_BYTES                     │
// └───────────────────────────────────────────────────────────────────────┘

use std::fmt;

use crate::error::{TreeError, TreeResult};

pub const PAGE_SIZE: usize = 4096;

pub const NODE_TYPE_OFFSET: usize = 0;      // 2 bytes (u16)
pub const NKEYS_OFFSET: usize     = 2;      // 2 bytes (u16)
pub const HEADER: usize           = 4;      // total header length

pub const PTR_SIZE: usize    = 8;
pub const OFFSET_SIZE: usize = 2;
pub const KV_HEADER: usize   = 4;           // key length + value length

pub const MAX_KEY_SIZE: usize = 1000;
pub const MAX_VAL_SIZE: usize = 3000;

/// A node below this many bytes is merged with, or refilled from, a sibling.
pub const MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

/// Nodes under construction may hold up to two pages worth of records
/// before they are split.
pub const SCRATCH_SIZE: usize = 2 * PAGE_SIZE;

pub const NODE_INTERNAL: u16 = 1;
pub const NODE_LEAF: u16     = 2;

const _: () = assert!(
    HEADER + PTR_SIZE + OFFSET_SIZE + KV_HEADER + MAX_KEY_SIZE + MAX_VAL_SIZE <= PAGE_SIZE
);
const _: () = assert!(2 * MERGE_THRESHOLD <= PAGE_SIZE);

/// Page identifier handed out by a page store. Zero means "no page".
pub type PagePtr = u64;

/// A single 4 KiB page of data.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new() -> Self {
        Page { data: [0; PAGE_SIZE] }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    Leaf,
}

impl NodeType {
    pub fn as_raw(self) -> u16 {
        match self {
            NodeType::Internal => NODE_INTERNAL,
            NodeType::Leaf => NODE_LEAF,
        }
    }

    pub fn from_raw(raw: u16) -> TreeResult<Self> {
        match raw {
            NODE_INTERNAL => Ok(NodeType::Internal),
            NODE_LEAF => Ok(NodeType::Leaf),
            other => Err(TreeError::Corrupt(format!("unknown node type {}", other))),
        }
    }
}

/// Decoded view over the bytes of one tree node.
///
/// A node read from a page store is never modified; every mutation of the
/// tree builds a fresh node with [`Node::new`] and fills it through
/// [`crate::storage::split::node_append_kv`] and
/// [`crate::storage::split::node_append_range`].
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    data: Vec<u8>,
}

impl Node {
    /// Create an empty scratch node with the given header. The buffer is
    /// large enough to hold an oversized node awaiting a split.
    pub fn new(node_type: NodeType, nkeys: u16) -> Self {
        let mut node = Node { data: vec![0; SCRATCH_SIZE] };
        node.set_header(node_type, nkeys);
        node
    }

    /// Decode a node image, checking that the header, offsets and record
    /// lengths all agree with each other and with the buffer size.
    pub fn decode(bytes: &[u8]) -> TreeResult<Self> {
        if bytes.len() < HEADER {
            return Err(TreeError::Corrupt(format!(
                "{}-byte buffer is shorter than the node header",
                bytes.len()
            )));
        }
        let node = Node { data: bytes.to_vec() };
        node.node_type()?;

        let nkeys = node.nkeys();
        let mut prev = 0u16;
        for i in 1..=nkeys {
            let offset = node.offset(i)?;
            if offset < prev {
                return Err(TreeError::Corrupt(format!(
                    "offset {} of record {} is below the previous offset {}",
                    offset, i, prev
                )));
            }
            prev = offset;
        }
        if node.nbytes()? > bytes.len() {
            return Err(TreeError::Corrupt(format!(
                "node claims {} bytes but the buffer holds {}",
                node.nbytes()?,
                bytes.len()
            )));
        }
        for i in 0..nkeys {
            let pos = node.kv_pos(i)?;
            let klen = node.read_u16(pos)? as usize;
            let vlen = node.read_u16(pos + 2)? as usize;
            if pos + KV_HEADER + klen + vlen != node.kv_pos(i + 1)? {
                return Err(TreeError::Corrupt(format!(
                    "record {} lengths do not match its offsets",
                    i
                )));
            }
        }
        Ok(node)
    }

    pub fn from_page(page: &Page) -> TreeResult<Self> {
        Self::decode(&page.data)
    }

    /// Encode into a page. Fails if the node has not been split down to
    /// page size.
    pub fn to_page(&self) -> TreeResult<Box<Page>> {
        let used = self.nbytes()?;
        if used > PAGE_SIZE {
            return Err(TreeError::PageOverflow(used));
        }
        let mut page = Box::new(Page::new());
        page.data[..used].copy_from_slice(self.bytes(0, used)?);
        Ok(page)
    }

    /// The occupied prefix of the node buffer.
    pub fn as_bytes(&self) -> TreeResult<&[u8]> {
        self.bytes(0, self.nbytes()?)
    }

    pub fn node_type(&self) -> TreeResult<NodeType> {
        NodeType::from_raw(self.read_u16(NODE_TYPE_OFFSET)?)
    }

    pub fn is_leaf(&self) -> TreeResult<bool> {
        Ok(self.node_type()? == NodeType::Leaf)
    }

    pub fn nkeys(&self) -> u16 {
        // Every constructor guarantees at least HEADER bytes.
        u16::from_le_bytes([self.data[NKEYS_OFFSET], self.data[NKEYS_OFFSET + 1]])
    }

    pub fn set_header(&mut self, node_type: NodeType, nkeys: u16) {
        self.data[NODE_TYPE_OFFSET..NODE_TYPE_OFFSET + 2]
            .copy_from_slice(&node_type.as_raw().to_le_bytes());
        self.data[NKEYS_OFFSET..NKEYS_OFFSET + 2].copy_from_slice(&nkeys.to_le_bytes());
    }

    /// Child pointer `idx`. Leaves store zero in every slot.
    pub fn ptr(&self, idx: u16) -> TreeResult<PagePtr> {
        self.check_index(idx)?;
        let pos = HEADER + PTR_SIZE * idx as usize;
        let raw = self.bytes(pos, PTR_SIZE)?;
        let mut buf = [0u8; PTR_SIZE];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn set_ptr(&mut self, idx: u16, ptr: PagePtr) -> TreeResult<()> {
        self.check_index(idx)?;
        let pos = HEADER + PTR_SIZE * idx as usize;
        self.bytes_mut(pos, PTR_SIZE)?.copy_from_slice(&ptr.to_le_bytes());
        Ok(())
    }

    /// Offset of the start of record `idx` within the record area.
    /// `idx == nkeys` gives the end of the last record.
    pub fn offset(&self, idx: u16) -> TreeResult<u16> {
        if idx == 0 {
            return Ok(0);
        }
        let pos = self.offset_pos(idx)?;
        self.read_u16(pos)
    }

    /// Offset 0 is implicit and cannot be written.
    pub fn set_offset(&mut self, idx: u16, offset: u16) -> TreeResult<()> {
        if idx == 0 {
            return Err(TreeError::OutOfRange { index: 0, nkeys: self.nkeys() });
        }
        let pos = self.offset_pos(idx)?;
        self.write_u16(pos, offset)
    }

    /// Absolute position of record `idx` in the node buffer.
    pub fn kv_pos(&self, idx: u16) -> TreeResult<usize> {
        let nkeys = self.nkeys();
        if idx > nkeys {
            return Err(TreeError::OutOfRange { index: idx as usize, nkeys });
        }
        Ok(self.records_start() + self.offset(idx)? as usize)
    }

    pub fn key(&self, idx: u16) -> TreeResult<&[u8]> {
        self.check_index(idx)?;
        let pos = self.kv_pos(idx)?;
        let klen = self.read_u16(pos)? as usize;
        self.bytes(pos + KV_HEADER, klen)
    }

    pub fn val(&self, idx: u16) -> TreeResult<&[u8]> {
        self.check_index(idx)?;
        let pos = self.kv_pos(idx)?;
        let klen = self.read_u16(pos)? as usize;
        let vlen = self.read_u16(pos + 2)? as usize;
        self.bytes(pos + KV_HEADER + klen, vlen)
    }

    /// Total bytes used by the node: header, slots and records.
    pub fn nbytes(&self) -> TreeResult<usize> {
        self.kv_pos(self.nkeys())
    }

    /// Size of a standalone node holding records `[start, end)` of this one.
    pub fn range_bytes(&self, start: u16, end: u16) -> TreeResult<usize> {
        if start > end {
            return Err(TreeError::OutOfRange { index: start as usize, nkeys: self.nkeys() });
        }
        let n = (end - start) as usize;
        let records = self
            .offset(end)?
            .checked_sub(self.offset(start)?)
            .ok_or_else(|| TreeError::Corrupt(format!("offsets decrease between {} and {}", start, end)))?
            as usize;
        Ok(HEADER + (PTR_SIZE + OFFSET_SIZE) * n + records)
    }

    /// Raw bytes `[pos, pos + len)`, used when copying records wholesale.
    pub(crate) fn bytes(&self, pos: usize, len: usize) -> TreeResult<&[u8]> {
        self.data.get(pos..pos + len).ok_or_else(|| {
            TreeError::Corrupt(format!(
                "read of {} bytes at {} runs past the {}-byte node buffer",
                len,
                pos,
                self.data.len()
            ))
        })
    }

    pub(crate) fn bytes_mut(&mut self, pos: usize, len: usize) -> TreeResult<&mut [u8]> {
        self.data
            .get_mut(pos..pos + len)
            .ok_or(TreeError::PageOverflow(pos + len))
    }

    pub(crate) fn read_u16(&self, pos: usize) -> TreeResult<u16> {
        let raw = self.bytes(pos, 2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub(crate) fn write_u16(&mut self, pos: usize, val: u16) -> TreeResult<()> {
        self.bytes_mut(pos, 2)?.copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    fn check_index(&self, idx: u16) -> TreeResult<()> {
        let nkeys = self.nkeys();
        if idx >= nkeys {
            return Err(TreeError::OutOfRange { index: idx as usize, nkeys });
        }
        Ok(())
    }

    // Slot holding the end offset of record idx - 1.
    fn offset_pos(&self, idx: u16) -> TreeResult<usize> {
        let nkeys = self.nkeys();
        if idx == 0 || idx > nkeys {
            return Err(TreeError::OutOfRange { index: idx as usize, nkeys });
        }
        Ok(HEADER + PTR_SIZE * nkeys as usize + OFFSET_SIZE * (idx as usize - 1))
    }

    fn records_start(&self) -> usize {
        HEADER + (PTR_SIZE + OFFSET_SIZE) * self.nkeys() as usize
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("type", &self.node_type().ok())
            .field("nkeys", &self.nkeys())
            .field("nbytes", &self.nbytes().ok())
            .finish()
    }
}
