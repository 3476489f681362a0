use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::{TreeError, TreeResult};
use crate::storage::page::{Node, NodeType, Page, PagePtr, PAGE_SIZE};

/// The three operations the tree needs from whatever stores its pages.
pub trait PageStore {
    /// Return the node previously allocated under `ptr`.
    fn fetch(&mut self, ptr: PagePtr) -> TreeResult<Node>;

    /// Persist `node` and return a fresh, non-zero identifier for it.
    fn allocate(&mut self, node: &Node) -> TreeResult<PagePtr>;

    /// Give `ptr` back for reuse. It must no longer be reachable.
    fn release(&mut self, ptr: PagePtr) -> TreeResult<()>;
}

impl<S: PageStore + ?Sized> PageStore for &mut S {
    fn fetch(&mut self, ptr: PagePtr) -> TreeResult<Node> {
        (**self).fetch(ptr)
    }

    fn allocate(&mut self, node: &Node) -> TreeResult<PagePtr> {
        (**self).allocate(node)
    }

    fn release(&mut self, ptr: PagePtr) -> TreeResult<()> {
        (**self).release(ptr)
    }
}

/// Page store kept entirely in memory. Released identifiers are reused,
/// lowest first.
pub struct MemPager {
    pages: HashMap<PagePtr, Box<Page>>,
    free: BTreeSet<PagePtr>,
    next: PagePtr,
}

impl MemPager {
    pub fn new() -> Self {
        MemPager {
            pages: HashMap::new(),
            free: BTreeSet::new(),
            next: 1,
        }
    }

    /// Number of live (allocated, not released) pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, ptr: PagePtr) -> bool {
        self.pages.contains_key(&ptr)
    }
}

impl Default for MemPager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemPager {
    fn fetch(&mut self, ptr: PagePtr) -> TreeResult<Node> {
        let page = self.pages.get(&ptr).ok_or(TreeError::PageNotFound(ptr))?;
        Node::from_page(page)
    }

    fn allocate(&mut self, node: &Node) -> TreeResult<PagePtr> {
        let page = node.to_page()?;
        let ptr = match self.free.pop_first() {
            Some(ptr) => ptr,
            None => {
                let ptr = self.next;
                self.next += 1;
                ptr
            }
        };
        self.pages.insert(ptr, page);
        Ok(ptr)
    }

    fn release(&mut self, ptr: PagePtr) -> TreeResult<()> {
        if self.pages.remove(&ptr).is_none() {
            return Err(TreeError::PageNotFound(ptr));
        }
        self.free.insert(ptr);
        Ok(())
    }
}

// ┌───────────────────────────────────────────────────────────────┐
// │ Meta page (page 0)                                            │
// │────────┬────────┬─────────────────────────────────────────────│
// │   0    │   8    │ MAGIC "AEROKV01"                            │
// │   8    │   8    │ ROOT (u64, 0 = empty tree)                  │
// │  16    │   8    │ NUM_PAGES (u64, including the meta page)    │
// └────────┴────────┴─────────────────────────────────────────────┘
pub const MAGIC: &[u8; 8] = b"AEROKV01";
const ROOT_OFFSET: usize = 8;
const NUM_PAGES_OFFSET: usize = 16;

/// Pager: stores 4 KiB pages in a single file and keeps a simple in-memory
/// cache. Page 0 holds the meta record; tree pages start at 1.
///
/// Allocation writes the page straight through to the file. The free list
/// lives in memory; opening an existing file rebuilds it from every page the
/// recorded root cannot reach.
pub struct Pager {
    file: File,

    /// The number of pages that are known to be present in the file.
    file_length_pages: u64,

    /// The total number of pages handed out so far, meta page included.
    num_pages: u64,

    /// `cache[page_num] = Some(Box<Page>)` if that page is loaded.
    cache: Vec<Option<Box<Page>>>,

    free: BTreeSet<PagePtr>,

    root: PagePtr,
}

impl Pager {
    /// Open (or create) the database file at `filename`. A new file gets a
    /// meta page describing an empty tree.
    pub fn new(filename: impl AsRef<Path>) -> TreeResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(filename.as_ref())?;
        let file_len = file.metadata()?.len();
        let file_length_pages = file_len / PAGE_SIZE as u64;

        if file_len % PAGE_SIZE as u64 != 0 {
            return Err(TreeError::Corrupt(format!(
                "{} is {} bytes, not a whole number of pages",
                filename.as_ref().display(),
                file_len
            )));
        }
        if file_len == 0 {
            debug!("Initializing new database at {}", filename.as_ref().display());
            let mut pager = Pager {
                file,
                file_length_pages: 0,
                num_pages: 1,
                cache: Vec::new(),
                free: BTreeSet::new(),
                root: 0,
            };
            pager.write_meta()?;
            return Ok(pager);
        }

        let mut meta = Page::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut meta.data)?;
        if &meta.data[..MAGIC.len()] != MAGIC {
            return Err(TreeError::Corrupt(format!(
                "{} is not an aerokv file",
                filename.as_ref().display()
            )));
        }
        let root = read_u64(&meta, ROOT_OFFSET);
        let num_pages = read_u64(&meta, NUM_PAGES_OFFSET);
        if num_pages == 0 || num_pages > file_length_pages || root >= num_pages {
            return Err(TreeError::Corrupt(format!(
                "meta page claims {} pages with root {} but the file holds {}",
                num_pages, root, file_length_pages
            )));
        }
        debug!(
            "Opened existing database: {} pages, root page {}",
            num_pages, root
        );

        let mut pager = Pager {
            file,
            file_length_pages,
            num_pages,
            cache: Vec::new(),
            free: BTreeSet::new(),
            root,
        };
        pager.rebuild_free_list()?;
        Ok(pager)
    }

    /// Root pointer recorded in the meta page.
    pub fn root(&self) -> PagePtr {
        self.root
    }

    /// Record a new root pointer (and the current page count) in the meta
    /// page.
    pub fn set_root(&mut self, root: PagePtr) -> TreeResult<()> {
        self.root = root;
        self.write_meta()
    }

    /// Flush the file to stable storage.
    pub fn sync(&mut self) -> TreeResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// How many pages the file holds, meta page included.
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// How many released pages are waiting to be reused.
    pub fn free_pages(&self) -> usize {
        self.free.len()
    }

    /// Mark every page the root cannot reach as free.
    fn rebuild_free_list(&mut self) -> TreeResult<()> {
        let mut reachable = BTreeSet::new();
        let mut pending = Vec::new();
        if self.root != 0 {
            pending.push(self.root);
        }
        while let Some(ptr) = pending.pop() {
            if ptr == 0 || ptr >= self.num_pages {
                return Err(TreeError::Corrupt(format!("child pointer {} is out of range", ptr)));
            }
            if !reachable.insert(ptr) {
                return Err(TreeError::Corrupt(format!("page {} is linked twice", ptr)));
            }
            let node = Node::from_page(self.get_page(ptr)?)?;
            if node.node_type()? == NodeType::Internal {
                for i in 0..node.nkeys() {
                    pending.push(node.ptr(i)?);
                }
            }
        }
        self.free = (1..self.num_pages).filter(|p| !reachable.contains(p)).collect();
        if !self.free.is_empty() {
            debug!("{} unreachable pages are free for reuse", self.free.len());
        }
        Ok(())
    }

    fn check_live(&self, ptr: PagePtr) -> TreeResult<()> {
        if ptr == 0 || ptr >= self.num_pages || self.free.contains(&ptr) {
            return Err(TreeError::PageNotFound(ptr));
        }
        Ok(())
    }

    /// Return the requested page, loading it from disk on a cache miss.
    fn get_page(&mut self, page_num: u64) -> TreeResult<&Page> {
        let idx = page_num as usize;
        if self.cache.len() <= idx {
            self.cache.resize_with(idx + 1, || None);
        }
        if self.cache[idx].is_none() {
            let mut page = Box::new(Page::new());
            self.file.seek(SeekFrom::Start(page_num * PAGE_SIZE as u64))?;
            self.file.read_exact(&mut page.data)?;
            self.cache[idx] = Some(page);
        }
        self.cache[idx]
            .as_deref()
            .ok_or(TreeError::PageNotFound(page_num))
    }

    /// Write `page` to disk at `page_num` and cache it.
    fn put_page(&mut self, page_num: u64, page: Box<Page>) -> TreeResult<()> {
        self.file.seek(SeekFrom::Start(page_num * PAGE_SIZE as u64))?;
        self.file.write_all(&page.data)?;
        self.file.flush()?;
        if page_num >= self.file_length_pages {
            self.file_length_pages = page_num + 1;
        }

        let idx = page_num as usize;
        if self.cache.len() <= idx {
            self.cache.resize_with(idx + 1, || None);
        }
        self.cache[idx] = Some(page);
        Ok(())
    }

    fn write_meta(&mut self) -> TreeResult<()> {
        let mut meta = Box::new(Page::new());
        meta.data[..MAGIC.len()].copy_from_slice(MAGIC);
        meta.data[ROOT_OFFSET..ROOT_OFFSET + 8].copy_from_slice(&self.root.to_le_bytes());
        meta.data[NUM_PAGES_OFFSET..NUM_PAGES_OFFSET + 8]
            .copy_from_slice(&self.num_pages.to_le_bytes());
        self.put_page(0, meta)
    }
}

impl PageStore for Pager {
    fn fetch(&mut self, ptr: PagePtr) -> TreeResult<Node> {
        self.check_live(ptr)?;
        Node::from_page(self.get_page(ptr)?)
    }

    fn allocate(&mut self, node: &Node) -> TreeResult<PagePtr> {
        let page = node.to_page()?;
        let ptr = match self.free.pop_first() {
            Some(ptr) => ptr,
            None => {
                let ptr = self.num_pages;
                self.num_pages += 1;
                ptr
            }
        };
        self.put_page(ptr, page)?;
        Ok(ptr)
    }

    fn release(&mut self, ptr: PagePtr) -> TreeResult<()> {
        self.check_live(ptr)?;
        self.free.insert(ptr);
        if let Some(slot) = self.cache.get_mut(ptr as usize) {
            *slot = None;
        }
        Ok(())
    }
}

fn read_u64(page: &Page, pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&page.data[pos..pos + 8]);
    u64::from_le_bytes(buf)
}
