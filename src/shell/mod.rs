pub mod parser;

use std::fmt;
use std::path::Path;

use log::{debug, info};

use crate::error::TreeResult;
use crate::storage::btree::BTree;
use crate::storage::pager::Pager;
use crate::storage::verify::TreeStats;

pub use parser::parse_command;

/// One line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(Vec<u8>),
    Set(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
    Stats,
    Exit,
}

/// What a command produced, ready to be printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(Option<Vec<u8>>),
    Stored { replaced: bool },
    Deleted(bool),
    Stats(TreeStats),
    Exit,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(Some(val)) => write!(f, "{:?}", String::from_utf8_lossy(val)),
            Reply::Value(None) => write!(f, "(not found)"),
            Reply::Stored { replaced: true } => write!(f, "updated"),
            Reply::Stored { replaced: false } => write!(f, "inserted"),
            Reply::Deleted(true) => write!(f, "deleted"),
            Reply::Deleted(false) => write!(f, "(not found)"),
            Reply::Stats(stats) => write!(f, "{}", stats),
            Reply::Exit => Ok(()),
        }
    }
}

/// A B+tree on a database file, driven one command at a time.
pub struct Shell {
    tree: BTree<Pager>,
}

impl Shell {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> TreeResult<Self> {
        let pager = Pager::new(path)?;
        let root = pager.root();
        info!("Database opened with root page {}", root);
        Ok(Shell { tree: BTree::open(pager, root) })
    }

    pub fn execute(&mut self, cmd: Command) -> TreeResult<Reply> {
        debug!("execute {:?}", cmd);
        match cmd {
            Command::Get(key) => Ok(Reply::Value(self.tree.get(&key)?)),
            Command::Set(key, val) => {
                let previous = self.tree.insert(&key, &val)?;
                self.persist_root()?;
                Ok(Reply::Stored { replaced: previous.is_some() })
            }
            Command::Del(key) => {
                let found = self.tree.delete(&key)?;
                if found {
                    self.persist_root()?;
                }
                Ok(Reply::Deleted(found))
            }
            Command::Stats => Ok(Reply::Stats(self.tree.verify()?)),
            Command::Exit => Ok(Reply::Exit),
        }
    }

    /// Flush the database file.
    pub fn sync(&mut self) -> TreeResult<()> {
        self.tree.store_mut().sync()
    }

    fn persist_root(&mut self) -> TreeResult<()> {
        let root = self.tree.root();
        if root != self.tree.store().root() {
            debug!("root page is now {}", root);
            self.tree.store_mut().set_root(root)?;
        }
        Ok(())
    }
}
