use thiserror::Error;
use std::io;

use crate::storage::page::{MAX_KEY_SIZE, MAX_VAL_SIZE, PAGE_SIZE};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("index {index} out of range for node with {nkeys} keys")]
    OutOfRange { index: usize, nkeys: u16 },
    #[error("key of {0} bytes exceeds the {MAX_KEY_SIZE}-byte limit")]
    KeyTooLarge(usize),
    #[error("value of {0} bytes exceeds the {MAX_VAL_SIZE}-byte limit")]
    ValueTooLarge(usize),
    #[error("node of {0} bytes does not fit in a {PAGE_SIZE}-byte page")]
    PageOverflow(usize),
    #[error("page {0} not found")]
    PageNotFound(u64),
    #[error("corrupt page: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TreeResult<T> = Result<T, TreeError>;
