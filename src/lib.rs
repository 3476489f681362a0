pub mod storage;
pub mod shell;
pub mod error;
