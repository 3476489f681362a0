pub mod page;
pub mod lookup;
pub mod split;
pub mod merge;
pub mod pager;
pub mod btree;
pub mod verify;
