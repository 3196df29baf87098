// Library crate: re-export the pass-through core for reuse by external bins
// and tests.

#[macro_use]
extern crate log;

pub mod error;
pub mod fuse;
pub mod inode;
pub mod passthrough;

pub use error::{FsError, FsResult};
pub use inode::{InodeTable, ROOT_INODE};
pub use passthrough::PassthroughFs;
