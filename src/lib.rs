//! `appfs` is the on-disk package-filesystem engine: a single flat file
//! holding an inode lookup table, a free-block list, and block-addressed
//! file/directory/symlink/hardlink content, manipulable without mounting
//! anything.
//!
//! [`pathfs::PathFs`] is the entry point most callers want; [`engine::Engine`]
//! is the lower-level block/inode manipulation layer it's built on.

pub mod block_stream;
pub mod endian;
pub mod engine;
pub mod error;
pub mod filestream;
pub mod freelist;
pub mod inode;
pub mod layout;
pub mod pathfs;
pub mod util;

pub use engine::{Engine, PackageMeta};
pub use error::{Error, Result};
pub use pathfs::{Attr, Context, PathFs};
