//! Wire-fixed constants of the on-disk package format.
//!
//! Nothing in this module may change without breaking compatibility with
//! packages already written to disk.

/// Size of every file-data, directory, segment-info, free-list and inode
/// block.
pub const BLOCK_SIZE: u64 = 4096;

/// Start of the bootstrap region.
pub const BOOTSTRAP_OFFSET: u64 = 0;
/// Size of the bootstrap region: `[0, 3 MiB)`.
pub const BOOTSTRAP_SIZE: u64 = 3 * 1024 * 1024;

/// Number of slots in the inode lookup table.
pub const LOOKUP_TABLE_SLOTS: usize = 65536;
/// Size in bytes of one lookup table slot (an absolute block offset).
pub const LOOKUP_SLOT_SIZE: u64 = 4;
/// Start of the inode lookup table: `[3 MiB, 3 MiB + 256 KiB)`.
pub const LOOKUP_TABLE_OFFSET: u64 = BOOTSTRAP_OFFSET + BOOTSTRAP_SIZE;
/// Size in bytes of the inode lookup table.
pub const LOOKUP_TABLE_SIZE: u64 = 256 * 1024;

/// Start of the filesystem-info block.
pub const FS_INFO_OFFSET: u64 = LOOKUP_TABLE_OFFSET + LOOKUP_TABLE_SIZE;

/// Start of the data region: the first byte at or after which every inode
/// and data block lives.
pub const DATA_OFFSET: u64 = FS_INFO_OFFSET + BLOCK_SIZE;

/// Maximum number of children a directory may hold.
pub const MAX_CHILDREN: usize = 1901;

/// Maximum length, in bytes, of a file's contents.
pub const MAX_FILE_LEN: u64 = 0xFFFF_FFFFu64 - DATA_OFFSET - 10 * 1024 * 1024;

/// The 10-byte tag at the start of the filesystem-info block.
pub const MAGIC: &[u8; 10] = b"AppFS\0\0\0\0\0";

/// The root directory always lives at inode id 0.
pub const ROOT_INODE_ID: u16 = 0;

/// Maximum length of a filename, including the terminating NUL.
pub const FILENAME_LEN: usize = 256;

/// Declared length of the meaningful portion of a file-info/symlink/device
/// header, before the segment-pointer array. The remaining bytes up to
/// [`BLOCK_SIZE`] are the segment-pointer array.
pub const FILE_INFO_HEADER_LEN: u64 = 308;
/// Number of 4-byte segment pointers embedded directly in a file-info block.
pub const FILE_INFO_SEGMENT_PTRS: usize = ((BLOCK_SIZE - FILE_INFO_HEADER_LEN) / 4) as usize;

/// Declared length of a segment-info block's header (generic prefix + next
/// pointer).
pub const SEGMENT_INFO_HEADER_LEN: u64 = 8;
/// Number of 4-byte segment pointers in a segment-info block.
pub const SEGMENT_INFO_PTRS: usize = ((BLOCK_SIZE - SEGMENT_INFO_HEADER_LEN) / 4) as usize;

/// Declared length of a directory block's header, before the child array.
pub const DIRECTORY_HEADER_LEN: u64 = 294;
/// Declared length of a hardlink block: filename + real inode id.
pub const HARDLINK_BODY_LEN: u64 = FILENAME_LEN as u64 + 2;

/// Declared length of a free-list block's header (generic prefix + next
/// pointer).
pub const FREELIST_HEADER_LEN: u64 = 8;
/// Number of 4-byte free block offsets in a free-list block.
pub const FREELIST_PTRS: usize = ((BLOCK_SIZE - FREELIST_HEADER_LEN) / 4) as usize;

/// Declared length of the meaningful portion of the filesystem-info block.
pub const FS_INFO_HEADER_LEN: u64 = 1614;
/// App-metadata field widths inside the filesystem-info block.
pub const APP_NAME_LEN: usize = 256;
pub const APP_VERSION_LEN: usize = 32;
pub const APP_DESCRIPTION_LEN: usize = 1024;
pub const APP_AUTHOR_LEN: usize = 256;

/// Rounds `n` up to the next multiple of [`BLOCK_SIZE`].
pub const fn round_up_block(n: u64) -> u64 {
    (n + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// Number of blocks needed to hold `len` bytes.
pub const fn blocks_for_len(len: u64) -> u64 {
    (len + BLOCK_SIZE - 1) / BLOCK_SIZE
}
