//! Encodes and decodes each on-disk inode variant to/from its fixed block
//! layout.
//!
//! Every variant round-trips through [`Inode::encode`]/[`Inode::decode`].
//! `decode` never hands back a `Temporary`, `FreeBlock` or raw `Unset` block
//! to a public caller of the engine; those surface as [`Inode::Invalid`]
//! instead (see the verification rule below).

use std::io::{Cursor, Read, Write};

use crate::endian::{pack_fixed, unpack_fixed, ReadLe, WriteLe};
use crate::error::{Error, Result};
use crate::layout::*;

/// On-disk type tags. Values are wire-fixed; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    FreeBlock = 0,
    FileInfo = 1,
    SegmentInfo = 2,
    Directory = 3,
    Symlink = 4,
    Hardlink = 5,
    Temporary = 6,
    FreeList = 7,
    FsInfo = 8,
    Invalid = 9,
    Device = 10,
    Data = 254,
    Unset = 255,
}

impl InodeType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => InodeType::FreeBlock,
            1 => InodeType::FileInfo,
            2 => InodeType::SegmentInfo,
            3 => InodeType::Directory,
            4 => InodeType::Symlink,
            5 => InodeType::Hardlink,
            6 => InodeType::Temporary,
            7 => InodeType::FreeList,
            8 => InodeType::FsInfo,
            10 => InodeType::Device,
            254 => InodeType::Data,
            9 | _ => InodeType::Invalid,
        }
    }
}

/// Shared shape of file-info, symlink and device inodes: a 308-byte header
/// (see [`FILE_INFO_HEADER_LEN`]) followed by an array of segment pointers
/// padding the block out to [`BLOCK_SIZE`].
#[derive(Debug, Clone)]
pub struct FileLikeInode {
    pub id: u16,
    pub filename: Vec<u8>,
    pub uid: u16,
    pub gid: u16,
    pub mode_mask: u16,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub dev: u16,
    pub rdev: u16,
    pub nlink: u16,
    pub blocks_allocated: u16,
    pub data_length: u32,
    pub next_segment_info: u32,
    /// Segment pointers embedded directly in this block.
    pub segment_ptrs: Vec<u32>,
}

impl FileLikeInode {
    pub fn new(id: u16, filename: &[u8], uid: u16, gid: u16, mode_mask: u16, now: i64) -> Self {
        Self {
            id,
            filename: filename.to_vec(),
            uid,
            gid,
            mode_mask,
            atime: now,
            mtime: now,
            ctime: now,
            dev: 0,
            rdev: 0,
            nlink: 1,
            blocks_allocated: 0,
            data_length: 0,
            next_segment_info: 0,
            segment_ptrs: vec![0; FILE_INFO_SEGMENT_PTRS],
        }
    }

    fn encode_body(&self, type_tag: InodeType, w: &mut impl Write) -> Result<()> {
        w.write_u16_le(self.id)?;
        w.write_u16_le(type_tag as u16)?;
        let mut header = Vec::with_capacity(FILE_INFO_HEADER_LEN as usize - 4);
        header.extend_from_slice(&pack_fixed::<FILENAME_LEN>(&self.filename));
        header.extend_from_slice(&self.uid.to_le_bytes());
        header.extend_from_slice(&self.gid.to_le_bytes());
        header.extend_from_slice(&self.mode_mask.to_le_bytes());
        header.extend_from_slice(&self.atime.to_le_bytes());
        header.extend_from_slice(&self.mtime.to_le_bytes());
        header.extend_from_slice(&self.ctime.to_le_bytes());
        header.extend_from_slice(&self.dev.to_le_bytes());
        header.extend_from_slice(&self.rdev.to_le_bytes());
        header.extend_from_slice(&self.nlink.to_le_bytes());
        header.extend_from_slice(&self.blocks_allocated.to_le_bytes());
        header.extend_from_slice(&self.data_length.to_le_bytes());
        header.extend_from_slice(&self.next_segment_info.to_le_bytes());
        // Pad the declared header length; the discrepancy between the sum of
        // named fields and FILE_INFO_HEADER_LEN is reserved space in the
        // original layout.
        w.write_padded(&header, (FILE_INFO_HEADER_LEN - 4) as usize)?;
        for &ptr in &self.segment_ptrs {
            w.write_u32_le(ptr)?;
        }
        Ok(())
    }

    fn decode_body(id: u16, r: &mut impl Read) -> Result<Self> {
        let mut header = vec![0u8; (FILE_INFO_HEADER_LEN - 4) as usize];
        r.read_exact(&mut header)?;
        let mut c = Cursor::new(&header);
        let mut filename_buf = [0u8; FILENAME_LEN];
        c.read_exact(&mut filename_buf)?;
        let filename = unpack_fixed(&filename_buf);
        let uid = c.read_u16_le()?;
        let gid = c.read_u16_le()?;
        let mode_mask = c.read_u16_le()?;
        let atime = c.read_i64_le()?;
        let mtime = c.read_i64_le()?;
        let ctime = c.read_i64_le()?;
        let dev = c.read_u16_le()?;
        let rdev = c.read_u16_le()?;
        let nlink = c.read_u16_le()?;
        let blocks_allocated = c.read_u16_le()?;
        let data_length = c.read_u32_le()?;
        let next_segment_info = c.read_u32_le()?;
        let mut segment_ptrs = Vec::with_capacity(FILE_INFO_SEGMENT_PTRS);
        for _ in 0..FILE_INFO_SEGMENT_PTRS {
            segment_ptrs.push(r.read_u32_le()?);
        }
        Ok(Self {
            id,
            filename,
            uid,
            gid,
            mode_mask,
            atime,
            mtime,
            ctime,
            dev,
            rdev,
            nlink,
            blocks_allocated,
            data_length,
            next_segment_info,
            segment_ptrs,
        })
    }
}

/// A directory's 294-byte header plus its bounded child array.
#[derive(Debug, Clone)]
pub struct DirectoryInode {
    pub id: u16,
    pub filename: Vec<u8>,
    pub uid: u16,
    pub gid: u16,
    pub mode_mask: u16,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub parent: u16,
    pub children_count: u16,
    pub children: Vec<u16>,
}

impl DirectoryInode {
    pub fn new(id: u16, filename: &[u8], uid: u16, gid: u16, mode_mask: u16, parent: u16, now: i64) -> Self {
        Self {
            id,
            filename: filename.to_vec(),
            uid,
            gid,
            mode_mask,
            atime: now,
            mtime: now,
            ctime: now,
            parent,
            children_count: 0,
            children: vec![0; MAX_CHILDREN],
        }
    }

    fn encode(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16_le(self.id)?;
        w.write_u16_le(InodeType::Directory as u16)?;
        w.write_padded(&pack_fixed::<FILENAME_LEN>(&self.filename), FILENAME_LEN)?;
        w.write_u16_le(self.uid)?;
        w.write_u16_le(self.gid)?;
        w.write_u16_le(self.mode_mask)?;
        w.write_i64_le(self.atime)?;
        w.write_i64_le(self.mtime)?;
        w.write_i64_le(self.ctime)?;
        w.write_u16_le(self.parent)?;
        w.write_u16_le(self.children_count)?;
        for &child in &self.children {
            w.write_u16_le(child)?;
        }
        Ok(())
    }

    fn decode(id: u16, r: &mut impl Read) -> Result<Self> {
        let mut filename_buf = [0u8; FILENAME_LEN];
        r.read_exact(&mut filename_buf)?;
        let filename = unpack_fixed(&filename_buf);
        let uid = r.read_u16_le()?;
        let gid = r.read_u16_le()?;
        let mode_mask = r.read_u16_le()?;
        let atime = r.read_i64_le()?;
        let mtime = r.read_i64_le()?;
        let ctime = r.read_i64_le()?;
        let parent = r.read_u16_le()?;
        let children_count = r.read_u16_le()?;
        let mut children = Vec::with_capacity(MAX_CHILDREN);
        for _ in 0..MAX_CHILDREN {
            children.push(r.read_u16_le()?);
        }
        Ok(Self {
            id,
            filename,
            uid,
            gid,
            mode_mask,
            atime,
            mtime,
            ctime,
            parent,
            children_count,
            children,
        })
    }
}

/// A hardlink: just a filename and the real inode id it aliases.
#[derive(Debug, Clone)]
pub struct HardlinkInode {
    pub id: u16,
    pub filename: Vec<u8>,
    pub real_id: u16,
}

impl HardlinkInode {
    fn encode(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16_le(self.id)?;
        w.write_u16_le(InodeType::Hardlink as u16)?;
        w.write_padded(&pack_fixed::<FILENAME_LEN>(&self.filename), FILENAME_LEN)?;
        w.write_u16_le(self.real_id)?;
        Ok(())
    }

    fn decode(id: u16, r: &mut impl Read) -> Result<Self> {
        let mut filename_buf = [0u8; FILENAME_LEN];
        r.read_exact(&mut filename_buf)?;
        let filename = unpack_fixed(&filename_buf);
        let real_id = r.read_u16_le()?;
        Ok(Self {
            id,
            filename,
            real_id,
        })
    }
}

/// An indirection block holding additional segment pointers for a large
/// file.
#[derive(Debug, Clone)]
pub struct SegmentInfoBlock {
    pub next: u32,
    pub pointers: Vec<u32>,
}

impl SegmentInfoBlock {
    pub fn empty() -> Self {
        Self {
            next: 0,
            pointers: vec![0; SEGMENT_INFO_PTRS],
        }
    }

    fn encode(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16_le(0)?; // unused id
        w.write_u16_le(InodeType::SegmentInfo as u16)?;
        w.write_u32_le(self.next)?;
        for &ptr in &self.pointers {
            w.write_u32_le(ptr)?;
        }
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self> {
        let next = r.read_u32_le()?;
        let mut pointers = Vec::with_capacity(SEGMENT_INFO_PTRS);
        for _ in 0..SEGMENT_INFO_PTRS {
            pointers.push(r.read_u32_le()?);
        }
        Ok(Self { next, pointers })
    }
}

/// A block holding offsets of blocks that are currently free.
#[derive(Debug, Clone)]
pub struct FreeListBlock {
    pub next: u32,
    pub offsets: Vec<u32>,
}

impl FreeListBlock {
    pub fn empty() -> Self {
        Self {
            next: 0,
            offsets: vec![0; FREELIST_PTRS],
        }
    }

    fn encode(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16_le(0)?;
        w.write_u16_le(InodeType::FreeList as u16)?;
        w.write_u32_le(self.next)?;
        for &off in &self.offsets {
            w.write_u32_le(off)?;
        }
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self> {
        let next = r.read_u32_le()?;
        let mut offsets = Vec::with_capacity(FREELIST_PTRS);
        for _ in 0..FREELIST_PTRS {
            offsets.push(r.read_u32_le()?);
        }
        Ok(Self { next, offsets })
    }
}

/// The single filesystem-info block: magic, versions, app metadata, and the
/// two roots (root directory, head of the free list).
#[derive(Debug, Clone)]
pub struct FsInfoBlock {
    pub version_major: u16,
    pub version_minor: u16,
    pub version_patch: u16,
    pub app_name: Vec<u8>,
    pub app_version: Vec<u8>,
    pub app_description: Vec<u8>,
    pub app_author: Vec<u8>,
    pub pos_root: u32,
    pub pos_freelist: u32,
}

impl FsInfoBlock {
    fn encode(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16_le(0)?;
        w.write_u16_le(InodeType::FsInfo as u16)?;
        let mut header = Vec::new();
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&self.version_major.to_le_bytes());
        header.extend_from_slice(&self.version_minor.to_le_bytes());
        header.extend_from_slice(&self.version_patch.to_le_bytes());
        header.extend_from_slice(&pack_fixed::<APP_NAME_LEN>(&self.app_name));
        header.extend_from_slice(&pack_fixed::<APP_VERSION_LEN>(&self.app_version));
        header.extend_from_slice(&pack_fixed::<APP_DESCRIPTION_LEN>(&self.app_description));
        header.extend_from_slice(&pack_fixed::<APP_AUTHOR_LEN>(&self.app_author));
        header.extend_from_slice(&self.pos_root.to_le_bytes());
        header.extend_from_slice(&self.pos_freelist.to_le_bytes());
        w.write_padded(&header, (FS_INFO_HEADER_LEN - 4) as usize)?;
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self> {
        let mut header = vec![0u8; (FS_INFO_HEADER_LEN - 4) as usize];
        r.read_exact(&mut header)?;
        let mut c = Cursor::new(&header);
        let mut magic = [0u8; 10];
        c.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InternalInconsistency("bad filesystem magic"));
        }
        let version_major = c.read_u16_le()?;
        let version_minor = c.read_u16_le()?;
        let version_patch = c.read_u16_le()?;
        let mut app_name = [0u8; APP_NAME_LEN];
        c.read_exact(&mut app_name)?;
        let mut app_version = [0u8; APP_VERSION_LEN];
        c.read_exact(&mut app_version)?;
        let mut app_description = [0u8; APP_DESCRIPTION_LEN];
        c.read_exact(&mut app_description)?;
        let mut app_author = [0u8; APP_AUTHOR_LEN];
        c.read_exact(&mut app_author)?;
        let pos_root = c.read_u32_le()?;
        let pos_freelist = c.read_u32_le()?;
        Ok(Self {
            version_major,
            version_minor,
            version_patch,
            app_name: unpack_fixed(&app_name),
            app_version: unpack_fixed(&app_version),
            app_description: unpack_fixed(&app_description),
            app_author: unpack_fixed(&app_author),
            pos_root,
            pos_freelist,
        })
    }
}

/// A decoded inode, tagged by variant.
#[derive(Debug, Clone)]
pub enum Inode {
    File(FileLikeInode),
    Symlink(FileLikeInode),
    Device(FileLikeInode),
    Directory(DirectoryInode),
    Hardlink(HardlinkInode),
    SegmentInfo(SegmentInfoBlock),
    FreeList(FreeListBlock),
    FsInfo(FsInfoBlock),
    /// A block that failed verification, is unset, or carries a reserved
    /// type tag. Never produced for a type the caller asked for explicitly.
    Invalid,
}

impl Inode {
    /// Reads one block's worth of bytes starting at the current position of
    /// `r` and decodes it according to its type tag.
    pub fn decode(r: &mut impl Read) -> Result<Self> {
        let mut prefix = [0u8; 4];
        r.read_exact(&mut prefix)?;
        let id = u16::from_le_bytes([prefix[0], prefix[1]]);
        let ty = InodeType::from_u16(u16::from_le_bytes([prefix[2], prefix[3]]));
        let decoded = match ty {
            InodeType::FileInfo => Inode::File(FileLikeInode::decode_body(id, r)?),
            InodeType::Symlink => Inode::Symlink(FileLikeInode::decode_body(id, r)?),
            InodeType::Device => Inode::Device(FileLikeInode::decode_body(id, r)?),
            InodeType::Directory => Inode::Directory(DirectoryInode::decode(id, r)?),
            InodeType::Hardlink => Inode::Hardlink(HardlinkInode::decode(id, r)?),
            InodeType::SegmentInfo => Inode::SegmentInfo(SegmentInfoBlock::decode(r)?),
            InodeType::FreeList => Inode::FreeList(FreeListBlock::decode(r)?),
            InodeType::FsInfo => Inode::FsInfo(FsInfoBlock::decode(r)?),
            InodeType::FreeBlock
            | InodeType::Temporary
            | InodeType::Invalid
            | InodeType::Data
            | InodeType::Unset => Inode::Invalid,
        };
        // Verification rule: a directory/file-info with a non-zero id whose
        // first filename byte is zero is the signature of a torn write.
        let torn = match &decoded {
            Inode::Directory(d) if d.id != 0 => d.filename.first() == Some(&0) || d.filename.is_empty(),
            Inode::File(f) if f.id != 0 => f.filename.is_empty(),
            _ => false,
        };
        if torn {
            return Ok(Inode::Invalid);
        }
        Ok(decoded)
    }

    /// Encodes this inode to exactly [`BLOCK_SIZE`] bytes (header plus
    /// zero padding).
    pub fn encode_block(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);
        match self {
            Inode::File(f) => f.encode_body(InodeType::FileInfo, &mut buf)?,
            Inode::Symlink(f) => f.encode_body(InodeType::Symlink, &mut buf)?,
            Inode::Device(f) => f.encode_body(InodeType::Device, &mut buf)?,
            Inode::Directory(d) => d.encode(&mut buf)?,
            Inode::Hardlink(h) => h.encode(&mut buf)?,
            Inode::SegmentInfo(s) => s.encode(&mut buf)?,
            Inode::FreeList(f) => f.encode(&mut buf)?,
            Inode::FsInfo(f) => f.encode(&mut buf)?,
            Inode::Invalid => {
                buf.write_u16_le(0)?;
                buf.write_u16_le(InodeType::Invalid as u16)?;
            }
        }
        if buf.len() > BLOCK_SIZE as usize {
            return Err(Error::InternalInconsistency("encoded inode exceeds block size"));
        }
        buf.resize(BLOCK_SIZE as usize, 0);
        Ok(buf)
    }

    pub fn id(&self) -> Option<u16> {
        match self {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => Some(f.id),
            Inode::Directory(d) => Some(d.id),
            Inode::Hardlink(h) => Some(h.id),
            _ => None,
        }
    }

    pub fn filename(&self) -> Option<&[u8]> {
        match self {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => Some(&f.filename),
            Inode::Directory(d) => Some(&d.filename),
            Inode::Hardlink(h) => Some(&h.filename),
            _ => None,
        }
    }

    pub fn set_filename(&mut self, name: &[u8]) {
        match self {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => f.filename = name.to_vec(),
            Inode::Directory(d) => d.filename = name.to_vec(),
            Inode::Hardlink(h) => h.filename = name.to_vec(),
            _ => {}
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Inode::Directory(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn file_round_trip() {
        let mut f = FileLikeInode::new(7, b"hello.txt", 1000, 1000, 0o644, 1700000000);
        f.data_length = 13;
        f.blocks_allocated = 1;
        f.segment_ptrs[0] = DATA_OFFSET as u32;
        let inode = Inode::File(f);
        let bytes = inode.encode_block().unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE as usize);
        let decoded = Inode::decode(&mut Cursor::new(bytes)).unwrap();
        match decoded {
            Inode::File(d) => {
                assert_eq!(d.id, 7);
                assert_eq!(d.filename, b"hello.txt");
                assert_eq!(d.data_length, 13);
                assert_eq!(d.segment_ptrs[0], DATA_OFFSET as u32);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn directory_round_trip() {
        let mut d = DirectoryInode::new(0, b"/", 0, 1000, 0o777, 0, 1700000000);
        d.children[0] = 5;
        d.children_count = 1;
        let inode = Inode::Directory(d);
        let bytes = inode.encode_block().unwrap();
        let decoded = Inode::decode(&mut Cursor::new(bytes)).unwrap();
        match decoded {
            Inode::Directory(d) => {
                assert_eq!(d.children_count, 1);
                assert_eq!(d.children[0], 5);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn hardlink_round_trip() {
        let h = HardlinkInode {
            id: 9,
            filename: b"g".to_vec(),
            real_id: 3,
        };
        let inode = Inode::Hardlink(h);
        let bytes = inode.encode_block().unwrap();
        let decoded = Inode::decode(&mut Cursor::new(bytes)).unwrap();
        match decoded {
            Inode::Hardlink(h) => {
                assert_eq!(h.real_id, 3);
                assert_eq!(h.filename, b"g");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn fs_info_round_trip() {
        let info = FsInfoBlock {
            version_major: 1,
            version_minor: 0,
            version_patch: 0,
            app_name: b"demo".to_vec(),
            app_version: b"1.0".to_vec(),
            app_description: b"a demo package".to_vec(),
            app_author: b"nobody".to_vec(),
            pos_root: DATA_OFFSET as u32,
            pos_freelist: 0,
        };
        let inode = Inode::FsInfo(info);
        let bytes = inode.encode_block().unwrap();
        let decoded = Inode::decode(&mut Cursor::new(bytes)).unwrap();
        match decoded {
            Inode::FsInfo(i) => {
                assert_eq!(i.app_name, b"demo");
                assert_eq!(i.pos_root, DATA_OFFSET as u32);
            }
            _ => panic!("wrong variant"),
        }
    }
}
