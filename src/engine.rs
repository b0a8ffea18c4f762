//! The filesystem engine: inode lookup, directory child arrays, segment
//! chains, file truncation, path resolution, and hardlink resolution.
//!
//! This is the biggest single component. It owns the [`BlockStream`] and
//! the [`FreeList`] and is the only module that touches the lookup table.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::block_stream::BlockStream;
use crate::error::{Error, Result};
use crate::freelist::FreeList;
use crate::inode::{DirectoryInode, FileLikeInode, FsInfoBlock, Inode, SegmentInfoBlock};
use crate::layout::*;
use crate::util::now_secs;

/// App-level metadata stored in a freshly created package.
#[derive(Debug, Clone, Default)]
pub struct PackageMeta {
    pub app_name: Vec<u8>,
    pub app_version: Vec<u8>,
    pub app_description: Vec<u8>,
    pub app_author: Vec<u8>,
}

pub struct Engine {
    stream: BlockStream,
    freelist: FreeList,
    reserved: Mutex<HashSet<u16>>,
    fs_info_pos_freelist: Mutex<u32>,
}

/// The variant a raw file-like inode belongs to, needed to re-wrap a
/// [`FileLikeInode`] body after mutating it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    File,
    Symlink,
    Device,
}

fn split_file_like(inode: Inode) -> Option<(FileKind, FileLikeInode)> {
    match inode {
        Inode::File(f) => Some((FileKind::File, f)),
        Inode::Symlink(f) => Some((FileKind::Symlink, f)),
        Inode::Device(f) => Some((FileKind::Device, f)),
        _ => None,
    }
}

fn rewrap_file_like(kind: FileKind, body: FileLikeInode) -> Inode {
    match kind {
        FileKind::File => Inode::File(body),
        FileKind::Symlink => Inode::Symlink(body),
        FileKind::Device => Inode::Device(body),
    }
}

impl Engine {
    /// Creates a brand new package at `path`, initialising the bootstrap
    /// region, the lookup table, the fs-info block and the root directory.
    pub fn create(path: &Path, meta: PackageMeta) -> Result<Self> {
        let stream = BlockStream::open(path, true);
        if !stream.good() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "failed to create package file",
            )));
        }
        // Bootstrap region: zeroed.
        stream.seekp(BOOTSTRAP_OFFSET);
        stream.write(&vec![0u8; BOOTSTRAP_SIZE as usize]);

        // Lookup table: slot 0 (root) points at data_offset, the rest zero.
        stream.seekp(LOOKUP_TABLE_OFFSET);
        stream.write(&vec![0u8; LOOKUP_TABLE_SIZE as usize]);
        write_u32_at(&stream, LOOKUP_TABLE_OFFSET, DATA_OFFSET as u32);

        // fs-info block.
        let now = now_secs();
        let fs_info = FsInfoBlock {
            version_major: 1,
            version_minor: 0,
            version_patch: 0,
            app_name: meta.app_name,
            app_version: meta.app_version,
            app_description: meta.app_description,
            app_author: meta.app_author,
            pos_root: DATA_OFFSET as u32,
            pos_freelist: 0,
        };
        let fs_info_bytes = Inode::FsInfo(fs_info).encode_block()?;
        stream.seekp(FS_INFO_OFFSET);
        stream.write(&fs_info_bytes);

        // Root directory block at data_offset.
        let root = DirectoryInode::new(ROOT_INODE_ID, b"/", 0, 1000, 0o777, ROOT_INODE_ID, now);
        let root_bytes = Inode::Directory(root).encode_block()?;
        stream.seekp(DATA_OFFSET);
        stream.write(&root_bytes);

        let freelist = FreeList::load(&stream, 0)?;
        Ok(Self {
            stream,
            freelist,
            reserved: Mutex::new(HashSet::new()),
            fs_info_pos_freelist: Mutex::new(0),
        })
    }

    /// Opens an existing package at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let stream = BlockStream::open(path, false);
        if !stream.good() {
            return Err(Error::FileNotFound);
        }
        let fs_info = read_fs_info(&stream)?;
        let freelist = FreeList::load(&stream, fs_info.pos_freelist as u64)?;
        Ok(Self {
            stream,
            freelist,
            reserved: Mutex::new(HashSet::new()),
            fs_info_pos_freelist: Mutex::new(fs_info.pos_freelist),
        })
    }

    pub fn stream(&self) -> &BlockStream {
        &self.stream
    }

    fn fs_info(&self) -> Result<FsInfoBlock> {
        read_fs_info(&self.stream)
    }

    /// Persists `freelist.head()` into the fs-info block if it has drifted,
    /// e.g. because `free_block` just allocated the very first free-list
    /// block.
    fn sync_freelist_head(&self) -> Result<()> {
        let head = self.freelist.head() as u32;
        let mut cached = self.fs_info_pos_freelist.lock().unwrap();
        if *cached != head {
            let field_offset = FS_INFO_OFFSET + 4 + 10 + 2 + 2 + 2
                + APP_NAME_LEN as u64
                + APP_VERSION_LEN as u64
                + APP_DESCRIPTION_LEN as u64
                + APP_AUTHOR_LEN as u64
                + 4; // past pos_root
            write_u32_at(&self.stream, field_offset, head);
            *cached = head;
        }
        Ok(())
    }

    // ---- lookup table -----------------------------------------------

    fn slot_addr(id: u16) -> u64 {
        LOOKUP_TABLE_OFFSET + (id as u64) * LOOKUP_SLOT_SIZE
    }

    pub fn position_of(&self, id: u16) -> Result<u64> {
        Ok(read_u32_at(&self.stream, Self::slot_addr(id))? as u64)
    }

    pub fn set_inode_position_by_id(&self, id: u16, pos: u64) -> Result<()> {
        write_u32_at(&self.stream, Self::slot_addr(id), pos as u32);
        Ok(())
    }

    pub fn first_free_inode_number(&self) -> Result<u16> {
        let reserved = self.reserved.lock().unwrap();
        for id in 0..(LOOKUP_TABLE_SLOTS as u32) {
            let id = id as u16;
            if reserved.contains(&id) {
                continue;
            }
            if read_u32_at(&self.stream, Self::slot_addr(id))? == 0 {
                return Ok(id);
            }
        }
        Ok(0)
    }

    pub fn reserve_inode_id(&self, id: u16) {
        self.reserved.lock().unwrap().insert(id);
    }

    pub fn unreserve_inode_id(&self, id: u16) {
        self.reserved.lock().unwrap().remove(&id);
    }

    // ---- inode access -------------------------------------------------

    pub fn get_inode_by_position(&self, pos: u64) -> Result<Inode> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        self.stream.seekg(pos);
        self.stream.read(&mut buf);
        Inode::decode(&mut std::io::Cursor::new(buf))
    }

    /// Returns the inode at `id` without resolving hardlinks.
    pub fn get_inode_by_id_real(&self, id: u16) -> Result<Inode> {
        let pos = self.position_of(id)?;
        if pos == 0 {
            return Err(Error::FileNotFound);
        }
        self.get_inode_by_position(pos)
    }

    /// Returns the inode at `id`, transparently resolving a hardlink to its
    /// target with the hardlink's own filename substituted.
    pub fn get_inode_by_id(&self, id: u16) -> Result<Inode> {
        let inode = self.get_inode_by_id_real(id)?;
        if let Inode::Hardlink(h) = &inode {
            let mut target = self.get_inode_by_id_real(h.real_id)?;
            target.set_filename(&h.filename);
            Ok(target)
        } else {
            Ok(inode)
        }
    }

    fn get_file_like_real(&self, id: u16) -> Result<Inode> {
        let inode = self.get_inode_by_id_real(id)?;
        match &inode {
            Inode::File(_) | Inode::Symlink(_) | Inode::Device(_) => Ok(inode),
            _ => Err(Error::NotSupported),
        }
    }

    /// Validates alignment and id-not-yet-assigned, writes the header,
    /// zero-pads to [`BLOCK_SIZE`], updates the lookup table, and unreserves
    /// the id. Segment-info and free-list blocks carry no id and skip the
    /// assignment check.
    pub fn write_inode(&self, pos: u64, inode: &Inode) -> Result<()> {
        if pos < DATA_OFFSET || pos % BLOCK_SIZE != 0 {
            return Err(Error::InodeSaveInvalid);
        }
        if let Some(id) = inode.id() {
            if self.position_of(id)? != 0 {
                return Err(Error::InodeSaveInvalid);
            }
        }
        let bytes = inode.encode_block()?;
        self.stream.seekp(pos);
        if !self.stream.write(&bytes) {
            return Err(Error::InodeSaveFailed);
        }
        if let Some(id) = inode.id() {
            self.set_inode_position_by_id(id, pos)?;
            self.unreserve_inode_id(id);
        }
        Ok(())
    }

    /// In-place update of an already-assigned inode.
    pub fn update_inode(&self, inode: &Inode) -> Result<()> {
        let id = inode.id().ok_or(Error::NotSupported)?;
        let pos = self.position_of(id)?;
        if pos == 0 {
            return Err(Error::InternalInconsistency("update of unassigned inode"));
        }
        let bytes = inode.encode_block()?;
        self.stream.seekp(pos);
        if !self.stream.write(&bytes) {
            return Err(Error::InodeSaveFailed);
        }
        Ok(())
    }

    // ---- directories ----------------------------------------------------

    fn get_directory(&self, id: u16) -> Result<DirectoryInode> {
        match self.get_inode_by_id_real(id)? {
            Inode::Directory(d) => Ok(d),
            _ => Err(Error::NotADirectory),
        }
    }

    pub fn add_child_to_directory(&self, parent_id: u16, child_id: u16) -> Result<()> {
        let mut dir = self.get_directory(parent_id)?;
        let slot = dir
            .children
            .iter()
            .position(|&c| c == 0)
            .ok_or(Error::DirectoryChildLimitReached)?;
        dir.children[slot] = child_id;
        dir.children_count += 1;
        let now = now_secs();
        dir.mtime = now;
        dir.ctime = now;
        self.update_inode(&Inode::Directory(dir))
    }

    pub fn remove_child_from_directory(&self, parent_id: u16, child_id: u16) -> Result<()> {
        let mut dir = self.get_directory(parent_id)?;
        let slot = dir
            .children
            .iter()
            .position(|&c| c == child_id)
            .ok_or(Error::FileNotFound)?;
        dir.children[slot] = 0;
        dir.children_count -= 1;
        let now = now_secs();
        dir.mtime = now;
        dir.ctime = now;
        self.update_inode(&Inode::Directory(dir))
    }

    /// Raw (unresolved) child ids in child-array order, stopping once
    /// `children_count` entries have been observed.
    fn children_raw(&self, parent_id: u16) -> Result<Vec<u16>> {
        let dir = self.get_directory(parent_id)?;
        let mut out = Vec::with_capacity(dir.children_count as usize);
        for &cid in &dir.children {
            if cid == 0 {
                continue;
            }
            out.push(cid);
            if out.len() >= dir.children_count as usize {
                break;
            }
        }
        Ok(out)
    }

    pub fn get_children_of_directory(&self, parent_id: u16) -> Result<Vec<(u16, Inode)>> {
        let ids = self.children_raw(parent_id)?;
        ids.into_iter()
            .map(|id| Ok((id, self.get_inode_by_id(id)?)))
            .collect()
    }

    pub fn get_child_of_directory(&self, parent_id: u16, name: &[u8]) -> Result<Option<u16>> {
        for id in self.children_raw(parent_id)? {
            let child = self.get_inode_by_id_real(id)?;
            if child.filename() == Some(name) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub fn filename_is_unique(&self, parent_id: u16, name: &[u8]) -> Result<bool> {
        Ok(self.get_child_of_directory(parent_id, name)?.is_none())
    }

    // ---- path resolution --------------------------------------------------

    pub fn resolve_pathname_to_inode_id(&self, path: &str) -> Result<u16> {
        if path.len() >= BLOCK_SIZE as usize {
            return Err(Error::PathNotValid);
        }
        let mut cur = ROOT_INODE_ID;
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if comp == ".." {
                let dir = self.get_directory(cur)?;
                cur = dir.parent;
                continue;
            }
            if comp.len() >= FILENAME_LEN {
                return Err(Error::FilenameTooLong);
            }
            match self.get_child_of_directory(cur, comp.as_bytes())? {
                Some(id) => cur = id,
                None => return Err(Error::FileNotFound),
            }
        }
        Ok(cur)
    }

    // ---- segment chains --------------------------------------------------

    fn load_chain(&self, node: &FileLikeInode) -> Result<Vec<(u64, SegmentInfoBlock)>> {
        let mut chain = Vec::new();
        let mut pos = node.next_segment_info as u64;
        while pos != 0 {
            let blk = match self.get_inode_by_position(pos)? {
                Inode::SegmentInfo(s) => s,
                _ => return Err(Error::InternalInconsistency("expected segment-info block")),
            };
            let next = blk.next as u64;
            chain.push((pos, blk));
            pos = next;
        }
        Ok(chain)
    }

    fn write_segment_info_block(&self, pos: u64, blk: &SegmentInfoBlock) -> Result<()> {
        let bytes = Inode::SegmentInfo(blk.clone()).encode_block()?;
        self.stream.seekp(pos);
        if !self.stream.write(&bytes) {
            return Err(Error::InodeSaveFailed);
        }
        Ok(())
    }

    fn get_ptr(node: &FileLikeInode, chain: &[(u64, SegmentInfoBlock)], idx: usize) -> u32 {
        if idx < FILE_INFO_SEGMENT_PTRS {
            node.segment_ptrs[idx]
        } else {
            let rem = idx - FILE_INFO_SEGMENT_PTRS;
            chain[rem / SEGMENT_INFO_PTRS].1.pointers[rem % SEGMENT_INFO_PTRS]
        }
    }

    fn set_ptr(node: &mut FileLikeInode, chain: &mut [(u64, SegmentInfoBlock)], idx: usize, val: u32) {
        if idx < FILE_INFO_SEGMENT_PTRS {
            node.segment_ptrs[idx] = val;
        } else {
            let rem = idx - FILE_INFO_SEGMENT_PTRS;
            chain[rem / SEGMENT_INFO_PTRS].1.pointers[rem % SEGMENT_INFO_PTRS] = val;
        }
    }

    /// Returns the absolute stream offset backing logical byte `byte_offset`
    /// of file `id`'s contents.
    pub fn resolve_position_in_file(&self, id: u16, byte_offset: u64) -> Result<u64> {
        let inode = self.get_file_like_real(id)?;
        let (_, node) = split_file_like(inode).unwrap();
        let chain = self.load_chain(&node)?;
        let idx = (byte_offset / BLOCK_SIZE) as usize;
        let total = FILE_INFO_SEGMENT_PTRS + chain.len() * SEGMENT_INFO_PTRS;
        if idx >= total {
            return Err(Error::InternalInconsistency("segment pointer out of range"));
        }
        let ptr = Self::get_ptr(&node, &chain, idx);
        if ptr == 0 {
            return Err(Error::InternalInconsistency("unallocated segment pointer"));
        }
        Ok(ptr)
    }

    /// Grows or shrinks the segment-info chain so it can index exactly the
    /// pointers needed for a file of length `new_length`, beyond the
    /// pointers embedded in the file-info block itself.
    fn allocate_info_list_blocks(&self, id: u16, new_length: u64) -> Result<()> {
        let total_blocks_needed = blocks_for_len(new_length);
        let needed_slots = total_blocks_needed.saturating_sub(FILE_INFO_SEGMENT_PTRS as u64);
        let needed_info_blocks = crate::util::ceil_division(needed_slots, SEGMENT_INFO_PTRS as u64);

        let inode = self.get_file_like_real(id)?;
        let (kind, mut node) = split_file_like(inode).unwrap();
        let mut chain = self.load_chain(&node)?;
        let current_info_blocks = chain.len() as u64;

        if needed_info_blocks == current_info_blocks {
            return Ok(());
        }

        if needed_info_blocks > current_info_blocks {
            let to_add = needed_info_blocks - current_info_blocks;
            for _ in 0..to_add {
                let pos = self.freelist.allocate_block(&self.stream)?;
                let blk = SegmentInfoBlock::empty();
                self.write_segment_info_block(pos, &blk)?;
                if let Some((tail_pos, tail_blk)) = chain.last_mut() {
                    tail_blk.next = pos as u32;
                    self.write_segment_info_block(*tail_pos, tail_blk)?;
                } else {
                    node.next_segment_info = pos as u32;
                }
                chain.push((pos, blk));
            }
        } else {
            let to_remove = current_info_blocks - needed_info_blocks;
            for _ in 0..to_remove {
                if let Some((pos, blk)) = chain.pop() {
                    for &p in &blk.pointers {
                        if p != 0 {
                            self.freelist.free_block(&self.stream, p as u64, true)?;
                            self.sync_freelist_head()?;
                        }
                    }
                    self.freelist.free_block(&self.stream, pos, true)?;
                    self.sync_freelist_head()?;
                }
            }
            if let Some((tail_pos, tail_blk)) = chain.last_mut() {
                tail_blk.next = 0;
                self.write_segment_info_block(*tail_pos, tail_blk)?;
            } else {
                node.next_segment_info = 0;
            }
        }

        let pos = self.position_of(id)?;
        self.write_block_raw(pos, &rewrap_file_like(kind, node))?;
        Ok(())
    }

    fn write_block_raw(&self, pos: u64, inode: &Inode) -> Result<()> {
        let bytes = inode.encode_block()?;
        self.stream.seekp(pos);
        if !self.stream.write(&bytes) {
            return Err(Error::InodeSaveFailed);
        }
        Ok(())
    }

    /// Truncates file/symlink/device `id` to `new_length` bytes, allocating
    /// or releasing data blocks and segment-info blocks as needed.
    pub fn truncate_file(&self, id: u16, new_length: u64) -> Result<()> {
        if new_length > MAX_FILE_LEN {
            return Err(Error::FileTooBig {
                requested: new_length,
                max: MAX_FILE_LEN,
            });
        }
        let inode = self.get_file_like_real(id)?;
        let (kind, mut node) = split_file_like(inode).unwrap();
        let cur_len = node.data_length as u64;
        if new_length == cur_len {
            return Ok(());
        }
        let cur_blocks = node.blocks_allocated as u64;
        let pos = self.position_of(id)?;

        if new_length < cur_len {
            let target_blocks = blocks_for_len(new_length);
            let mut chain = self.load_chain(&node)?;
            for idx in target_blocks..cur_blocks {
                let idx = idx as usize;
                let ptr = Self::get_ptr(&node, &chain, idx);
                if ptr != 0 {
                    self.freelist.free_block(&self.stream, ptr as u64, true)?;
                    self.sync_freelist_head()?;
                }
                Self::set_ptr(&mut node, &mut chain, idx, 0);
            }
            node.data_length = new_length as u32;
            node.blocks_allocated = target_blocks as u16;
            self.write_block_raw(pos, &rewrap_file_like(kind, node))?;
            for (p, blk) in &chain {
                self.write_segment_info_block(*p, blk)?;
            }
            self.allocate_info_list_blocks(id, new_length)?;
        } else {
            self.allocate_info_list_blocks(id, new_length)?;
            // Reload: the chain may have grown, and `node` is stale.
            let inode = self.get_file_like_real(id)?;
            let (kind, mut node) = split_file_like(inode).unwrap();
            let mut chain = self.load_chain(&node)?;
            let target_blocks = blocks_for_len(new_length);
            let blocks_to_add = target_blocks - cur_blocks;
            let total = FILE_INFO_SEGMENT_PTRS + chain.len() * SEGMENT_INFO_PTRS;
            let mut added = 0u64;
            for idx in 0..total {
                if added >= blocks_to_add {
                    break;
                }
                if Self::get_ptr(&node, &chain, idx) == 0 {
                    let new_block = self.freelist.allocate_block(&self.stream)?;
                    Self::set_ptr(&mut node, &mut chain, idx, new_block as u32);
                    added += 1;
                }
            }
            node.data_length = new_length as u32;
            node.blocks_allocated = target_blocks as u16;
            self.write_block_raw(pos, &rewrap_file_like(kind, node))?;
            for (p, blk) in &chain {
                self.write_segment_info_block(*p, blk)?;
            }
        }
        Ok(())
    }

    /// Frees `pos` via the free list. Rejects already-free or misaligned
    /// positions.
    pub fn reset_block(&self, pos: u64) -> Result<()> {
        if pos < DATA_OFFSET || pos % BLOCK_SIZE != 0 {
            return Err(Error::InternalInconsistency("misaligned block position"));
        }
        if self.freelist.is_block_free(pos) {
            return Err(Error::InternalInconsistency("block is already free"));
        }
        self.freelist.free_block(&self.stream, pos, true)?;
        self.sync_freelist_head()?;
        Ok(())
    }

    pub fn allocate_block(&self) -> Result<u64> {
        self.freelist.allocate_block(&self.stream)
    }

    pub fn is_block_free(&self, pos: u64) -> bool {
        self.freelist.is_block_free(pos)
    }

    pub fn free_block_count(&self) -> usize {
        self.freelist.free_count()
    }

    pub fn root_id(&self) -> u16 {
        ROOT_INODE_ID
    }

    /// Returns the application name recorded in the filesystem-info block.
    pub fn app_name(&self) -> Result<Vec<u8>> {
        Ok(self.fs_info()?.app_name)
    }
}

fn read_fs_info(stream: &BlockStream) -> Result<FsInfoBlock> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    stream.seekg(FS_INFO_OFFSET);
    stream.read(&mut buf);
    match Inode::decode(&mut std::io::Cursor::new(buf))? {
        Inode::FsInfo(f) => Ok(f),
        _ => Err(Error::InternalInconsistency("bad filesystem-info block")),
    }
}

fn read_u32_at(stream: &BlockStream, pos: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.seekg(pos);
    stream.read(&mut buf);
    Ok(u32::from_le_bytes(buf))
}

fn write_u32_at(stream: &BlockStream, pos: u64, v: u32) {
    stream.seekp(pos);
    stream.write(&v.to_le_bytes());
}
