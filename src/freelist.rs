//! Cached on-disk index of reusable 4 KiB blocks.
//!
//! The cache maps `free_block_offset -> index_slot_offset` and is built once
//! at mount by walking the free-list chain from `fs_info.pos_freelist`,
//! collecting every non-zero slot.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use crate::block_stream::BlockStream;
use crate::error::{Error, Result};
use crate::inode::{FreeListBlock, Inode};
use crate::layout::*;

fn io_failed(msg: &'static str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
}

struct State {
    /// free block offset -> absolute offset of the 4-byte slot naming it.
    cache: HashMap<u64, u64>,
    /// Head of the free-list chain (0 if none yet).
    head: u64,
}

pub struct FreeList {
    state: Mutex<State>,
}

impl FreeList {
    /// Builds the cache by walking the free-list chain starting at `head`.
    pub fn load(stream: &BlockStream, head: u64) -> Result<Self> {
        let mut cache = HashMap::new();
        let mut pos = head;
        while pos != 0 {
            let block = read_block(stream, pos)?;
            for (i, &off) in block.offsets.iter().enumerate() {
                if off != 0 {
                    let slot_addr = pos + FREELIST_HEADER_LEN + (i as u64) * 4;
                    cache.insert(off as u64, slot_addr);
                }
            }
            pos = block.next as u64;
        }
        Ok(Self {
            state: Mutex::new(State { cache, head }),
        })
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn is_block_free(&self, offset: u64) -> bool {
        self.state.lock().unwrap().cache.contains_key(&offset)
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }

    /// Allocates a 4096-aligned offset: reuses a freed block if the cache is
    /// non-empty, otherwise extends the package file by exactly one block.
    pub fn allocate_block(&self, stream: &BlockStream) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        if let Some((&offset, &slot_addr)) = st.cache.iter().next() {
            let offset = offset;
            let slot_addr = slot_addr;
            stream.seekp(slot_addr);
            if !stream.write(&0u32.to_le_bytes()) {
                return Err(io_failed("failed to clear free-list slot"));
            }
            st.cache.remove(&offset);
            return Ok(offset);
        }
        drop(st);
        let end = round_up_block(stream.len().max(DATA_OFFSET));
        stream.seekp(end);
        if !stream.write(&vec![0u8; BLOCK_SIZE as usize]) {
            return Err(Error::NoFreeSpace);
        }
        Ok(end)
    }

    /// Releases `offset` back to the free list. `offset` may be the very
    /// block being freed if a new free-list block had to be allocated for
    /// it (`self_hint`); that block is consumed for list bookkeeping and is
    /// no longer itself considered free.
    pub fn free_block(&self, stream: &BlockStream, offset: u64, self_hint: bool) -> Result<()> {
        // Find (or create) a free-list block with a free slot.
        let mut st = self.state.lock().unwrap();
        let head = st.head;
        let mut pos = head;
        let mut prev: u64 = 0;
        let mut found: Option<(u64, usize, FreeListBlock)> = None;
        while pos != 0 {
            let block = read_block(stream, pos)?;
            if let Some(slot) = block.offsets.iter().position(|&o| o == 0) {
                found = Some((pos, slot, block));
                break;
            }
            prev = pos;
            pos = block.next as u64;
        }

        // `consumed` is set when `offset` itself had to become the new
        // free-list block; in that case it must not also be registered as a
        // free block.
        let (block_pos, slot_idx, consumed) = match found {
            Some((pos, slot, _)) => (pos, slot, false),
            None => {
                // Need a fresh free-list block. If this is the block being
                // freed, consume it directly rather than allocating another.
                let (new_pos, consumed) = if self_hint {
                    (offset, true)
                } else {
                    drop(st);
                    let p = self.allocate_block(stream)?;
                    st = self.state.lock().unwrap();
                    (p, false)
                };
                let block = FreeListBlock::empty();
                write_block(stream, new_pos, &block)?;
                if head == 0 {
                    st.head = new_pos;
                } else {
                    // `prev` is the tail reached while walking the full chain.
                    let mut tail = read_block(stream, prev)?;
                    tail.next = new_pos as u32;
                    write_block(stream, prev, &tail)?;
                }
                (new_pos, 0, consumed)
            }
        };

        if !consumed {
            let slot_addr = block_pos + FREELIST_HEADER_LEN + (slot_idx as u64) * 4;
            stream.seekp(slot_addr);
            if !stream.write(&(offset as u32).to_le_bytes()) {
                return Err(io_failed("failed to record free-list slot"));
            }
            st.cache.insert(offset, slot_addr);
        }
        Ok(())
    }
}

fn read_block(stream: &BlockStream, pos: u64) -> Result<FreeListBlock> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    stream.seekg(pos);
    stream.read(&mut buf);
    match Inode::decode(&mut Cursor::new(&buf))? {
        Inode::FreeList(f) => Ok(f),
        _ => Ok(FreeListBlock::empty()),
    }
}

fn write_block(stream: &BlockStream, pos: u64, block: &FreeListBlock) -> Result<()> {
    let inode = Inode::FreeList(block.clone());
    let bytes = inode.encode_block()?;
    stream.seekp(pos);
    if !stream.write(&bytes) {
        return Err(io_failed("failed to write free-list block"));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh() -> (tempfile::NamedTempFile, BlockStream, FreeList) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(tmp.path()).ok();
        let stream = BlockStream::open(tmp.path(), true);
        let freelist = FreeList::load(&stream, 0).unwrap();
        (tmp, stream, freelist)
    }

    #[test]
    fn allocate_extends_file_by_one_block_each_time() {
        let (_tmp, stream, freelist) = fresh();
        let a = freelist.allocate_block(&stream).unwrap();
        assert_eq!(stream.len(), a + BLOCK_SIZE);
        let b = freelist.allocate_block(&stream).unwrap();
        assert_eq!(b, a + BLOCK_SIZE);
        assert_eq!(stream.len(), b + BLOCK_SIZE);
    }

    #[test]
    fn self_hint_reuses_freed_block_as_container() {
        let (_tmp, stream, freelist) = fresh();
        let a = freelist.allocate_block(&stream).unwrap();
        let b = freelist.allocate_block(&stream).unwrap();

        // With no free-list block yet, the first free needs a new container;
        // self_hint lets it reuse the block being freed instead of growing
        // the file for one, mirroring the original's `getIndexInList(0, pos)`.
        let len_before = stream.len();
        freelist.free_block(&stream, a, true).unwrap();
        assert_eq!(stream.len(), len_before);
        assert_eq!(freelist.head(), a);
        assert!(!freelist.is_block_free(a));

        // The second free finds a's free slot directly.
        freelist.free_block(&stream, b, true).unwrap();
        assert!(freelist.is_block_free(b));
        assert_eq!(freelist.free_count(), 1);

        // b is the only real free block; a remains the container and is
        // never handed back by allocate_block.
        let got = freelist.allocate_block(&stream).unwrap();
        assert_eq!(got, b);
        assert!(!freelist.is_block_free(b));
    }

    #[test]
    fn is_block_free_matches_cache_membership() {
        let (_tmp, stream, freelist) = fresh();
        let a = freelist.allocate_block(&stream).unwrap();
        assert!(!freelist.is_block_free(a));
        // Declining the self-hint forces a separate free-list container.
        freelist.free_block(&stream, a, false).unwrap();
        assert!(freelist.is_block_free(a));
    }
}
