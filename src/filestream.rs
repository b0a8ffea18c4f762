//! Buffered, segment-chain-aware reads and writes over a single file's
//! contents, with independent read/write cursors and lazy truncate-on-extend.

use std::sync::Mutex;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::layout::BLOCK_SIZE;

struct State {
    id: u16,
    read_pos: u64,
    write_pos: u64,
    open: bool,
}

/// A handle onto one file's contents inside a package. Multiple streams may
/// be open on the same file id at once; each keeps its own cursors.
pub struct FileStream<'a> {
    engine: &'a Engine,
    state: Mutex<State>,
}

impl<'a> FileStream<'a> {
    pub fn open(engine: &'a Engine, id: u16) -> Result<Self> {
        match engine.get_inode_by_id(id)? {
            crate::inode::Inode::File(_) | crate::inode::Inode::Symlink(_) => {}
            _ => return Err(Error::IsADirectory),
        }
        Ok(Self {
            engine,
            state: Mutex::new(State {
                id,
                read_pos: 0,
                write_pos: 0,
                open: true,
            }),
        })
    }

    pub fn close(&self) {
        self.state.lock().unwrap().open = false;
    }

    pub fn good(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn tellg(&self) -> u64 {
        self.state.lock().unwrap().read_pos
    }

    pub fn tellp(&self) -> u64 {
        self.state.lock().unwrap().write_pos
    }

    pub fn seekg(&self, pos: u64) {
        self.state.lock().unwrap().read_pos = pos;
    }

    pub fn seekp(&self, pos: u64) {
        self.state.lock().unwrap().write_pos = pos;
    }

    pub fn len(&self) -> Result<u64> {
        let id = self.state.lock().unwrap().id;
        match self.engine.get_inode_by_id(id)? {
            crate::inode::Inode::File(f)
            | crate::inode::Inode::Symlink(f)
            | crate::inode::Inode::Device(f) => Ok(f.data_length as u64),
            _ => Err(Error::IsADirectory),
        }
    }

    pub fn truncate(&self, new_length: u64) -> Result<()> {
        let id = self.state.lock().unwrap().id;
        self.engine.truncate_file(id, new_length)
    }

    /// Reads up to `buf.len()` bytes starting at the read cursor, advancing
    /// it. Reads spanning several blocks are satisfied one block at a time
    /// since neighbouring blocks need not be contiguous on disk.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let id = {
            let st = self.state.lock().unwrap();
            st.id
        };
        let file_len = self.len()?;
        let mut pos = self.tellg();
        let mut written = 0usize;
        while written < buf.len() && pos < file_len {
            let block_off = pos % BLOCK_SIZE;
            let block_idx_pos = pos - block_off;
            let chunk = ((BLOCK_SIZE - block_off) as usize)
                .min(buf.len() - written)
                .min((file_len - pos) as usize);
            if chunk == 0 {
                break;
            }
            let block_addr = self.engine.resolve_position_in_file(id, block_idx_pos)?;
            let mut block_buf = vec![0u8; BLOCK_SIZE as usize];
            self.engine.stream().seekg(block_addr);
            self.engine.stream().read(&mut block_buf);
            buf[written..written + chunk]
                .copy_from_slice(&block_buf[block_off as usize..block_off as usize + chunk]);
            written += chunk;
            pos += chunk as u64;
        }
        self.state.lock().unwrap().read_pos = pos;
        Ok(written)
    }

    /// Writes all of `buf` at the write cursor, growing the file (and
    /// allocating new blocks) as needed, and advances the cursor.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let id = {
            let st = self.state.lock().unwrap();
            st.id
        };
        let mut pos = self.tellp();
        let end = pos + buf.len() as u64;
        let cur_len = self.len()?;
        if end > cur_len {
            self.engine.truncate_file(id, end)?;
        }
        let mut written = 0usize;
        while written < buf.len() {
            let block_off = pos % BLOCK_SIZE;
            let block_idx_pos = pos - block_off;
            let chunk = ((BLOCK_SIZE - block_off) as usize).min(buf.len() - written);
            let block_addr = self.engine.resolve_position_in_file(id, block_idx_pos)?;
            if block_off != 0 || chunk < BLOCK_SIZE as usize {
                let mut block_buf = vec![0u8; BLOCK_SIZE as usize];
                self.engine.stream().seekg(block_addr);
                self.engine.stream().read(&mut block_buf);
                block_buf[block_off as usize..block_off as usize + chunk]
                    .copy_from_slice(&buf[written..written + chunk]);
                self.engine.stream().seekp(block_addr);
                self.engine.stream().write(&block_buf);
            } else {
                self.engine.stream().seekp(block_addr);
                self.engine.stream().write(&buf[written..written + chunk]);
            }
            written += chunk;
            pos += chunk as u64;
        }
        self.state.lock().unwrap().write_pos = pos;
        Ok(written)
    }
}
