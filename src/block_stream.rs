//! A thread-safe seekable byte stream backing the package file.
//!
//! A single mutex serialises every operation so concurrent callers observe
//! atomic cursor motions (see the concurrency model in the design notes);
//! composite sequences of several calls are *not* made atomic by this.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// Sticky stream state flags, mirroring `std::ios`'s `good`/`bad`/`fail`/`eof`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamState {
    pub open: bool,
    pub bad: bool,
    pub fail: bool,
    pub eof: bool,
}

impl StreamState {
    pub fn good(&self) -> bool {
        self.open && !self.bad && !self.fail
    }
}

struct Inner {
    file: Option<File>,
    read_pos: u64,
    write_pos: u64,
    state: StreamState,
}

/// Wraps the package file and exposes independent read/write cursors behind
/// a single lock.
pub struct BlockStream {
    inner: Mutex<Inner>,
}

impl BlockStream {
    /// Opens `path` for reading and writing, creating it if `create` is set.
    pub fn open(path: &Path, create: bool) -> Self {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if create {
            opts.create(true);
        }
        match opts.open(path) {
            Ok(file) => Self {
                inner: Mutex::new(Inner {
                    file: Some(file),
                    read_pos: 0,
                    write_pos: 0,
                    state: StreamState {
                        open: true,
                        bad: false,
                        fail: false,
                        eof: false,
                    },
                }),
            },
            // A failed open sets bad + fail permanently; subsequent reads and
            // writes on this stream are no-ops that return zero.
            Err(_) => Self {
                inner: Mutex::new(Inner {
                    file: None,
                    read_pos: 0,
                    write_pos: 0,
                    state: StreamState {
                        open: false,
                        bad: true,
                        fail: true,
                        eof: false,
                    },
                }),
            },
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    pub fn good(&self) -> bool {
        self.state().good()
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;
        inner.state.open = false;
    }

    /// Clears sticky error/eof state, as an explicit `clear()` call would.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.file.is_some() {
            inner.state.bad = false;
            inner.state.fail = false;
            inner.state.eof = false;
        }
    }

    pub fn seekg(&self, pos: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_pos = pos;
    }

    pub fn seekp(&self, pos: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_pos = pos;
    }

    pub fn tellg(&self) -> u64 {
        self.inner.lock().unwrap().read_pos
    }

    pub fn tellp(&self) -> u64 {
        self.inner.lock().unwrap().write_pos
    }

    /// Reads up to `buf.len()` bytes at the current read cursor, returning
    /// the count actually produced. Never reads past the end of the file.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.good() {
            return 0;
        }
        let read_pos = inner.read_pos;
        let file = match inner.file.as_mut() {
            Some(f) => f,
            None => return 0,
        };
        let n = (|| -> std::io::Result<usize> {
            file.seek(SeekFrom::Start(read_pos))?;
            file.read(buf)
        })();
        match n {
            Ok(n) => {
                inner.read_pos += n as u64;
                if n < buf.len() {
                    inner.state.eof = true;
                }
                n
            }
            Err(_) => {
                inner.state.bad = true;
                inner.state.fail = true;
                0
            }
        }
    }

    /// Writes all of `buf` at the current write cursor.
    pub fn write(&self, buf: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.good() {
            return false;
        }
        let write_pos = inner.write_pos;
        let file = match inner.file.as_mut() {
            Some(f) => f,
            None => return false,
        };
        let res = (|| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(write_pos))?;
            file.write_all(buf)
        })();
        match res {
            Ok(()) => {
                inner.write_pos += buf.len() as u64;
                true
            }
            Err(_) => {
                inner.state.bad = true;
                inner.state.fail = true;
                false
            }
        }
    }

    /// Returns the current length of the underlying file.
    pub fn len(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.file.as_ref() {
            Some(f) => f.metadata().map(|m| m.len()).unwrap_or(0),
            None => 0,
        }
    }
}
