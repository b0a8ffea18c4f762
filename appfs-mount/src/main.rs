//! FUSE host-filesystem bridge: mounts a package file as a read/write
//! directory tree using `fuser`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyWrite, Request,
};

use appfs::engine::Engine;
use appfs::error::Error;
use appfs::inode::Inode;
use appfs::layout::MAX_FILE_LEN;
use appfs::pathfs::{attr_of, Attr, Context, PathFs};

const TTL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "appfs-mount", about = "Mount an AppFS package as a FUSE filesystem")]
struct Cli {
    /// Path to the package file.
    package: PathBuf,
    /// Directory to mount the package on.
    mountpoint: PathBuf,
}

/// Converts a 16-bit inode id to the 64-bit inode number FUSE expects. Id 0
/// (the package root) maps to FUSE's reserved root inode 1.
fn ino_of(id: u16) -> u64 {
    id as u64 + 1
}

fn id_of(ino: u64) -> u16 {
    (ino - 1) as u16
}

/// FUSE addresses files by inode number alone, but only directory blocks
/// carry their own parent pointer on disk; a file-info/symlink/device block
/// has no such field. This cache remembers the parent id the kernel handed
/// us the last time it told us about a child (`lookup`, `readdir`, `mkdir`,
/// `create`), so non-directory inodes can still be resolved back to a path.
#[derive(Default)]
struct ParentCache {
    parents: Mutex<HashMap<u16, u16>>,
}

impl ParentCache {
    fn remember(&self, id: u16, parent_id: u16) {
        self.parents.lock().unwrap().insert(id, parent_id);
    }

    fn lookup(&self, id: u16) -> Option<u16> {
        self.parents.lock().unwrap().get(&id).copied()
    }

    fn forget(&self, id: u16) {
        self.parents.lock().unwrap().remove(&id);
    }
}

/// Walks the parent chain from `id` back to the root, reconstructing the
/// absolute path the path-oriented layer expects. Directories resolve their
/// own parent via the on-disk `parent` field; any other inode falls back to
/// `cache`, populated by every operation that discovers a child id.
fn path_of(engine: &Engine, cache: &ParentCache, id: u16) -> Result<String, Error> {
    if id == engine.root_id() {
        return Ok("/".to_string());
    }
    let mut components = Vec::new();
    let mut cur = id;
    loop {
        let inode = engine.get_inode_by_id_real(cur)?;
        let name = inode.filename().unwrap_or(b"").to_vec();
        components.push(String::from_utf8_lossy(&name).into_owned());
        let parent = match &inode {
            Inode::Directory(d) => d.parent,
            _ => cache
                .lookup(cur)
                .ok_or(Error::InternalInconsistency("no cached parent for inode"))?,
        };
        if parent == cur || parent == engine.root_id() {
            break;
        }
        cur = parent;
    }
    components.reverse();
    Ok(format!("/{}", components.join("/")))
}

/// Converts the engine's flattened [`Attr`] into the `fuser` wire type.
fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
    let mtime = std::time::UNIX_EPOCH + Duration::from_secs(attr.mtime.max(0) as u64);
    let atime = std::time::UNIX_EPOCH + Duration::from_secs(attr.atime.max(0) as u64);
    let ctime = std::time::UNIX_EPOCH + Duration::from_secs(attr.ctime.max(0) as u64);
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.block_count,
        atime,
        mtime,
        ctime,
        crtime: ctime,
        kind: if attr.is_dir {
            FileType::Directory
        } else if attr.is_symlink {
            FileType::Symlink
        } else {
            FileType::RegularFile
        },
        perm: attr.mode & 0o7777,
        nlink: attr.nlink as u32,
        uid: attr.uid as u32,
        gid: attr.gid as u32,
        rdev: 0,
        blksize: attr.block_size as u32,
        flags: 0,
    }
}

fn attr_for(ino: u64, id: u16, inode: &Inode) -> FileAttr {
    to_file_attr(ino, &attr_of(id, inode))
}

struct AppfsMount {
    fs: PathFs,
    parents: ParentCache,
}

impl AppfsMount {
    fn lookup_by_ino(&self, ino: u64) -> Result<(u16, Inode), Error> {
        let id = id_of(ino);
        let inode = self.fs.engine().get_inode_by_id(id)?;
        Ok((id, inode))
    }

    fn path_of(&self, id: u16) -> Result<String, Error> {
        path_of(self.fs.engine(), &self.parents, id)
    }
}

impl Filesystem for AppfsMount {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_id = id_of(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self
            .fs
            .engine()
            .get_child_of_directory(parent_id, name.as_bytes())
        {
            Ok(Some(id)) => match self.fs.engine().get_inode_by_id(id) {
                Ok(inode) => {
                    self.parents.remember(id, parent_id);
                    reply.entry(&TTL, &attr_for(ino_of(id), id, &inode), 0)
                }
                Err(e) => reply.error(e.errno()),
            },
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.lookup_by_ino(ino) {
            Ok((id, inode)) => reply.attr(&TTL, &attr_for(ino, id, &inode)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let id = id_of(ino);
        match self.path_of(id) {
            Ok(path) => match self.fs.read_link(&path) {
                Ok(target) => reply.data(&target),
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 || offset as u64 > MAX_FILE_LEN || offset as u64 + size as u64 > MAX_FILE_LEN {
            reply.error(libc::EFBIG);
            return;
        }
        let id = id_of(ino);
        let path = match self.path_of(id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if let Err(e) = self.fs.touch(&path, "a") {
            reply.error(e.errno());
            return;
        }
        let stream = match self.fs.open(&path) {
            Ok(s) => s,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        stream.seekg(offset as u64);
        let mut buf = vec![0u8; size as usize];
        match stream.read(&mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 || offset as u64 > MAX_FILE_LEN || offset as u64 + data.len() as u64 > MAX_FILE_LEN {
            reply.error(libc::EFBIG);
            return;
        }
        let id = id_of(ino);
        let path = match self.path_of(id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if let Err(e) = self.fs.touch(&path, "cma") {
            reply.error(e.errno());
            return;
        }
        let stream = match self.fs.open(&path) {
            Ok(s) => s,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        stream.seekp(offset as u64);
        match stream.write(data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let id = id_of(ino);
        let path = match self.path_of(id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let entries = match self.fs.read_directory(&path) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let mut all = vec![
            (ino_of(id), FileType::Directory, ".".to_string()),
            (parent_ino(self.fs.engine(), id), FileType::Directory, "..".to_string()),
        ];
        for (name, attr) in entries {
            self.parents.remember(attr.id, id);
            all.push((
                ino_of(attr.id),
                if attr.is_dir { FileType::Directory } else { FileType::RegularFile },
                String::from_utf8_lossy(&name).into_owned(),
            ));
        }
        for (i, (entry_ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let parent_id = id_of(parent);
        let parent_path = match self.path_of(parent_id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let name = name.to_string_lossy();
        let full = format!("{}/{}", parent_path.trim_end_matches('/'), name);
        let ctx = Context {
            uid: req.uid(),
            gid: req.gid(),
        };
        match self.fs.make_directory(ctx, &full, mode) {
            Ok(id) => match self.fs.engine().get_inode_by_id(id) {
                Ok(inode) => {
                    self.parents.remember(id, parent_id);
                    reply.entry(&TTL, &attr_for(ino_of(id), id, &inode), 0)
                }
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let parent_id = id_of(parent);
        let parent_path = match self.path_of(parent_id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let name = name.to_string_lossy();
        let full = format!("{}/{}", parent_path.trim_end_matches('/'), name);
        let ctx = Context {
            uid: req.uid(),
            gid: req.gid(),
        };
        match self.fs.create_file(ctx, &full, mode) {
            Ok(id) => match self.fs.engine().get_inode_by_id(id) {
                Ok(inode) => {
                    self.parents.remember(id, parent_id);
                    reply.created(&TTL, &attr_for(ino_of(id), id, &inode), 0, 0, 0)
                }
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_id = id_of(parent);
        let parent_path = match self.path_of(parent_id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let name = name.to_string_lossy();
        let full = format!("{}/{}", parent_path.trim_end_matches('/'), name);
        let entry_id = self.fs.engine().get_child_of_directory(parent_id, name.as_bytes()).ok().flatten();
        match self.fs.unlink(&full) {
            Ok(()) => {
                if let Some(id) = entry_id {
                    self.parents.forget(id);
                }
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_id = id_of(parent);
        let parent_path = match self.path_of(parent_id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let name = name.to_string_lossy();
        let full = format!("{}/{}", parent_path.trim_end_matches('/'), name);
        match self.fs.remove_directory(&full) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let id = id_of(ino);
        let path = match self.path_of(id) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if let Some(mode) = mode {
            if let Err(e) = self.fs.change_mode(&path, mode) {
                reply.error(e.errno());
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self.fs.change_owner(&path, uid, gid) {
                reply.error(e.errno());
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&path, size) {
                reply.error(e.errno());
                return;
            }
        }
        match self.lookup_by_ino(ino) {
            Ok((id, inode)) => reply.attr(&TTL, &attr_for(ino, id, &inode)),
            Err(e) => reply.error(e.errno()),
        }
    }
}

fn parent_ino(engine: &Engine, id: u16) -> u64 {
    if id == engine.root_id() {
        return ino_of(id);
    }
    match engine.get_inode_by_id_real(id) {
        Ok(Inode::Directory(d)) => ino_of(d.parent),
        _ => ino_of(engine.root_id()),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let fs = match PathFs::open_package(&cli.package) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("appfs-mount: cannot open package: {e}");
            std::process::exit(1);
        }
    };

    let options = vec![MountOption::FSName("appfs".to_string()), MountOption::DefaultPermissions];
    let filesystem = AppfsMount {
        fs,
        parents: ParentCache::default(),
    };
    if let Err(e) = fuser::mount2(filesystem, &cli.mountpoint, &options) {
        eprintln!("appfs-mount: mount failed: {e}");
        std::process::exit(1);
    }
}
