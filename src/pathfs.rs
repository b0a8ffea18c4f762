//! Path-level filesystem operations: the surface `appfs-mount` and
//! `appfsd` are built on, translating raw engine calls into the
//! create/lookup/rename/permission vocabulary a POSIX host expects.

use std::path::Path;

use crate::engine::{Engine, PackageMeta};
use crate::error::{Error, Result};
use crate::filestream::FileStream;
use crate::inode::{DirectoryInode, FileLikeInode, HardlinkInode, Inode};
use crate::layout::{BLOCK_SIZE, FILENAME_LEN, MAX_CHILDREN};
use crate::util::{mode_mask, now_secs};

/// Caller identity for permission checks, mirroring `fuser`'s request
/// context.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
}

/// A flattened view of an inode's attributes, independent of its variant.
#[derive(Debug, Clone)]
pub struct Attr {
    pub id: u16,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub nlink: u16,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Flattens a raw decoded inode into an [`Attr`], independent of the FUSE
/// or path-level caller driving the lookup.
pub fn attr_of(id: u16, inode: &Inode) -> Attr {
    match inode {
        Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => Attr {
            id,
            is_dir: false,
            is_symlink: matches!(inode, Inode::Symlink(_)),
            mode: f.mode_mask,
            uid: f.uid,
            gid: f.gid,
            size: f.data_length as u64,
            block_size: BLOCK_SIZE,
            block_count: f.blocks_allocated as u64,
            nlink: f.nlink,
            atime: f.atime,
            mtime: f.mtime,
            ctime: f.ctime,
        },
        Inode::Directory(d) => Attr {
            id,
            is_dir: true,
            is_symlink: false,
            // The stored mask has the directory type bit stripped at
            // creation time (see `mode_mask`'s extraction rule); OR it back
            // in for a caller reading a stat-like record.
            mode: d.mode_mask | (libc::S_IFDIR as u16),
            uid: d.uid,
            gid: d.gid,
            size: BLOCK_SIZE,
            block_size: BLOCK_SIZE,
            block_count: 1,
            nlink: 1,
            atime: d.atime,
            mtime: d.mtime,
            ctime: d.ctime,
        },
        _ => Attr {
            id,
            is_dir: false,
            is_symlink: false,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            block_size: BLOCK_SIZE,
            block_count: 0,
            nlink: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        },
    }
}

/// Owns the [`Engine`] and exposes the path-oriented API used by the host
/// bridges.
pub struct PathFs {
    engine: Engine,
}

fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::PathNotValid);
    }
    match trimmed.rfind('/') {
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Ok(("", trimmed)),
    }
}

impl PathFs {
    pub fn create_package(path: &Path, meta: PackageMeta) -> Result<Self> {
        Ok(Self {
            engine: Engine::create(path, meta)?,
        })
    }

    pub fn open_package(path: &Path) -> Result<Self> {
        Ok(Self {
            engine: Engine::open(path)?,
        })
    }

    /// Exposes the underlying block/inode engine for callers, such as the
    /// FUSE bridge, that key off inode ids rather than paths.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Permission check hook. Always permits, matching the original
    /// `checkPermission`; a future caller-supplied policy attaches here.
    pub fn check_permission(&self, _ctx: Context, _path: &str) -> bool {
        true
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() >= FILENAME_LEN {
            return Err(Error::FilenameTooLong);
        }
        if name == "." || name == ".." {
            return Err(Error::FileExists);
        }
        Ok(())
    }

    pub fn get_attributes(&self, path: &str) -> Result<Attr> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        let inode = self.engine.get_inode_by_id(id)?;
        Ok(attr_of(id, &inode))
    }

    pub fn read_link(&self, path: &str) -> Result<Vec<u8>> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        match self.engine.get_inode_by_id(id)? {
            Inode::Symlink(f) => {
                let mut buf = vec![0u8; f.data_length as usize];
                let stream = FileStream::open(&self.engine, id)?;
                stream.read(&mut buf)?;
                Ok(buf)
            }
            _ => Err(Error::NotSupported),
        }
    }

    /// Resolves `path`'s parent and name, validates the name, checks the
    /// parent is a directory with a free slot, and hands the caller-built
    /// inode off to be written and linked in.
    fn perform_create(
        &self,
        path: &str,
        build: impl FnOnce(u16, u16, &str, i64) -> Inode,
    ) -> Result<u16> {
        let (parent_path, name) = split_parent(path)?;
        Self::check_name(name)?;
        let parent_id = self.engine.resolve_pathname_to_inode_id(if parent_path.is_empty() {
            "/"
        } else {
            parent_path
        })?;
        if !self.engine.get_inode_by_id(parent_id)?.is_directory() {
            return Err(Error::NotADirectory);
        }
        if !self.engine.filename_is_unique(parent_id, name.as_bytes())? {
            return Err(Error::FileExists);
        }
        let id = self.engine.first_free_inode_number()?;
        if id == 0 && parent_id != self.engine.root_id() {
            return Err(Error::InodeExhaustion);
        }
        self.engine.reserve_inode_id(id);
        let now = now_secs();
        let inode = build(id, parent_id, name, now);
        let block = self.engine.allocate_block()?;
        if let Err(e) = self.engine.write_inode(block, &inode) {
            self.engine.unreserve_inode_id(id);
            return Err(e);
        }
        if let Err(e) = self.engine.add_child_to_directory(parent_id, id) {
            self.engine.reset_block(block)?;
            self.engine.set_inode_position_by_id(id, 0)?;
            return Err(e);
        }
        Ok(id)
    }

    pub fn make_node(&self, ctx: Context, path: &str, mode: u32, rdev: u32) -> Result<u16> {
        self.perform_create(path, |id, _parent, name, now| {
            let mut f = FileLikeInode::new(id, name.as_bytes(), ctx.uid as u16, ctx.gid as u16, mode_mask(mode), now);
            f.rdev = rdev as u16;
            Inode::Device(f)
        })
    }

    pub fn create_file(&self, ctx: Context, path: &str, mode: u32) -> Result<u16> {
        self.perform_create(path, |id, _parent, name, now| {
            Inode::File(FileLikeInode::new(
                id,
                name.as_bytes(),
                ctx.uid as u16,
                ctx.gid as u16,
                mode_mask(mode),
                now,
            ))
        })
    }

    pub fn make_directory(&self, ctx: Context, path: &str, mode: u32) -> Result<u16> {
        self.perform_create(path, |id, parent_id, name, now| {
            Inode::Directory(DirectoryInode::new(
                id,
                name.as_bytes(),
                ctx.uid as u16,
                ctx.gid as u16,
                mode_mask(mode),
                parent_id,
                now,
            ))
        })
    }

    pub fn symbolic_link(&self, ctx: Context, path: &str, target: &[u8]) -> Result<u16> {
        let id = self.perform_create(path, |id, _parent, name, now| {
            Inode::Symlink(FileLikeInode::new(
                id,
                name.as_bytes(),
                ctx.uid as u16,
                ctx.gid as u16,
                0o777,
                now,
            ))
        })?;
        let stream = FileStream::open(&self.engine, id)?;
        stream.write(target)?;
        Ok(id)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent(path)?;
        let parent_id = self.engine.resolve_pathname_to_inode_id(if parent_path.is_empty() {
            "/"
        } else {
            parent_path
        })?;
        let entry_id = self
            .engine
            .get_child_of_directory(parent_id, name.as_bytes())?
            .ok_or(Error::FileNotFound)?;
        let entry_inode = self.engine.get_inode_by_id_real(entry_id)?;
        let target_id = match &entry_inode {
            Inode::Hardlink(h) => h.real_id,
            Inode::File(_) | Inode::Symlink(_) | Inode::Device(_) => entry_id,
            Inode::Directory(_) => return Err(Error::IsADirectory),
            _ => return Err(Error::NotSupported),
        };

        self.engine.remove_child_from_directory(parent_id, entry_id)?;

        // The directory entry aliased a real inode: free the hardlink's own
        // block and clear its lookup slot before touching the target.
        if matches!(entry_inode, Inode::Hardlink(_)) {
            let pos = self.engine.position_of(entry_id)?;
            if pos != 0 {
                self.engine.reset_block(pos)?;
                self.engine.set_inode_position_by_id(entry_id, 0)?;
            }
        }

        let mut target = self.engine.get_inode_by_id_real(target_id)?;
        let nlink = match &mut target {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => {
                f.nlink = f.nlink.saturating_sub(1);
                f.nlink
            }
            _ => return Err(Error::InternalInconsistency("unlink target is not file-like")),
        };
        if nlink == 0 {
            self.engine.truncate_file(target_id, 0)?;
            let pos = self.engine.position_of(target_id)?;
            if pos != 0 {
                self.engine.reset_block(pos)?;
                self.engine.set_inode_position_by_id(target_id, 0)?;
            }
        } else {
            self.engine.update_inode(&target)?;
        }
        Ok(())
    }

    pub fn remove_directory(&self, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent(path)?;
        let parent_id = self.engine.resolve_pathname_to_inode_id(if parent_path.is_empty() {
            "/"
        } else {
            parent_path
        })?;
        let id = self
            .engine
            .get_child_of_directory(parent_id, name.as_bytes())?
            .ok_or(Error::FileNotFound)?;
        match self.engine.get_inode_by_id(id)? {
            Inode::Directory(d) => {
                if d.children_count != 0 {
                    return Err(Error::DirectoryNotEmpty);
                }
            }
            _ => return Err(Error::NotADirectory),
        }
        self.engine.remove_child_from_directory(parent_id, id)?;
        let pos = self.engine.position_of(id)?;
        if pos != 0 {
            self.engine.reset_block(pos)?;
            self.engine.set_inode_position_by_id(id, 0)?;
        }
        Ok(())
    }

    pub fn rename(&self, ctx: Context, from: &str, to: &str) -> Result<()> {
        let (from_parent_path, from_name) = split_parent(from)?;
        let (to_parent_path, to_name) = split_parent(to)?;
        Self::check_name(to_name)?;
        let from_parent_id = self.engine.resolve_pathname_to_inode_id(if from_parent_path.is_empty() {
            "/"
        } else {
            from_parent_path
        })?;
        let to_parent_id = self.engine.resolve_pathname_to_inode_id(if to_parent_path.is_empty() {
            "/"
        } else {
            to_parent_path
        })?;
        let id = self
            .engine
            .get_child_of_directory(from_parent_id, from_name.as_bytes())?
            .ok_or(Error::FileNotFound)?;
        if let Some(existing) = self.engine.get_child_of_directory(to_parent_id, to_name.as_bytes())? {
            if existing == id {
                return Ok(());
            }
            // Sticky-bit rule: if the destination parent has the sticky bit
            // set, the existing destination entry may only be replaced by
            // its owner or the parent directory's owner.
            let to_parent_inode = self.engine.get_inode_by_id_real(to_parent_id)?;
            if let Inode::Directory(d) = &to_parent_inode {
                if d.mode_mask & (libc::S_ISVTX as u16) != 0 {
                    let existing_inode = self.engine.get_inode_by_id(existing)?;
                    let existing_uid = match &existing_inode {
                        Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => f.uid,
                        Inode::Directory(ed) => ed.uid,
                        _ => return Err(Error::InternalInconsistency("rename target is not a real inode")),
                    };
                    if existing_uid as u32 != ctx.uid && d.uid as u32 != ctx.uid {
                        return Err(Error::AccessDenied);
                    }
                }
            }
            match self.engine.get_inode_by_id(existing)? {
                Inode::Directory(d) if d.children_count == 0 => {
                    self.engine.remove_child_from_directory(to_parent_id, existing)?;
                }
                Inode::Directory(_) => return Err(Error::DirectoryNotEmpty),
                _ => {
                    self.engine.remove_child_from_directory(to_parent_id, existing)?;
                }
            }
        }
        self.engine.remove_child_from_directory(from_parent_id, id)?;
        let mut inode = self.engine.get_inode_by_id_real(id)?;
        inode.set_filename(to_name.as_bytes());
        if let Inode::Directory(ref mut d) = inode {
            d.parent = to_parent_id;
        }
        self.touch_inode_mut(&mut inode, "c");
        self.engine.update_inode(&inode)?;
        self.engine.add_child_to_directory(to_parent_id, id)?;
        Ok(())
    }

    fn touch_inode_mut(&self, inode: &mut Inode, modes: &str) {
        let now = now_secs();
        match inode {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => {
                if modes.contains('a') {
                    f.atime = now;
                }
                if modes.contains('m') {
                    f.mtime = now;
                }
                if modes.contains('c') {
                    f.ctime = now;
                }
            }
            Inode::Directory(d) => {
                if modes.contains('a') {
                    d.atime = now;
                }
                if modes.contains('m') {
                    d.mtime = now;
                }
                if modes.contains('c') {
                    d.ctime = now;
                }
            }
            _ => {}
        }
    }

    pub fn link(&self, existing: &str, new_path: &str) -> Result<u16> {
        let entry_id = self.engine.resolve_pathname_to_inode_id(existing)?;
        // A hardlink may only target a real file or device, never a
        // directory or symlink, and never another hardlink indirectly: the
        // new entry is linked straight to the ultimate real inode.
        let target_id = match self.engine.get_inode_by_id_real(entry_id)? {
            Inode::Hardlink(h) => h.real_id,
            Inode::File(_) | Inode::Device(_) => entry_id,
            Inode::Directory(_) => return Err(Error::IsADirectory),
            _ => return Err(Error::NotSupported),
        };
        let mut target_inode = self.engine.get_inode_by_id_real(target_id)?;
        if !matches!(target_inode, Inode::File(_) | Inode::Device(_)) {
            return Err(Error::NotSupported);
        }

        let (parent_path, name) = split_parent(new_path)?;
        Self::check_name(name)?;
        let parent_id = self.engine.resolve_pathname_to_inode_id(if parent_path.is_empty() {
            "/"
        } else {
            parent_path
        })?;
        if !self.engine.filename_is_unique(parent_id, name.as_bytes())? {
            return Err(Error::FileExists);
        }
        let id = self.engine.first_free_inode_number()?;
        self.engine.reserve_inode_id(id);
        let link = HardlinkInode {
            id,
            filename: name.as_bytes().to_vec(),
            real_id: target_id,
        };
        let block = match self.engine.allocate_block() {
            Ok(b) => b,
            Err(e) => {
                self.engine.unreserve_inode_id(id);
                return Err(e);
            }
        };
        if let Err(e) = self.engine.write_inode(block, &Inode::Hardlink(link)) {
            self.engine.unreserve_inode_id(id);
            return Err(e);
        }
        if let Err(e) = self.engine.add_child_to_directory(parent_id, id) {
            self.engine.reset_block(block)?;
            self.engine.set_inode_position_by_id(id, 0)?;
            return Err(e);
        }
        if let Inode::File(f) | Inode::Device(f) = &mut target_inode {
            f.nlink += 1;
        }
        self.engine.update_inode(&target_inode)?;
        Ok(id)
    }

    pub fn change_mode(&self, path: &str, mode: u32) -> Result<()> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        let mut inode = self.engine.get_inode_by_id_real(id)?;
        let new_mask = mode_mask(mode);
        let now = now_secs();
        match &mut inode {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => {
                f.mode_mask = new_mask;
                f.ctime = now;
                f.atime = now;
            }
            Inode::Directory(d) => {
                d.mode_mask = new_mask;
                d.ctime = now;
                d.atime = now;
            }
            _ => return Err(Error::NotSupported),
        }
        self.engine.update_inode(&inode)
    }

    pub fn change_owner(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        let mut inode = self.engine.get_inode_by_id_real(id)?;
        let now = now_secs();
        match &mut inode {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => {
                if let Some(uid) = uid {
                    f.uid = uid as u16;
                }
                if let Some(gid) = gid {
                    f.gid = gid as u16;
                }
                f.ctime = now;
                f.atime = now;
            }
            Inode::Directory(d) => {
                if let Some(uid) = uid {
                    d.uid = uid as u16;
                }
                if let Some(gid) = gid {
                    d.gid = gid as u16;
                }
                d.ctime = now;
                d.atime = now;
            }
            _ => return Err(Error::NotSupported),
        }
        self.engine.update_inode(&inode)
    }

    pub fn set_times(&self, path: &str, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        let mut inode = self.engine.get_inode_by_id_real(id)?;
        match &mut inode {
            Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => {
                if let Some(a) = atime {
                    f.atime = a;
                }
                if let Some(m) = mtime {
                    f.mtime = m;
                }
            }
            Inode::Directory(d) => {
                if let Some(a) = atime {
                    d.atime = a;
                }
                if let Some(m) = mtime {
                    d.mtime = m;
                }
            }
            _ => return Err(Error::NotSupported),
        }
        self.engine.update_inode(&inode)
    }

    /// Updates the requested subset of `{a,m,c}` timestamps on `path`'s
    /// inode to the current time and saves it, mirroring the original's
    /// `touchINode(inode, modes)`.
    pub fn touch(&self, path: &str, modes: &str) -> Result<()> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        let mut inode = self.engine.get_inode_by_id_real(id)?;
        if !matches!(inode, Inode::File(_) | Inode::Symlink(_) | Inode::Device(_) | Inode::Directory(_)) {
            return Err(Error::NotSupported);
        }
        self.touch_inode_mut(&mut inode, modes);
        self.engine.update_inode(&inode)
    }

    pub fn truncate(&self, path: &str, new_length: u64) -> Result<()> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        self.engine.truncate_file(id, new_length)
    }

    pub fn open(&self, path: &str) -> Result<FileStream<'_>> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        FileStream::open(&self.engine, id)
    }

    pub fn read_directory(&self, path: &str) -> Result<Vec<(Vec<u8>, Attr)>> {
        let id = self.engine.resolve_pathname_to_inode_id(path)?;
        if !self.engine.get_inode_by_id(id)?.is_directory() {
            return Err(Error::NotADirectory);
        }
        self.engine
            .get_children_of_directory(id)?
            .into_iter()
            .map(|(cid, inode)| {
                let name = inode.filename().unwrap_or(b"").to_vec();
                Ok((name, attr_of(cid, &inode)))
            })
            .collect()
    }

    pub fn max_children(&self) -> usize {
        MAX_CHILDREN
    }
}
