//! The copy-on-write filesystem served over a sandbox's `/etc`.
//!
//! The mountpoint `/var/sandboxes/<name>/etc` is an empty directory; the
//! real tree lives in the shadow directory `/var/sandboxes/.<name>/etc`,
//! shallow-copied from the parent sandbox.  The server chroots into the
//! shadow at init and passes requests through, with two twists:
//!
//! - permission checks run with the filesystem uid/gid of the caller, so
//!   root inside the sandbox stays root and users stay users;
//! - any mutating operation first [promotes](crate::cow::promote) its target,
//!   so the first write to a shared file allocates this sandbox a private
//!   inode while every sibling keeps the original.
//!
//! `/etc/resolv.conf` is deliberately never promoted: DNS configuration
//! stays host-global, which also means in-sandbox edits of it land on the
//! shared inode.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, warn};

use crate::cow;
use crate::err::Result;
use crate::fs::join;
use crate::sandbox;
use crate::util;

const TTL: Duration = Duration::from_secs(1);

/// `/etc/resolv.conf` as the server sees it, relative to the mountpoint.
const RESOLV_CONF: &str = "/resolv.conf";

/// Derive the shadow tree backing a mountpoint:
/// `/var/sandboxes/<name>/etc` is backed by `/var/sandboxes/.<name>/etc`.
pub fn shadow_of<P: AsRef<Path>>(mountpoint: P) -> Option<PathBuf> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.file_name() != Some(OsStr::new("etc")) {
        return None;
    }
    let root = mountpoint.parent()?;
    if root.parent() != Some(Path::new(sandbox::STORE)) {
        return None;
    }
    let name = root.file_name()?.to_str()?;
    Some(join(sandbox::shadow(name), "etc"))
}

/// Paths by inode number and back.  The server invents inode numbers; the
/// backing inodes change identity under promotion, so they cannot be used.
struct Inodes {
    paths: HashMap<u64, PathBuf>,
    inos: HashMap<PathBuf, u64>,
    next: u64,
}

impl Inodes {
    fn new() -> Inodes {
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(fuser::FUSE_ROOT_ID, PathBuf::from("/"));
        inos.insert(PathBuf::from("/"), fuser::FUSE_ROOT_ID);
        Inodes {
            paths,
            inos,
            next: fuser::FUSE_ROOT_ID + 1,
        }
    }

    fn path(&self, ino: u64) -> Option<&PathBuf> {
        self.paths.get(&ino)
    }

    fn get_or_insert(&mut self, path: PathBuf) -> u64 {
        if let Some(ino) = self.inos.get(&path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.clone());
        self.inos.insert(path, ino);
        ino
    }

    fn remove(&mut self, path: &Path) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    fn rename(&mut self, old: &Path, new: &Path) {
        self.remove(new);
        let moved: Vec<PathBuf> = self
            .inos
            .keys()
            .filter(|p| p.as_path() == old || p.starts_with(old))
            .cloned()
            .collect();
        for from in moved {
            let ino = self.inos.remove(&from).unwrap();
            let to = if from.as_path() == old {
                new.to_path_buf()
            } else {
                join(new, from.strip_prefix(old).unwrap())
            };
            self.paths.insert(ino, to.clone());
            self.inos.insert(to, ino);
        }
    }
}

struct Handle {
    file: File,
    flags: i32,
}

pub struct SandboxFs {
    shadow: PathBuf,
    /// set in tests, which cannot chroot; paths then resolve under `shadow`
    unrooted: bool,
    inodes: Inodes,
    handles: HashMap<u64, Handle>,
    next_fh: u64,
}

fn errno(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn errno_of(err: &crate::Error) -> c_int {
    use std::error::Error;
    err.source()
        .and_then(|s| s.downcast_ref::<io::Error>())
        .and_then(|io| io.raw_os_error())
        .unwrap_or(libc::EIO)
}

fn ts(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs((-sec) as u64)
    }
}

fn kind_of(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else {
        FileType::RegularFile
    }
}

fn fill_attr(s: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: s.size(),
        blocks: s.blocks(),
        atime: ts(s.atime(), s.atime_nsec()),
        mtime: ts(s.mtime(), s.mtime_nsec()),
        ctime: ts(s.ctime(), s.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: kind_of(s.file_type()),
        perm: (s.mode() & 0o7777) as u16,
        nlink: s.nlink() as u32,
        uid: s.uid(),
        gid: s.gid(),
        rdev: s.rdev() as u32,
        blksize: s.blksize() as u32,
        flags: 0,
    }
}

fn to_timespec(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(st)) => {
            let d = st
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            }
        }
    }
}

impl SandboxFs {
    pub fn new(shadow: PathBuf) -> SandboxFs {
        SandboxFs {
            shadow,
            unrooted: false,
            inodes: Inodes::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    #[cfg(test)]
    fn unrooted(shadow: PathBuf) -> SandboxFs {
        SandboxFs {
            shadow,
            unrooted: true,
            inodes: Inodes::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    /// Perform permission checks as the requesting user from here on.
    fn unroot(&self, req: &Request<'_>) {
        util::setfsgid(req.gid());
        util::setfsuid(req.uid());
    }

    /// Where a server-relative path lives on the backing filesystem.
    fn resolve(&self, path: &Path) -> PathBuf {
        if self.unrooted {
            join(&self.shadow, path)
        } else {
            path.to_path_buf()
        }
    }

    fn path_of(&self, ino: u64) -> std::result::Result<PathBuf, c_int> {
        self.inodes.path(ino).cloned().ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, c_int> {
        Ok(join(self.path_of(parent)?, name))
    }

    fn stat(&mut self, path: &Path) -> std::result::Result<FileAttr, c_int> {
        let s = self
            .resolve(path)
            .symlink_metadata()
            .map_err(|e| errno(&e))?;
        let ino = self.inodes.get_or_insert(path.to_path_buf());
        Ok(fill_attr(&s, ino))
    }

    /// Promote `path` before a mutation, reattaching an outstanding handle
    /// to the new inode so the caller's descriptor observes it.
    ///
    /// Runs before `unroot`: the copy itself is the server's business, not
    /// the caller's, and must not fail on a file the caller can only write.
    fn promote(&mut self, path: &Path, fh: Option<u64>) -> std::result::Result<(), c_int> {
        if path != Path::new(RESOLV_CONF) {
            cow::promote(self.resolve(path)).map_err(|e| errno_of(&e))?;
        }
        if let Some(fh) = fh {
            let flags = self.handles.get(&fh).map(|h| h.flags);
            if let Some(flags) = flags {
                if flags != 0 {
                    let file =
                        util::open(self.resolve(path), flags, 0).map_err(|e| errno_of(&e))?;
                    self.handles.get_mut(&fh).unwrap().file = file;
                }
            }
        }
        Ok(())
    }

    fn insert_handle(&mut self, file: File, flags: i32) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, Handle { file, flags });
        fh
    }

    fn handle(&self, fh: u64) -> std::result::Result<&Handle, c_int> {
        self.handles.get(&fh).ok_or(libc::EBADF)
    }
}

impl Filesystem for SandboxFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        debug!("init shadow={}", self.shadow.display());
        if !self.unrooted {
            util::chroot(&self.shadow).map_err(|e| errno_of(&e))?;
            util::chdir("/").map_err(|e| errno_of(&e))?;
        }
        Ok(())
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.stat(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        self.unroot(req);
        match self.path_of(ino).and_then(|p| self.stat(&p)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = self.promote(&path, fh) {
            return reply.error(e);
        }
        self.unroot(req);

        let real = self.resolve(&path);
        let cpath = match util::path2cstr(&real) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        if let Some(mode) = mode {
            if unsafe { libc::chmod(cpath.as_ptr(), mode as libc::mode_t) } != 0 {
                return reply.error(errno(&io::Error::last_os_error()));
            }
        }
        if uid.is_some() || gid.is_some() {
            let uid = uid.unwrap_or(u32::MAX);
            let gid = gid.unwrap_or(u32::MAX);
            if unsafe { libc::lchown(cpath.as_ptr(), uid, gid) } != 0 {
                return reply.error(errno(&io::Error::last_os_error()));
            }
        }
        if let Some(size) = size {
            let done = match fh.and_then(|fh| self.handles.get(&fh)) {
                Some(handle) => unsafe {
                    libc::ftruncate(handle.file.as_raw_fd(), size as libc::off_t)
                },
                None => unsafe { libc::truncate(cpath.as_ptr(), size as libc::off_t) },
            };
            if done != 0 {
                return reply.error(errno(&io::Error::last_os_error()));
            }
        }
        if atime.is_some() || mtime.is_some() {
            let times = [to_timespec(atime), to_timespec(mtime)];
            if unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) } != 0 {
                return reply.error(errno(&io::Error::last_os_error()));
            }
        }

        match self.stat(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.unroot(req);
        let target = self
            .path_of(ino)
            .and_then(|p| std::fs::read_link(self.resolve(&p)).map_err(|e| errno(&e)));
        match target {
            Ok(t) => {
                use std::os::unix::ffi::OsStrExt;
                reply.data(t.as_os_str().as_bytes())
            }
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Err(err) = util::mknod(self.resolve(&path), mode & !umask, rdev as u64) {
            return reply.error(errno_of(&err));
        }
        match self.stat(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Err(err) = util::mkdir(self.resolve(&path), mode & !umask) {
            return reply.error(errno_of(&err));
        }
        match self.stat(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match std::fs::remove_file(self.resolve(&path)) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match std::fs::remove_dir(self.resolve(&path)) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = std::os::unix::fs::symlink(target, self.resolve(&path)) {
            return reply.error(errno(&e));
        }
        match self.stat(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old, new) = match (self.child_of(parent, name), self.child_of(newparent, newname)) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        if let Err(e) = self.promote(&old, None) {
            return reply.error(e);
        }
        self.unroot(req);
        match std::fs::rename(self.resolve(&old), self.resolve(&new)) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        self.unroot(req);
        let (old, new) = match (self.path_of(ino), self.child_of(newparent, newname)) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        if let Err(e) = std::fs::hard_link(self.resolve(&old), self.resolve(&new)) {
            return reply.error(errno(&e));
        }
        match self.stat(&new) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.unroot(req);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match util::open(self.resolve(&path), flags, 0) {
            Ok(file) => {
                let fh = self.insert_handle(file, flags);
                reply.opened(fh, 0)
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let handle = match self.handle(fh) {
            Ok(h) => h,
            Err(e) => return reply.error(e),
        };
        let mut buf = vec![0u8; size as usize];
        match handle.file.read_at(&mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = self.promote(&path, Some(fh)) {
            return reply.error(e);
        }
        let handle = match self.handle(fh) {
            Ok(h) => h,
            Err(e) => return reply.error(e),
        };
        match handle.file.write_at(data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok()
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let handle = match self.handle(fh) {
            Ok(h) => h,
            Err(e) => return reply.error(e),
        };
        let done = if datasync {
            handle.file.sync_data()
        } else {
            handle.file.sync_all()
        };
        match done {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.unroot(req);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.get_or_insert(parent.to_path_buf()),
            None => ino,
        };

        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];
        let dir = match std::fs::read_dir(self.resolve(&path)) {
            Ok(d) => d,
            Err(e) => return reply.error(errno(&e)),
        };
        for entry in dir {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => return reply.error(errno(&e)),
            };
            let kind = match entry.file_type() {
                Ok(t) => kind_of(t),
                Err(_) => continue,
            };
            let child = join(&path, entry.file_name());
            let child_ino = self.inodes.get_or_insert(child);
            entries.push((child_ino, kind, entry.file_name()));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok()
    }

    fn statfs(&mut self, req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.unroot(req);
        let root = self.resolve(Path::new("/"));
        let cpath = match util::path2cstr(&root) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cpath.as_ptr(), &mut s) } != 0 {
            return reply.error(errno(&io::Error::last_os_error()));
        }
        reply.statfs(
            s.f_blocks,
            s.f_bfree,
            s.f_bavail,
            s.f_files,
            s.f_ffree,
            s.f_bsize as u32,
            s.f_namemax as u32,
            s.f_frsize as u32,
        );
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.unroot(req);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match util::access(self.resolve(&path), mask) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        self.unroot(req);
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let file = match util::open(self.resolve(&path), flags | libc::O_CREAT, mode & !umask) {
            Ok(f) => f,
            Err(err) => return reply.error(errno_of(&err)),
        };
        let attr = match self.stat(&path) {
            Ok(a) => a,
            Err(e) => return reply.error(e),
        };
        let fh = self.insert_handle(file, flags);
        reply.created(&TTL, &attr, 0, fh, 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let handle = match self.handle(fh) {
            Ok(h) => h,
            Err(e) => return reply.error(e),
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = typ as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = end.saturating_sub(start) as libc::off_t;
        fl.l_pid = pid as libc::pid_t;
        if unsafe { libc::fcntl(handle.file.as_raw_fd(), libc::F_GETLK, &mut fl) } != 0 {
            return reply.error(errno(&io::Error::last_os_error()));
        }
        reply.locked(
            fl.l_start as u64,
            (fl.l_start + fl.l_len) as u64,
            fl.l_type as i32,
            fl.l_pid as u32,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let handle = match self.handle(fh) {
            Ok(h) => h,
            Err(e) => return reply.error(e),
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = typ as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = end.saturating_sub(start) as libc::off_t;
        fl.l_pid = pid as libc::pid_t;
        let cmd = if sleep { libc::F_SETLKW } else { libc::F_SETLK };
        if unsafe { libc::fcntl(handle.file.as_raw_fd(), cmd, &fl) } != 0 {
            return reply.error(errno(&io::Error::last_os_error()));
        }
        reply.ok()
    }
}

/// Serve the filesystem on `mountpoint`.  Blocks until unmounted.
pub fn serve<P: AsRef<Path>>(mountpoint: P, allow_other: bool) -> Result<()> {
    use fuser::MountOption;

    let mountpoint = mountpoint.as_ref();
    let shadow = shadow_of(mountpoint).ok_or_else(|| {
        crate::Error::file(
            "not a sandbox /etc",
            mountpoint,
            io::Error::from_raw_os_error(libc::EINVAL),
        )
    })?;

    let mut options = vec![MountOption::FSName("sandboxfs".to_string())];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    debug!(
        "serving {} from {}",
        mountpoint.display(),
        shadow.display()
    );
    fuser::mount2(SandboxFs::new(shadow), mountpoint, &options).map_err(|e| {
        warn!("fuse session ended: {}", e);
        crate::Error::file("mount", mountpoint, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;

    #[test]
    fn test_shadow_of() {
        assert_eq!(
            shadow_of("/var/sandboxes/lucid/etc"),
            Some(PathBuf::from("/var/sandboxes/.lucid/etc"))
        );
        assert_eq!(shadow_of("/var/sandboxes/lucid"), None);
        assert_eq!(shadow_of("/home/x/etc"), None);
        assert_eq!(shadow_of("/etc"), None);
    }

    #[test]
    fn test_inode_table() {
        let mut t = Inodes::new();
        assert_eq!(t.path(fuser::FUSE_ROOT_ID), Some(&PathBuf::from("/")));

        let a = t.get_or_insert(PathBuf::from("/hosts"));
        assert_eq!(t.get_or_insert(PathBuf::from("/hosts")), a);
        let b = t.get_or_insert(PathBuf::from("/init.d"));
        assert_ne!(a, b);

        t.remove(Path::new("/hosts"));
        assert_ne!(t.get_or_insert(PathBuf::from("/hosts")), a);
    }

    #[test]
    fn test_inode_rename_moves_descendants() {
        let mut t = Inodes::new();
        let dir = t.get_or_insert(PathBuf::from("/init.d"));
        let child = t.get_or_insert(PathBuf::from("/init.d/ssh"));

        t.rename(Path::new("/init.d"), Path::new("/rc.d"));

        assert_eq!(t.path(dir), Some(&PathBuf::from("/rc.d")));
        assert_eq!(t.path(child), Some(&PathBuf::from("/rc.d/ssh")));
        assert_eq!(t.get_or_insert(PathBuf::from("/rc.d/ssh")), child);
    }

    #[test]
    fn test_stat_kinds() {
        let tdir = TempDir::new().unwrap();
        std::fs::write(tdir.path().join("f"), b"12345").unwrap();
        std::fs::create_dir(tdir.path().join("d")).unwrap();

        let mut fs = SandboxFs::unrooted(tdir.path().to_path_buf());
        let f = fs.stat(Path::new("/f")).unwrap();
        assert_eq!(f.kind, FileType::RegularFile);
        assert_eq!(f.size, 5);
        let d = fs.stat(Path::new("/d")).unwrap();
        assert_eq!(d.kind, FileType::Directory);
        assert!(fs.stat(Path::new("/missing")).is_err());
    }

    #[test]
    fn test_promote_spares_resolv_conf() {
        let tdir = TempDir::new().unwrap();
        let resolv = tdir.path().join("resolv.conf");
        let twin = tdir.path().join("twin");
        std::fs::write(&resolv, b"nameserver 127.0.0.1\n").unwrap();
        std::fs::hard_link(&resolv, &twin).unwrap();
        let before = resolv.symlink_metadata().unwrap();

        let mut fs = SandboxFs::unrooted(tdir.path().to_path_buf());
        fs.promote(Path::new("/resolv.conf"), None).unwrap();

        // still the shared inode
        assert_eq!(resolv.symlink_metadata().unwrap().ino(), before.ino());
        assert_eq!(before.nlink(), 2);
    }

    #[test]
    fn test_promote_breaks_sharing_for_others() {
        let tdir = TempDir::new().unwrap();
        let hosts = tdir.path().join("hosts");
        let twin = tdir.path().join("twin");
        std::fs::write(&hosts, b"127.0.0.1 localhost\n").unwrap();
        std::fs::hard_link(&hosts, &twin).unwrap();
        let before = hosts.symlink_metadata().unwrap();

        let mut fs = SandboxFs::unrooted(tdir.path().to_path_buf());
        fs.promote(Path::new("/hosts"), None).unwrap();

        assert_ne!(hosts.symlink_metadata().unwrap().ino(), before.ino());
        assert_eq!(twin.symlink_metadata().unwrap().ino(), before.ino());
    }

    #[test]
    fn test_ts_round_trip() {
        assert_eq!(ts(0, 0), UNIX_EPOCH);
        assert_eq!(
            ts(5, 250_000_000),
            UNIX_EPOCH + Duration::new(5, 250_000_000)
        );
        assert!(ts(-5, 0) < UNIX_EPOCH);
    }
}
