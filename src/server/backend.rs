//! Pluggable storage backends for the dispatch core
//!
//! A backend executes one server's share of the namespace: block files,
//! directories and metadata sidecars under its storage root. `DiskBackend`
//! is the host passthrough; `NestedBackend` (see [`super::nested`]) routes
//! the same operations into a nested client partition for hierarchical
//! deployments. The local connector drives a `DiskBackend` directly, so
//! client and server agree on the on-disk layout by construction.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::fcntl::OFlag;
use tokio::sync::Mutex;
use zerocopy::IntoBytes;

use crate::metadata::MetadataRecord;
use crate::nfi::FsStats;
use crate::proto::messages::FileAttr;

/// Suffix of the metadata sidecar kept next to a file's block data on its
/// master server. Sidecars are invisible to READDIR and travel with the
/// file through RENAME and RM.
pub const MDATA_SUFFIX: &str = ".sfsmeta";

fn mdata_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(MDATA_SUFFIX);
    PathBuf::from(os)
}

/// Errno a failed backend operation reports to the peer.
pub fn errno_of(err: &io::Error) -> i32 {
    const EIO: i32 = 5;
    err.raw_os_error().unwrap_or(EIO)
}

/// A file target: a descriptor held by the server-side table (session
/// discipline) or a path to open and close inside the operation.
#[derive(Debug, Clone, Copy)]
pub enum FileRef<'a> {
    Fd(i64),
    Path(&'a str),
}

/// Same split for directory streams.
#[derive(Debug, Clone, Copy)]
pub enum DirRef<'a> {
    Handle(i64),
    Path(&'a str),
}

/// One server's storage operations.
#[async_trait]
pub trait FsBackend: Send + Sync {
    async fn open(&self, path: &str, flags: i32, mode: u32) -> io::Result<i64>;
    async fn create(&self, path: &str, mode: u32) -> io::Result<i64>;
    async fn close(&self, fd: i64) -> io::Result<()>;
    async fn pread(&self, file: FileRef<'_>, offset: i64, buf: &mut [u8]) -> io::Result<usize>;
    async fn pwrite(&self, file: FileRef<'_>, offset: i64, data: &[u8]) -> io::Result<usize>;
    async fn remove(&self, path: &str) -> io::Result<()>;
    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()>;
    async fn getattr(&self, path: &str) -> io::Result<FileAttr>;
    async fn setattr(&self, path: &str, attr: &FileAttr) -> io::Result<()>;
    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    async fn opendir(&self, path: &str) -> io::Result<i64>;

    /// Entry at `cookie` plus the next cookie, `None` at end of stream.
    async fn readdir(&self, dir: DirRef<'_>, cookie: i64)
        -> io::Result<Option<(String, i64)>>;

    async fn closedir(&self, handle: i64) -> io::Result<()>;
    async fn rmdir(&self, path: &str) -> io::Result<()>;
    async fn statvfs(&self, path: &str) -> io::Result<FsStats>;
    async fn read_mdata(&self, path: &str) -> io::Result<Option<MetadataRecord>>;
    async fn write_mdata(&self, path: &str, record: &MetadataRecord) -> io::Result<()>;
    async fn write_mdata_file_size(&self, path: &str, size: i64) -> io::Result<()>;
}

/// Host-filesystem passthrough rooted at the exported directory.
pub struct DiskBackend {
    root: PathBuf,
    files: Mutex<HashMap<i64, Arc<File>>>,
    dirs: Mutex<HashMap<i64, DirCursor>>,
    next_handle: AtomicI64,
    /// Serializes read-modify-write of metadata sidecars.
    mdata_lock: Mutex<()>,
}

struct DirCursor {
    entries: Vec<String>,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_handle: AtomicI64::new(1),
            mdata_lock: Mutex::new(()),
        }
    }

    /// Map a namespace path under the storage root. Parent traversal is
    /// rejected so a peer can never name anything outside the export.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        if path.split('/').any(|c| c == "..") {
            return Err(io::Error::from_raw_os_error(13)); // EACCES
        }
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    async fn register_file(&self, file: File) -> i64 {
        let fd = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.files.lock().await.insert(fd, Arc::new(file));
        fd
    }

    async fn lookup_file(&self, fd: i64) -> io::Result<Arc<File>> {
        self.files
            .lock()
            .await
            .get(&fd)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(9)) // EBADF
    }

    async fn file_for(&self, file: FileRef<'_>, write: bool) -> io::Result<Arc<File>> {
        match file {
            FileRef::Fd(fd) => self.lookup_file(fd).await,
            FileRef::Path(path) => {
                let full = self.resolve(path)?;
                blocking(move || {
                    let mut opts = OpenOptions::new();
                    opts.read(true);
                    if write {
                        opts.write(true).create(true).mode(0o644);
                    }
                    opts.open(&full).map(Arc::new)
                })
                .await
            }
        }
    }

    /// Directory snapshot with stable ordering; sidecars and dot entries
    /// never appear.
    fn snapshot_entries(full: &Path) -> io::Result<Vec<String>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(full)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(MDATA_SUFFIX) {
                continue;
            }
            entries.push(name.to_string());
        }
        entries.sort();
        Ok(entries)
    }
}

async fn blocking<T>(f: impl FnOnce() -> io::Result<T> + Send + 'static) -> io::Result<T>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

fn open_with_flags(full: PathBuf, flags: i32, mode: u32) -> io::Result<File> {
    let oflag = OFlag::from_bits_truncate(flags);
    let mut opts = OpenOptions::new();
    opts.read(!oflag.contains(OFlag::O_WRONLY));
    if oflag.intersects(OFlag::O_WRONLY | OFlag::O_RDWR) {
        opts.write(true);
    }
    if oflag.contains(OFlag::O_CREAT) {
        opts.write(true).create(true).mode(mode);
    }
    if oflag.contains(OFlag::O_TRUNC) {
        opts.truncate(true);
    }
    opts.open(&full)
}

#[async_trait]
impl FsBackend for DiskBackend {
    async fn open(&self, path: &str, flags: i32, mode: u32) -> io::Result<i64> {
        let full = self.resolve(path)?;
        let file = blocking(move || open_with_flags(full, flags, mode)).await?;
        Ok(self.register_file(file).await)
    }

    async fn create(&self, path: &str, mode: u32) -> io::Result<i64> {
        let full = self.resolve(path)?;
        let file = blocking(move || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(mode)
                .open(&full)
        })
        .await?;
        Ok(self.register_file(file).await)
    }

    async fn close(&self, fd: i64) -> io::Result<()> {
        self.files
            .lock()
            .await
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(9))
    }

    async fn pread(&self, file: FileRef<'_>, offset: i64, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.file_for(file, false).await?;
        let len = buf.len();
        let data = blocking(move || {
            let mut tmp = vec![0u8; len];
            let n = handle.read_at(&mut tmp, offset as u64)?;
            tmp.truncate(n);
            Ok(tmp)
        })
        .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn pwrite(&self, file: FileRef<'_>, offset: i64, data: &[u8]) -> io::Result<usize> {
        let handle = self.file_for(file, true).await?;
        let owned = data.to_vec();
        blocking(move || {
            let mut written = 0;
            while written < owned.len() {
                let n = handle.write_at(&owned[written..], (offset as u64) + written as u64)?;
                if n == 0 {
                    break;
                }
                written += n;
            }
            Ok(written)
        })
        .await
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        blocking(move || {
            std::fs::remove_file(&full)?;
            match std::fs::remove_file(mdata_path(&full)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        let old = self.resolve(old_path)?;
        let new = self.resolve(new_path)?;
        blocking(move || {
            std::fs::rename(&old, &new)?;
            match std::fs::rename(mdata_path(&old), mdata_path(&new)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn getattr(&self, path: &str) -> io::Result<FileAttr> {
        let full = self.resolve(path)?;
        blocking(move || {
            let meta = std::fs::symlink_metadata(&full)?;
            let kind = if meta.is_dir() {
                FileAttr::KIND_DIR
            } else {
                FileAttr::KIND_FILE
            };
            Ok(FileAttr {
                kind: kind.into(),
                mode: (meta.mode() & 0o7777).into(),
                nlink: (meta.nlink() as u32).into(),
                _pad: 0.into(),
                size: (meta.size() as i64).into(),
                mtime_secs: meta.mtime().into(),
            })
        })
        .await
    }

    async fn setattr(&self, path: &str, attr: &FileAttr) -> io::Result<()> {
        let full = self.resolve(path)?;
        let mode = attr.mode.get();
        blocking(move || {
            std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
        })
        .await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let full = self.resolve(path)?;
        blocking(move || {
            let mut builder = std::fs::DirBuilder::new();
            builder.mode(mode);
            builder.create(&full)
        })
        .await
    }

    async fn opendir(&self, path: &str) -> io::Result<i64> {
        let full = self.resolve(path)?;
        let entries = blocking(move || Self::snapshot_entries(&full)).await?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.dirs.lock().await.insert(handle, DirCursor { entries });
        Ok(handle)
    }

    async fn readdir(
        &self,
        dir: DirRef<'_>,
        cookie: i64,
    ) -> io::Result<Option<(String, i64)>> {
        let index = usize::try_from(cookie)
            .map_err(|_| io::Error::from_raw_os_error(22))?; // EINVAL
        let entry = match dir {
            DirRef::Handle(handle) => {
                let dirs = self.dirs.lock().await;
                let cursor = dirs
                    .get(&handle)
                    .ok_or_else(|| io::Error::from_raw_os_error(9))?;
                cursor.entries.get(index).cloned()
            }
            DirRef::Path(path) => {
                let full = self.resolve(path)?;
                let entries = blocking(move || Self::snapshot_entries(&full)).await?;
                entries.into_iter().nth(index)
            }
        };
        Ok(entry.map(|name| (name, cookie + 1)))
    }

    async fn closedir(&self, handle: i64) -> io::Result<()> {
        self.dirs
            .lock()
            .await
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(9))
    }

    async fn rmdir(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        blocking(move || std::fs::remove_dir(&full)).await
    }

    async fn statvfs(&self, path: &str) -> io::Result<FsStats> {
        let full = self.resolve(path)?;
        blocking(move || {
            let vfs = nix::sys::statvfs::statvfs(&full)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(FsStats {
                bsize: vfs.block_size() as u64,
                blocks: vfs.blocks() as u64,
                bfree: vfs.blocks_free() as u64,
                bavail: vfs.blocks_available() as u64,
                files: vfs.files() as u64,
                ffree: vfs.files_free() as u64,
            })
        })
        .await
    }

    async fn read_mdata(&self, path: &str) -> io::Result<Option<MetadataRecord>> {
        let full = mdata_path(&self.resolve(path)?);
        let _guard = self.mdata_lock.lock().await;
        blocking(move || match std::fs::read(&full) {
            Ok(bytes) => Ok(MetadataRecord::decode(&bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn write_mdata(&self, path: &str, record: &MetadataRecord) -> io::Result<()> {
        let full = mdata_path(&self.resolve(path)?);
        let bytes = record.as_bytes().to_vec();
        let _guard = self.mdata_lock.lock().await;
        blocking(move || std::fs::write(&full, &bytes)).await
    }

    async fn write_mdata_file_size(&self, path: &str, size: i64) -> io::Result<()> {
        let full = mdata_path(&self.resolve(path)?);
        // Read-modify-write under the sidecar lock; concurrent extenders
        // must converge on the maximum.
        let _guard = self.mdata_lock.lock().await;
        blocking(move || {
            let bytes = std::fs::read(&full)?;
            let Some(mut record) = MetadataRecord::decode(&bytes) else {
                return Err(io::Error::from_raw_os_error(22)); // EINVAL
            };
            if size > record.file_size.get() {
                record.file_size = size.into();
                std::fs::write(&full, record.as_bytes())?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, DiskBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path());
        (dir, backend)
    }

    #[tokio::test]
    async fn test_create_write_read_through_descriptor() {
        let (_dir, backend) = backend();
        let fd = backend.create("/blob", 0o644).await.unwrap();
        let n = backend
            .pwrite(FileRef::Fd(fd), 3, b"hello")
            .await
            .unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let n = backend.pread(FileRef::Fd(fd), 3, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        backend.close(fd).await.unwrap();
        assert!(backend.close(fd).await.is_err());
    }

    #[tokio::test]
    async fn test_stateless_refs_open_per_call() {
        let (_dir, backend) = backend();
        backend
            .pwrite(FileRef::Path("/f"), 0, b"data")
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        let n = backend
            .pread(FileRef::Path("/f"), 0, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"data");
        assert!(backend.files.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_short_read_past_eof() {
        let (_dir, backend) = backend();
        backend
            .pwrite(FileRef::Path("/short"), 0, b"abc")
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = backend
            .pread(FileRef::Path("/short"), 0, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_parent_traversal_rejected() {
        let (_dir, backend) = backend();
        assert!(backend.getattr("/../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_readdir_hides_sidecars_and_is_ordered() {
        let (_dir, backend) = backend();
        backend.mkdir("/d", 0o755).await.unwrap();
        for name in ["b", "a", "c"] {
            let fd = backend.create(&format!("/d/{name}"), 0o644).await.unwrap();
            backend.close(fd).await.unwrap();
        }
        backend
            .write_mdata("/d/a", &MetadataRecord::new(0, 4096, 0))
            .await
            .unwrap();

        let handle = backend.opendir("/d").await.unwrap();
        let mut names = Vec::new();
        let mut cookie = 0;
        while let Some((name, next)) = backend
            .readdir(DirRef::Handle(handle), cookie)
            .await
            .unwrap()
        {
            names.push(name);
            cookie = next;
        }
        backend.closedir(handle).await.unwrap();
        assert_eq!(names, ["a", "b", "c"]);

        // Stateless cursor sees the same stream.
        let (first, next) = backend
            .readdir(DirRef::Path("/d"), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "a");
        assert_eq!(next, 1);
    }

    #[tokio::test]
    async fn test_mdata_round_trip_and_size_refresh() {
        let (_dir, backend) = backend();
        let fd = backend.create("/m", 0o644).await.unwrap();
        backend.close(fd).await.unwrap();

        assert!(backend.read_mdata("/m").await.unwrap().is_none());
        backend
            .write_mdata("/m", &MetadataRecord::new(100, 65536, 1))
            .await
            .unwrap();

        backend.write_mdata_file_size("/m", 50).await.unwrap();
        let record = backend.read_mdata("/m").await.unwrap().unwrap();
        assert_eq!(record.file_size.get(), 100); // shrink ignored

        backend.write_mdata_file_size("/m", 500).await.unwrap();
        let record = backend.read_mdata("/m").await.unwrap().unwrap();
        assert_eq!(record.file_size.get(), 500);
    }

    #[tokio::test]
    async fn test_remove_and_rename_carry_sidecar() {
        let (dir, backend) = backend();
        let fd = backend.create("/x", 0o644).await.unwrap();
        backend.close(fd).await.unwrap();
        backend
            .write_mdata("/x", &MetadataRecord::new(1, 4096, 0))
            .await
            .unwrap();

        backend.rename("/x", "/y").await.unwrap();
        assert!(backend.read_mdata("/y").await.unwrap().is_some());
        assert!(!dir.path().join(format!("x{MDATA_SUFFIX}")).exists());

        backend.remove("/y").await.unwrap();
        assert!(!dir.path().join("y").exists());
        assert!(!dir.path().join(format!("y{MDATA_SUFFIX}")).exists());
    }

    #[tokio::test]
    async fn test_getattr_kinds() {
        let (_dir, backend) = backend();
        backend.mkdir("/sub", 0o755).await.unwrap();
        let attr = backend.getattr("/sub").await.unwrap();
        assert_eq!(attr.kind.get(), FileAttr::KIND_DIR);

        let fd = backend.create("/sub/f", 0o600).await.unwrap();
        backend.pwrite(FileRef::Fd(fd), 0, b"12345").await.unwrap();
        backend.close(fd).await.unwrap();
        let attr = backend.getattr("/sub/f").await.unwrap();
        assert_eq!(attr.kind.get(), FileAttr::KIND_FILE);
        assert_eq!(attr.size.get(), 5);
        assert_eq!(attr.mode.get(), 0o600);
    }

    #[tokio::test]
    async fn test_statvfs_reports_nonzero_capacity() {
        let (_dir, backend) = backend();
        let stats = backend.statvfs("/").await.unwrap();
        assert!(stats.bsize > 0);
        assert!(stats.blocks > 0);
    }
}
