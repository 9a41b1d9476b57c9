//! Backend that fronts another partition
//!
//! A server configured with `nested_partition` stores nothing itself: every
//! operation it serves is re-striped across the inner fleet through the
//! client surface. This is how a gateway node exposes a whole partition
//! behind one address.

use std::io;

use async_trait::async_trait;

use super::backend::{DirRef, FileRef, FsBackend};
use crate::api::{ApiError, StripeFs};
use crate::metadata::MetadataRecord;
use crate::nfi::FsStats;
use crate::proto::messages::FileAttr;

pub struct NestedBackend {
    fs: StripeFs,
}

impl NestedBackend {
    pub fn new(fs: StripeFs) -> Self {
        Self { fs }
    }

    pub fn into_inner(self) -> StripeFs {
        self.fs
    }

    async fn descriptor_for(&self, file: FileRef<'_>, write: bool) -> io::Result<(i32, bool)> {
        match file {
            FileRef::Fd(fd) => Ok((fd as i32, false)),
            FileRef::Path(path) => {
                let flags = if write {
                    (nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_CREAT).bits()
                } else {
                    0
                };
                let fd = self.fs.open(path, flags, 0o644).await.map_err(to_io)?;
                Ok((fd, true))
            }
        }
    }
}

fn to_io(e: ApiError) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

#[async_trait]
impl FsBackend for NestedBackend {
    async fn open(&self, path: &str, flags: i32, mode: u32) -> io::Result<i64> {
        Ok(self.fs.open(path, flags, mode).await.map_err(to_io)? as i64)
    }

    async fn create(&self, path: &str, mode: u32) -> io::Result<i64> {
        Ok(self.fs.create(path, mode).await.map_err(to_io)? as i64)
    }

    async fn close(&self, fd: i64) -> io::Result<()> {
        self.fs.close(fd as i32).await.map_err(to_io)
    }

    async fn pread(&self, file: FileRef<'_>, offset: i64, buf: &mut [u8]) -> io::Result<usize> {
        let (fd, transient) = self.descriptor_for(file, false).await?;
        let result = self.fs.pread(fd, offset, buf).await.map_err(to_io);
        if transient {
            self.fs.close(fd).await.map_err(to_io)?;
        }
        result
    }

    async fn pwrite(&self, file: FileRef<'_>, offset: i64, data: &[u8]) -> io::Result<usize> {
        let (fd, transient) = self.descriptor_for(file, true).await?;
        let result = self.fs.pwrite(fd, offset, data).await.map_err(to_io);
        if transient {
            self.fs.close(fd).await.map_err(to_io)?;
        }
        result
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        self.fs.unlink(path).await.map_err(to_io)
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        self.fs.rename(old_path, new_path).await.map_err(to_io)
    }

    async fn getattr(&self, path: &str) -> io::Result<FileAttr> {
        self.fs.getattr(path).await.map_err(to_io)
    }

    async fn setattr(&self, path: &str, attr: &FileAttr) -> io::Result<()> {
        self.fs.setattr(path, attr).await.map_err(to_io)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        self.fs.mkdir(path, mode).await.map_err(to_io)
    }

    async fn opendir(&self, path: &str) -> io::Result<i64> {
        Ok(self.fs.opendir(path).await.map_err(to_io)? as i64)
    }

    async fn readdir(
        &self,
        dir: DirRef<'_>,
        cookie: i64,
    ) -> io::Result<Option<(String, i64)>> {
        match dir {
            DirRef::Handle(handle) => {
                // The inner stream keeps its own cursor; cookies returned to
                // the caller just count entries handed out.
                let entry = self.fs.readdir(handle as i32).await.map_err(to_io)?;
                Ok(entry.map(|name| (name, cookie + 1)))
            }
            DirRef::Path(path) => {
                // Stateless form: re-open and skip to the cookie.
                let fd = self.fs.opendir(path).await.map_err(to_io)?;
                let mut entry = None;
                for _ in 0..=cookie {
                    entry = self.fs.readdir(fd).await.map_err(to_io)?;
                    if entry.is_none() {
                        break;
                    }
                }
                self.fs.closedir(fd).await.map_err(to_io)?;
                Ok(entry.map(|name| (name, cookie + 1)))
            }
        }
    }

    async fn closedir(&self, handle: i64) -> io::Result<()> {
        self.fs.closedir(handle as i32).await.map_err(to_io)
    }

    async fn rmdir(&self, path: &str) -> io::Result<()> {
        self.fs.rmdir(path).await.map_err(to_io)
    }

    async fn statvfs(&self, path: &str) -> io::Result<FsStats> {
        self.fs.statvfs(path).await.map_err(to_io)
    }

    async fn read_mdata(&self, path: &str) -> io::Result<Option<MetadataRecord>> {
        self.fs.read_mdata(path).await.map_err(to_io)
    }

    async fn write_mdata(&self, path: &str, record: &MetadataRecord) -> io::Result<()> {
        self.fs.write_mdata(path, record).await.map_err(to_io)
    }

    async fn write_mdata_file_size(&self, path: &str, size: i64) -> io::Result<()> {
        self.fs
            .write_mdata_file_size(path, size)
            .await
            .map_err(to_io)
    }
}
