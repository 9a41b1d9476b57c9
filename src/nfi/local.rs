//! Local passthrough connector
//!
//! Executes the capability set directly against a [`DiskBackend`] rooted at
//! the URL path, with no network round trip. Semantics match the server
//! handlers bit for bit (same backend type, same session discipline), so a
//! partition can mix `local://` and `tcp://` servers freely.

use async_trait::async_trait;

use super::{Connector, FsStats, NfiError, ServerUrl};
use crate::metadata::MetadataRecord;
use crate::proto::messages::FileAttr;
use crate::server::backend::{DirRef, DiskBackend, FileRef, FsBackend};

pub struct LocalConnector {
    url: ServerUrl,
    backend: DiskBackend,
}

impl LocalConnector {
    pub fn new(url: ServerUrl) -> Self {
        let backend = DiskBackend::new(url.path.clone());
        Self { url, backend }
    }
}

fn file_ref<'a>(fd: i64, session: bool, path: &'a str) -> FileRef<'a> {
    if session {
        FileRef::Fd(fd)
    } else {
        FileRef::Path(path)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(
        &self,
        path: &str,
        flags: i32,
        mode: u32,
        session: bool,
    ) -> Result<i64, NfiError> {
        let fd = self.backend.open(path, flags, mode).await?;
        if session {
            Ok(fd)
        } else {
            self.backend.close(fd).await?;
            Ok(0)
        }
    }

    async fn create(&self, path: &str, mode: u32, session: bool) -> Result<i64, NfiError> {
        let fd = self.backend.create(path, mode).await?;
        if session {
            Ok(fd)
        } else {
            self.backend.close(fd).await?;
            Ok(0)
        }
    }

    async fn close(&self, fd: i64) -> Result<(), NfiError> {
        Ok(self.backend.close(fd).await?)
    }

    async fn read(
        &self,
        path: &str,
        fd: i64,
        session: bool,
        offset: i64,
        buf: &mut [u8],
    ) -> Result<usize, NfiError> {
        Ok(self
            .backend
            .pread(file_ref(fd, session, path), offset, buf)
            .await?)
    }

    async fn write(
        &self,
        path: &str,
        fd: i64,
        session: bool,
        offset: i64,
        buf: &[u8],
    ) -> Result<usize, NfiError> {
        Ok(self
            .backend
            .pwrite(file_ref(fd, session, path), offset, buf)
            .await?)
    }

    async fn remove(&self, path: &str) -> Result<(), NfiError> {
        Ok(self.backend.remove(path).await?)
    }

    async fn remove_async(&self, path: &str) -> Result<(), NfiError> {
        if let Err(e) = self.backend.remove(path).await {
            tracing::warn!("async remove of {} failed: {}", path, e);
        }
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), NfiError> {
        Ok(self.backend.rename(old_path, new_path).await?)
    }

    async fn getattr(&self, path: &str) -> Result<FileAttr, NfiError> {
        Ok(self.backend.getattr(path).await?)
    }

    async fn setattr(&self, path: &str, attr: &FileAttr) -> Result<(), NfiError> {
        Ok(self.backend.setattr(path, attr).await?)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), NfiError> {
        Ok(self.backend.mkdir(path, mode).await?)
    }

    async fn opendir(&self, path: &str, session: bool) -> Result<i64, NfiError> {
        if session {
            Ok(self.backend.opendir(path).await?)
        } else {
            // Validate the directory now; the stream itself cursors by
            // cookie.
            self.backend.readdir(DirRef::Path(path), 0).await?;
            Ok(0)
        }
    }

    async fn readdir(
        &self,
        path: &str,
        dir_handle: i64,
        session: bool,
        cookie: i64,
    ) -> Result<Option<(String, i64)>, NfiError> {
        let dir = if session {
            DirRef::Handle(dir_handle)
        } else {
            DirRef::Path(path)
        };
        Ok(self.backend.readdir(dir, cookie).await?)
    }

    async fn closedir(&self, dir_handle: i64) -> Result<(), NfiError> {
        Ok(self.backend.closedir(dir_handle).await?)
    }

    async fn rmdir(&self, path: &str) -> Result<(), NfiError> {
        Ok(self.backend.rmdir(path).await?)
    }

    async fn rmdir_async(&self, path: &str) -> Result<(), NfiError> {
        if let Err(e) = self.backend.rmdir(path).await {
            tracing::warn!("async rmdir of {} failed: {}", path, e);
        }
        Ok(())
    }

    async fn statvfs(&self, path: &str) -> Result<FsStats, NfiError> {
        Ok(self.backend.statvfs(path).await?)
    }

    async fn read_mdata(&self, path: &str) -> Result<Option<MetadataRecord>, NfiError> {
        Ok(self.backend.read_mdata(path).await?)
    }

    async fn write_mdata(&self, path: &str, record: &MetadataRecord) -> Result<(), NfiError> {
        Ok(self.backend.write_mdata(path, record).await?)
    }

    async fn write_mdata_file_size(&self, path: &str, size: i64) -> Result<(), NfiError> {
        Ok(self.backend.write_mdata_file_size(path, size).await?)
    }

    async fn disconnect(&self) -> Result<(), NfiError> {
        Ok(())
    }

    fn url(&self) -> &ServerUrl {
        &self.url
    }
}
