//! POSIX-like client surface
//!
//! A `StripeFs` owns one partition (the ordered server fleet plus striping
//! parameters) and an open-file table. File descriptors are small integers;
//! read/write walk the placement engine block by block, fanning writes out
//! to every replica and reading from the primary. Directory operations
//! involve every server (the namespace is replicated) while a directory
//! *stream* is served by the directory's master server only.

use std::sync::Arc;

use nix::fcntl::OFlag;
use thiserror::Error;

use crate::config::{ConfigError, PartitionConfig, ReplicaWritePolicy};
use crate::metadata::{master_server, rotation_seed, MetadataRecord};
use crate::nfi::{
    Connector, FsStats, LocalConnector, NfiError, Protocol, RemoteConnector, ServerUrl,
};
use crate::placement::{place, StripeWalker};
use crate::proto::messages::FileAttr;

mod table;

pub use table::{FileKind, LogicalFile, OpenFileTable, Striping, VirtualHandle};

const ENOENT: i32 = 2;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad file descriptor {0}")]
    BadDescriptor(i32),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Nfi(#[from] NfiError),
}

impl ApiError {
    pub fn errno(&self) -> i32 {
        match self {
            ApiError::BadDescriptor(_) => 9, // EBADF
            ApiError::Invalid(_) | ApiError::Config(_) => 22, // EINVAL
            ApiError::Nfi(e) => e.errno(),
        }
    }
}

/// Origin for [`StripeFs::lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// The resolved server fleet of one partition.
pub struct Partition {
    config: PartitionConfig,
    connectors: Vec<Arc<dyn Connector>>,
}

impl Partition {
    /// Resolve every server URL into a connector. The variant is fixed here,
    /// once, by URL scheme; nothing on the data path re-inspects URLs.
    pub fn new(config: PartitionConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let mut connectors: Vec<Arc<dyn Connector>> = Vec::with_capacity(config.servers.len());
        for raw in &config.servers {
            let url = ServerUrl::parse(raw)
                .map_err(|e| ApiError::Invalid(format!("bad server url '{raw}': {e}")))?;
            let connector: Arc<dyn Connector> = match url.protocol {
                Protocol::Local => Arc::new(LocalConnector::new(url)),
                Protocol::Tcp => Arc::new(RemoteConnector::new(url, config.connectionless)),
                Protocol::Fabric => {
                    return Err(ApiError::Invalid(format!(
                        "no reliable-datagram provider is wired for '{raw}'"
                    )))
                }
            };
            connectors.push(connector);
        }
        Ok(Self { config, connectors })
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn server_count(&self) -> usize {
        self.connectors.len()
    }

    fn connector(&self, index: usize) -> &Arc<dyn Connector> {
        &self.connectors[index]
    }

    fn master_of(&self, path: &str) -> usize {
        master_server(path, self.server_count())
    }
}

/// One mounted partition with its descriptor table.
pub struct StripeFs {
    partition: Arc<Partition>,
    table: OpenFileTable,
}

impl StripeFs {
    pub fn new(config: PartitionConfig) -> Result<Self, ApiError> {
        Ok(Self {
            partition: Arc::new(Partition::new(config)?),
            table: OpenFileTable::new(),
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    fn cfg(&self) -> &PartitionConfig {
        self.partition.config()
    }

    fn get(&self, fd: i32, kind: FileKind) -> Result<Arc<LogicalFile>, ApiError> {
        let file = self.table.get(fd).ok_or(ApiError::BadDescriptor(fd))?;
        if file.kind != kind {
            return Err(ApiError::BadDescriptor(fd));
        }
        Ok(file)
    }

    // -- file lifecycle -----------------------------------------------------

    /// Open an existing path; with `O_CREAT`, create it when absent.
    ///
    /// A path carrying a valid metadata record opens striped; a path without
    /// one opens as a passthrough file living wholly on its master server.
    pub async fn open(&self, path: &str, flags: i32, mode: u32) -> Result<i32, ApiError> {
        let n = self.partition.server_count();
        let master = self.partition.master_of(path);
        let record = self.partition.connector(master).read_mdata(path).await?;

        let (striping, size) = match record {
            Some(record) => (
                Striping {
                    block_size: record.block_size.get() as i64,
                    replication: record.replication_level.get() as usize,
                    seed: rotation_seed(path, n),
                    passthrough: false,
                },
                record.file_size.get(),
            ),
            None if flags & OFlag::O_CREAT.bits() != 0 => {
                return self.create(path, mode).await;
            }
            None => {
                // Plain file on the master server, no striping metadata.
                let attr = self.partition.connector(master).getattr(path).await?;
                (
                    Striping {
                        block_size: self.cfg().block_size as i64,
                        replication: 0,
                        seed: master,
                        passthrough: true,
                    },
                    attr.size.get(),
                )
            }
        };

        let file = LogicalFile::new(path.to_string(), FileKind::File, flags, mode, striping, size, n);
        Ok(self.table.insert(file))
    }

    /// Create a striped file: one (empty) fragment per server, the metadata
    /// record on the master.
    pub async fn create(&self, path: &str, mode: u32) -> Result<i32, ApiError> {
        let n = self.partition.server_count();
        let cfg = self.cfg();
        let striping = Striping {
            block_size: cfg.block_size as i64,
            replication: cfg.replication_level,
            seed: rotation_seed(path, n),
            passthrough: false,
        };
        let flags = (OFlag::O_RDWR | OFlag::O_CREAT).bits();
        let file = LogicalFile::new(path.to_string(), FileKind::File, flags, mode, striping, 0, n);

        let session = cfg.session_file;
        for index in 0..n {
            let fd = self
                .partition
                .connector(index)
                .create(path, mode, session)
                .await?;
            if session {
                file.handles[index].lock().await.remote = Some(fd);
            }
        }

        let record = MetadataRecord::new(0, cfg.block_size as i32, cfg.replication_level as i32);
        self.partition
            .connector(self.partition.master_of(path))
            .write_mdata(path, &record)
            .await?;
        Ok(self.table.insert(file))
    }

    /// Close a descriptor. Remote handles are torn down only when this was
    /// the last alias of the logical file.
    pub async fn close(&self, fd: i32) -> Result<(), ApiError> {
        let file = self.table.remove(fd).ok_or(ApiError::BadDescriptor(fd))?;
        if self.table.aliases(&file) > 0 {
            return Ok(());
        }
        self.release_handles(&file).await
    }

    async fn release_handles(&self, file: &Arc<LogicalFile>) -> Result<(), ApiError> {
        let mut first_err = None;
        for (index, slot) in file.handles.iter().enumerate() {
            let remote = slot.lock().await.remote.take();
            if let Some(handle) = remote {
                let connector = self.partition.connector(index);
                let result = match file.kind {
                    FileKind::File => connector.close(handle).await,
                    FileKind::Dir => connector.closedir(handle).await,
                };
                if let Err(e) = result {
                    tracing::warn!("closing remote handle on server {} failed: {}", index, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn dup(&self, fd: i32) -> Result<i32, ApiError> {
        self.table.dup(fd).ok_or(ApiError::BadDescriptor(fd))
    }

    /// Alias `fd` as exactly `new_fd`, closing whatever `new_fd` referred to.
    pub async fn dup2(&self, fd: i32, new_fd: i32) -> Result<i32, ApiError> {
        if new_fd < 0 {
            return Err(ApiError::Invalid(format!("dup2 target {new_fd}")));
        }
        let displaced = self
            .table
            .dup2(fd, new_fd)
            .ok_or(ApiError::BadDescriptor(fd))?;
        if let Some(old) = displaced {
            if self.table.aliases(&old) == 0 {
                self.release_handles(&old).await?;
            }
        }
        Ok(new_fd)
    }

    // -- data path ----------------------------------------------------------

    /// Read at the descriptor's current offset and advance it.
    pub async fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, ApiError> {
        let file = self.get(fd, FileKind::File)?;
        let mut offset = file.offset.lock().await;
        let got = self.read_file_at(&file, *offset, buf).await?;
        *offset += got as i64;
        Ok(got)
    }

    /// Write at the descriptor's current offset and advance it.
    pub async fn write(&self, fd: i32, data: &[u8]) -> Result<usize, ApiError> {
        let file = self.get(fd, FileKind::File)?;
        let mut offset = file.offset.lock().await;
        let written = self.write_file_at(&file, *offset, data).await?;
        *offset += written as i64;
        Ok(written)
    }

    /// Positioned read; the descriptor offset is left alone.
    pub async fn pread(&self, fd: i32, offset: i64, buf: &mut [u8]) -> Result<usize, ApiError> {
        let file = self.get(fd, FileKind::File)?;
        self.read_file_at(&file, offset, buf).await
    }

    /// Positioned write; the descriptor offset is left alone.
    pub async fn pwrite(&self, fd: i32, offset: i64, data: &[u8]) -> Result<usize, ApiError> {
        let file = self.get(fd, FileKind::File)?;
        self.write_file_at(&file, offset, data).await
    }

    pub async fn lseek(&self, fd: i32, offset: i64, whence: SeekWhence) -> Result<i64, ApiError> {
        let file = self.get(fd, FileKind::File)?;
        let mut current = file.offset.lock().await;
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *current,
            SeekWhence::End => {
                // Another client may have extended the file; refresh.
                self.refresh_size(&file).await?
            }
        };
        let target = base + offset;
        if target < 0 {
            return Err(ApiError::Invalid(format!("seek to {target}")));
        }
        *current = target;
        Ok(target)
    }

    async fn refresh_size(&self, file: &Arc<LogicalFile>) -> Result<i64, ApiError> {
        let master = self.partition.master_of(&file.path);
        let fresh = if file.striping.passthrough {
            self.partition
                .connector(master)
                .getattr(&file.path)
                .await?
                .size
                .get()
        } else {
            match self.partition.connector(master).read_mdata(&file.path).await? {
                Some(record) => record.file_size.get(),
                None => *file.size.lock().await,
            }
        };
        *file.size.lock().await = fresh;
        Ok(fresh)
    }

    /// Session-aware remote descriptor for one server, opened on first use.
    async fn handle_for(
        &self,
        file: &Arc<LogicalFile>,
        index: usize,
    ) -> Result<(i64, bool), ApiError> {
        if !self.cfg().session_file {
            return Ok((0, false));
        }
        let mut slot = file.handles[index].lock().await;
        if let Some(fd) = slot.remote {
            return Ok((fd, true));
        }
        let flags = (OFlag::O_RDWR | OFlag::O_CREAT).bits();
        let fd = self
            .partition
            .connector(index)
            .open(&file.path, flags, file.mode, true)
            .await?;
        slot.remote = Some(fd);
        Ok((fd, true))
    }

    async fn read_file_at(
        &self,
        file: &Arc<LogicalFile>,
        offset: i64,
        buf: &mut [u8],
    ) -> Result<usize, ApiError> {
        if offset < 0 {
            return Err(ApiError::Invalid(format!("read at offset {offset}")));
        }
        let s = file.striping;
        if s.passthrough {
            let (fd, session) = self.handle_for(file, s.seed).await?;
            let got = self
                .partition
                .connector(s.seed)
                .read(&file.path, fd, session, offset, buf)
                .await?;
            return Ok(got);
        }

        // Never read past the metadata size: trailing fragments may not
        // exist on every server.
        let size = *file.size.lock().await;
        let want = buf.len().min((size - offset).max(0) as usize);
        let n = self.partition.server_count();
        let mut got = 0;

        for seg in StripeWalker::new(offset, want, s.block_size) {
            let entries = place(seg.offset, s.block_size, s.replication, n, s.seed);
            let mut read = None;
            let mut last_err = None;
            // Primary first; replicas cover for servers that are gone.
            for entry in &entries {
                let attempt: Result<usize, ApiError> = async {
                    let (fd, session) = self.handle_for(file, entry.server_index).await?;
                    Ok(self
                        .partition
                        .connector(entry.server_index)
                        .read(
                            &file.path,
                            fd,
                            session,
                            entry.in_server_offset,
                            &mut buf[seg.buf_offset..seg.buf_offset + seg.len],
                        )
                        .await?)
                }
                .await;
                match attempt {
                    Ok(n) => {
                        read = Some(n);
                        break;
                    }
                    Err(e) => {
                        if entry.replica_index < entries.len() - 1 {
                            tracing::warn!(
                                "read of block at {} failed on server {}, trying next replica: {}",
                                seg.offset,
                                entry.server_index,
                                e
                            );
                        }
                        last_err = Some(e);
                    }
                }
            }
            let read = match read {
                Some(n) => n,
                // Every replica failed; last_err is necessarily set.
                None => return Err(last_err.unwrap_or(ApiError::Nfi(NfiError::Remote { errno: 5 }))),
            };
            got += read;
            if read < seg.len {
                break;
            }
        }
        Ok(got)
    }

    async fn write_file_at(
        &self,
        file: &Arc<LogicalFile>,
        offset: i64,
        data: &[u8],
    ) -> Result<usize, ApiError> {
        if offset < 0 {
            return Err(ApiError::Invalid(format!("write at offset {offset}")));
        }
        let s = file.striping;
        if s.passthrough {
            let (fd, session) = self.handle_for(file, s.seed).await?;
            let written = self
                .partition
                .connector(s.seed)
                .write(&file.path, fd, session, offset, data)
                .await?;
            return Ok(written);
        }

        let policy = self.cfg().replica_write_policy;
        let n = self.partition.server_count();
        let mut written = 0usize;
        let mut deferred: Option<ApiError> = None;

        'segments: for seg in StripeWalker::new(offset, data.len(), s.block_size) {
            let chunk = &data[seg.buf_offset..seg.buf_offset + seg.len];
            for entry in place(seg.offset, s.block_size, s.replication, n, s.seed) {
                let result: Result<(), ApiError> = async {
                    let (fd, session) = self.handle_for(file, entry.server_index).await?;
                    let put = self
                        .partition
                        .connector(entry.server_index)
                        .write(&file.path, fd, session, entry.in_server_offset, chunk)
                        .await?;
                    if put < chunk.len() {
                        return Err(ApiError::Nfi(NfiError::Remote { errno: 5 }));
                    }
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    tracing::warn!(
                        "replica {} of block at {} failed on server {}: {}",
                        entry.replica_index,
                        seg.offset,
                        entry.server_index,
                        e
                    );
                    match policy {
                        ReplicaWritePolicy::Abort => return Err(e),
                        ReplicaWritePolicy::BestEffort => {
                            deferred.get_or_insert(e);
                        }
                    }
                }
            }
            if deferred.is_some() {
                // Replicas of this segment are done; nothing further is
                // counted as written.
                break 'segments;
            }
            written += seg.len;
        }

        if let Some(e) = deferred {
            return Err(e);
        }

        // Refresh the recorded size when the write extended the file.
        let end = offset + written as i64;
        let mut size = file.size.lock().await;
        if end > *size {
            self.partition
                .connector(self.partition.master_of(&file.path))
                .write_mdata_file_size(&file.path, end)
                .await?;
            *size = end;
        }
        Ok(written)
    }

    // -- namespace ----------------------------------------------------------

    /// Remove a file from every server (fragments, and the metadata sidecar
    /// on the master). Servers that never held a fragment are tolerated.
    pub async fn unlink(&self, path: &str) -> Result<(), ApiError> {
        let mut first_err = None;
        for index in 0..self.partition.server_count() {
            match self.partition.connector(index).remove(path).await {
                Ok(()) => {}
                Err(NfiError::Remote { errno }) if errno == ENOENT => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            };
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Fire-and-forget unlink: the request fans out, nobody waits.
    pub async fn unlink_async(&self, path: &str) -> Result<(), ApiError> {
        for index in 0..self.partition.server_count() {
            self.partition.connector(index).remove_async(path).await?;
        }
        Ok(())
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ApiError> {
        if master_server(old_path, self.partition.server_count())
            != master_server(new_path, self.partition.server_count())
        {
            // The record must stay on the new name's master; move it by
            // hand after renaming fragments.
            return self.rename_across_masters(old_path, new_path).await;
        }
        let mut first_err = None;
        for index in 0..self.partition.server_count() {
            match self.partition.connector(index).rename(old_path, new_path).await {
                Ok(()) => {}
                Err(NfiError::Remote { errno }) if errno == ENOENT => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            };
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn rename_across_masters(&self, old_path: &str, new_path: &str) -> Result<(), ApiError> {
        let n = self.partition.server_count();
        let old_master = master_server(old_path, n);
        let new_master = master_server(new_path, n);
        let record = self.partition.connector(old_master).read_mdata(old_path).await?;

        for index in 0..n {
            match self.partition.connector(index).rename(old_path, new_path).await {
                Ok(()) => {}
                Err(NfiError::Remote { errno }) if errno == ENOENT => {}
                Err(e) => return Err(e.into()),
            };
        }

        if let Some(record) = record {
            self.partition
                .connector(new_master)
                .write_mdata(new_path, &record)
                .await?;
        }
        Ok(())
    }

    /// Attributes of a path; the size of a striped file comes from its
    /// metadata record, not from any single fragment.
    pub async fn getattr(&self, path: &str) -> Result<FileAttr, ApiError> {
        let master = self.partition.master_of(path);
        let mut attr = self.partition.connector(master).getattr(path).await?;
        if attr.kind.get() == FileAttr::KIND_FILE {
            if let Some(record) = self.partition.connector(master).read_mdata(path).await? {
                attr.size = record.file_size;
            }
        }
        Ok(attr)
    }

    pub async fn setattr(&self, path: &str, attr: &FileAttr) -> Result<(), ApiError> {
        let mut first_err = None;
        for index in 0..self.partition.server_count() {
            match self.partition.connector(index).setattr(path, attr).await {
                Ok(()) => {}
                Err(NfiError::Remote { errno }) if errno == ENOENT => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            };
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Directories exist on every server so fragments always have a parent.
    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<(), ApiError> {
        for index in 0..self.partition.server_count() {
            self.partition.connector(index).mkdir(path, mode).await?;
        }
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), ApiError> {
        let mut first_err = None;
        for index in 0..self.partition.server_count() {
            match self.partition.connector(index).rmdir(path).await {
                Ok(()) => {}
                Err(NfiError::Remote { errno }) if errno == ENOENT => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            };
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn rmdir_async(&self, path: &str) -> Result<(), ApiError> {
        for index in 0..self.partition.server_count() {
            self.partition.connector(index).rmdir_async(path).await?;
        }
        Ok(())
    }

    /// Open a directory stream, served by the directory's master server.
    pub async fn opendir(&self, path: &str) -> Result<i32, ApiError> {
        let n = self.partition.server_count();
        let master = self.partition.master_of(path);
        let session = self.cfg().session_dir;
        let handle = self
            .partition
            .connector(master)
            .opendir(path, session)
            .await?;

        let striping = Striping {
            block_size: self.cfg().block_size as i64,
            replication: 0,
            seed: master,
            passthrough: true,
        };
        let file = LogicalFile::new(path.to_string(), FileKind::Dir, 0, 0, striping, 0, n);
        if session {
            file.handles[master].lock().await.remote = Some(handle);
        }
        Ok(self.table.insert(file))
    }

    /// Next entry of a directory stream, `None` at the end.
    pub async fn readdir(&self, fd: i32) -> Result<Option<String>, ApiError> {
        let file = self.get(fd, FileKind::Dir)?;
        let master = self.partition.master_of(&file.path);
        let session = self.cfg().session_dir;
        let mut cursor = file.offset.lock().await;
        let handle = file.handles[master].lock().await.remote.unwrap_or(0);
        let entry = self
            .partition
            .connector(master)
            .readdir(&file.path, handle, session, *cursor)
            .await?;
        match entry {
            Some((name, next)) => {
                *cursor = next;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    pub async fn closedir(&self, fd: i32) -> Result<(), ApiError> {
        self.get(fd, FileKind::Dir)?;
        self.close(fd).await
    }

    /// Aggregate filesystem statistics across the fleet.
    pub async fn statvfs(&self, path: &str) -> Result<FsStats, ApiError> {
        let mut total = FsStats::default();
        for index in 0..self.partition.server_count() {
            let stats = self.partition.connector(index).statvfs(path).await?;
            if total.bsize == 0 {
                total.bsize = stats.bsize;
            }
            total.blocks += stats.blocks;
            total.bfree += stats.bfree;
            total.bavail += stats.bavail;
            total.files += stats.files;
            total.ffree += stats.ffree;
        }
        Ok(total)
    }

    // -- metadata passthrough (nested deployments) --------------------------

    pub async fn read_mdata(&self, path: &str) -> Result<Option<MetadataRecord>, ApiError> {
        let master = self.partition.master_of(path);
        Ok(self.partition.connector(master).read_mdata(path).await?)
    }

    pub async fn write_mdata(&self, path: &str, record: &MetadataRecord) -> Result<(), ApiError> {
        let master = self.partition.master_of(path);
        Ok(self
            .partition
            .connector(master)
            .write_mdata(path, record)
            .await?)
    }

    pub async fn write_mdata_file_size(&self, path: &str, size: i64) -> Result<(), ApiError> {
        let master = self.partition.master_of(path);
        Ok(self
            .partition
            .connector(master)
            .write_mdata_file_size(path, size)
            .await?)
    }

    // -- teardown -----------------------------------------------------------

    /// Force-close every open descriptor and disconnect from the fleet.
    pub async fn shutdown(&self) -> Result<(), ApiError> {
        let mut seen: Vec<Arc<LogicalFile>> = Vec::new();
        for (_, file) in self.table.drain() {
            if !seen.iter().any(|f| Arc::ptr_eq(f, &file)) {
                seen.push(file);
            }
        }
        for file in &seen {
            if let Err(e) = self.release_handles(file).await {
                tracing::warn!("force-close of {} failed: {}", file.path, e);
            }
        }
        for index in 0..self.partition.server_count() {
            // A server that is already gone must not wedge teardown.
            if let Err(e) = self.partition.connector(index).disconnect().await {
                tracing::warn!("disconnect from server {} failed: {}", index, e);
            }
        }
        Ok(())
    }

    pub fn open_descriptors(&self) -> usize {
        self.table.len()
    }
}
