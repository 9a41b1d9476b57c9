//! Open-file table and logical file state
//!
//! The table hands out the small integer descriptors the POSIX-like surface
//! speaks. Descriptors are allocated lowest-first: recycled slots before
//! never-used ones, matching the usual open() behavior callers key on.
//! `dup`/`dup2` alias two descriptors to one logical file; the underlying
//! remote handles are closed only when the last alias goes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;

/// What a logical descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

/// Striping parameters resolved at open time.
///
/// `passthrough` marks a path with no stripefs metadata: all bytes live on
/// the master server as a plain file and placement is bypassed.
#[derive(Debug, Clone, Copy)]
pub struct Striping {
    pub block_size: i64,
    pub replication: usize,
    pub seed: usize,
    pub passthrough: bool,
}

/// Per-server state of one logical file: the remote descriptor (file or
/// directory handle) when the session discipline keeps one open.
#[derive(Debug, Default)]
pub struct VirtualHandle {
    pub remote: Option<i64>,
}

/// One open logical file or directory stream.
pub struct LogicalFile {
    pub path: String,
    pub kind: FileKind,
    pub flags: i32,
    pub mode: u32,
    pub striping: Striping,
    /// File offset, or the directory stream cursor. Held across a whole
    /// offset-advancing operation so two tasks on one descriptor do not
    /// interleave.
    pub offset: Mutex<i64>,
    /// Cached metadata file size.
    pub size: Mutex<i64>,
    /// One slot per partition server, lazily initialized.
    pub handles: Vec<Mutex<VirtualHandle>>,
}

impl LogicalFile {
    pub fn new(
        path: String,
        kind: FileKind,
        flags: i32,
        mode: u32,
        striping: Striping,
        size: i64,
        server_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            kind,
            flags,
            mode,
            striping,
            offset: Mutex::new(0),
            size: Mutex::new(size),
            handles: (0..server_count).map(|_| Mutex::new(VirtualHandle::default())).collect(),
        })
    }
}

impl std::fmt::Debug for LogicalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalFile")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<i32, Arc<LogicalFile>>,
    free: BTreeSet<i32>,
    next: i32,
}

impl TableInner {
    fn allocate(&mut self) -> i32 {
        if let Some(&fd) = self.free.iter().next() {
            self.free.remove(&fd);
            fd
        } else {
            let fd = self.next;
            self.next += 1;
            fd
        }
    }
}

/// Descriptor table shared by one client instance.
#[derive(Default)]
pub struct OpenFileTable {
    inner: StdMutex<TableInner>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file: Arc<LogicalFile>) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let fd = inner.allocate();
        inner.entries.insert(fd, file);
        fd
    }

    pub fn get(&self, fd: i32) -> Option<Arc<LogicalFile>> {
        self.inner.lock().unwrap().entries.get(&fd).cloned()
    }

    /// Remove a descriptor and recycle its slot. The caller still holds the
    /// returned `Arc`; remote handles should be closed only when it is the
    /// last alias (see [`OpenFileTable::aliases`]).
    pub fn remove(&self, fd: i32) -> Option<Arc<LogicalFile>> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.entries.remove(&fd)?;
        inner.free.insert(fd);
        Some(file)
    }

    /// Number of descriptors still aliasing this logical file.
    pub fn aliases(&self, file: &Arc<LogicalFile>) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|entry| Arc::ptr_eq(entry, file))
            .count()
    }

    /// Alias `fd` under a fresh descriptor.
    pub fn dup(&self, fd: i32) -> Option<i32> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.entries.get(&fd).cloned()?;
        let new_fd = inner.allocate();
        inner.entries.insert(new_fd, file);
        Some(new_fd)
    }

    /// Alias `fd` as exactly `new_fd`, returning whatever logical file
    /// `new_fd` previously referred to (the caller closes it).
    pub fn dup2(&self, fd: i32, new_fd: i32) -> Option<Option<Arc<LogicalFile>>> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.entries.get(&fd).cloned()?;
        if fd == new_fd {
            return Some(None);
        }
        let displaced = inner.entries.insert(new_fd, file);
        inner.free.remove(&new_fd);
        if new_fd >= inner.next {
            // Descriptors below new_fd that were never handed out stay
            // allocatable.
            for gap in inner.next..new_fd {
                inner.free.insert(gap);
            }
            inner.next = new_fd + 1;
        }
        Some(displaced)
    }

    /// Drain every entry for teardown; the table is empty afterwards.
    pub fn drain(&self) -> Vec<(i32, Arc<LogicalFile>)> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<_> = inner.entries.drain().collect();
        for (fd, _) in &drained {
            inner.free.insert(*fd);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
