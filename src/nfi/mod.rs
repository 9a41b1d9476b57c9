//! NFI: the backend-agnostic connector contract
//!
//! Every transport/backend a partition can point at implements the same
//! capability set; the variant is chosen once per server at partition load
//! from the URL scheme and resolved once per virtual file handle, never per
//! call. Two families exist: [`local::LocalConnector`] executes directly
//! against a host filesystem backend (no network, no envelopes), and
//! [`remote::RemoteConnector`] turns every operation into a request/response
//! round trip through the client RPC engine.

use async_trait::async_trait;
use thiserror::Error;

use crate::metadata::MetadataRecord;
use crate::proto::messages::FileAttr;
use crate::proto::ProtoError;
use crate::rpc::RpcError;

pub mod local;
pub mod remote;

pub use local::LocalConnector;
pub use remote::RemoteConnector;

/// Connector-level errors.
///
/// A failure on the remote host arrives as `Remote { errno }`; the errno is
/// the *remote* one and callers must adopt it as their own before surfacing
/// the failure, because the local errno says nothing about what happened on
/// the peer.
#[derive(Debug, Error)]
pub enum NfiError {
    #[error("remote operation failed with errno {errno}")]
    Remote { errno: i32 },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("local backend error: {0}")]
    Local(#[from] std::io::Error),
}

impl NfiError {
    /// The errno a caller should adopt: the remote errno when one was
    /// actually received, the OS errno for local failures, EIO otherwise.
    pub fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        match self {
            NfiError::Remote { errno } => *errno,
            NfiError::Local(e) => e.raw_os_error().unwrap_or(EIO),
            NfiError::Rpc(_) | NfiError::Proto(_) => EIO,
        }
    }
}

/// Filesystem-level statistics (STATVFS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

/// Transport/backend selector from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Same-host passthrough, no network.
    Local,
    /// Stream-socket transport.
    Tcp,
    /// Tag-matched reliable-datagram transport.
    Fabric,
}

/// Parsed server endpoint URL: `protocol://host[:port]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    /// Storage root on that server.
    pub path: String,
}

impl ServerUrl {
    pub fn parse(url: &str) -> Result<Self, String> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| "missing '://'".to_string())?;
        let protocol = match scheme {
            "local" => Protocol::Local,
            "tcp" | "sck" => Protocol::Tcp,
            "fabric" => Protocol::Fabric,
            other => return Err(format!("unknown protocol '{other}'")),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("invalid port '{port}'"))?;
                (host.to_string(), Some(port))
            }
            None => (authority.to_string(), None),
        };

        if protocol != Protocol::Local && host.is_empty() {
            return Err("remote url needs a host".to_string());
        }

        Ok(Self {
            protocol,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Path of `file_path` as seen inside this server's storage root.
    pub fn resolve(&self, file_path: &str) -> String {
        let root = self.path.trim_end_matches('/');
        let rel = file_path.trim_start_matches('/');
        if rel.is_empty() {
            if root.is_empty() {
                "/".to_string()
            } else {
                root.to_string()
            }
        } else {
            format!("{root}/{rel}")
        }
    }
}

/// The capability set every backend satisfies.
///
/// `session` arguments select the per-file discipline: with a session, the
/// returned descriptor stays valid until `close`; without, each call embeds
/// its own remote open+close and descriptors are meaningless.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, path: &str, flags: i32, mode: u32, session: bool)
        -> Result<i64, NfiError>;

    async fn create(&self, path: &str, mode: u32, session: bool) -> Result<i64, NfiError>;

    async fn close(&self, fd: i64) -> Result<(), NfiError>;

    async fn read(
        &self,
        path: &str,
        fd: i64,
        session: bool,
        offset: i64,
        buf: &mut [u8],
    ) -> Result<usize, NfiError>;

    async fn write(
        &self,
        path: &str,
        fd: i64,
        session: bool,
        offset: i64,
        buf: &[u8],
    ) -> Result<usize, NfiError>;

    async fn remove(&self, path: &str) -> Result<(), NfiError>;

    /// Fire-and-forget remove: no response is awaited or reported.
    async fn remove_async(&self, path: &str) -> Result<(), NfiError>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), NfiError>;

    async fn getattr(&self, path: &str) -> Result<FileAttr, NfiError>;

    async fn setattr(&self, path: &str, attr: &FileAttr) -> Result<(), NfiError>;

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), NfiError>;

    async fn opendir(&self, path: &str, session: bool) -> Result<i64, NfiError>;

    /// Read the entry at `cookie`; returns the name and the next cookie,
    /// or `None` at end of stream.
    async fn readdir(
        &self,
        path: &str,
        dir_handle: i64,
        session: bool,
        cookie: i64,
    ) -> Result<Option<(String, i64)>, NfiError>;

    async fn closedir(&self, dir_handle: i64) -> Result<(), NfiError>;

    async fn rmdir(&self, path: &str) -> Result<(), NfiError>;

    async fn rmdir_async(&self, path: &str) -> Result<(), NfiError>;

    async fn statvfs(&self, path: &str) -> Result<FsStats, NfiError>;

    /// Read the metadata record; `Ok(None)` when the path has no valid
    /// stripefs metadata.
    async fn read_mdata(&self, path: &str) -> Result<Option<MetadataRecord>, NfiError>;

    async fn write_mdata(&self, path: &str, record: &MetadataRecord) -> Result<(), NfiError>;

    /// Refresh the recorded file size, keeping the maximum of the current
    /// and the given value (size-extending writes only).
    async fn write_mdata_file_size(&self, path: &str, size: i64) -> Result<(), NfiError>;

    /// Tear down any held session. Idempotent.
    async fn disconnect(&self) -> Result<(), NfiError>;

    fn url(&self) -> &ServerUrl;
}
