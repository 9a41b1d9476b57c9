//! Per-operation request handlers
//!
//! Each handler owns its complete exchange on the data stream: decode the
//! fixed payload, read any follow-up frames (path overflow, write data),
//! execute against the backend, and send the reply. Backend failures are
//! translated to the wire status `(ret, remote_errno)`; only transport and
//! protocol failures propagate as errors, which cost the peer its
//! connection.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use zerocopy::{Immutable, IntoBytes};

use super::backend::{errno_of, DirRef, FileRef, FsBackend};
use crate::constants::{MAX_FRAME_SIZE, NAME_MAX};
use crate::metadata::MetadataRecord;
use crate::proto::messages::{
    AttrReply, CloseRequest, ClosedirRequest, CreatRequest, DirentReply, FileAttr,
    GetattrRequest, MdataReply, MkdirRequest, OpenRequest, OpendirRequest, PathField,
    ReadMdataRequest,
    ReadRequest, ReaddirRequest, RemoveRequest, RenameRequest, RmdirRequest, RwChunkHeader,
    SetattrRequest, StatusReply, StatvfsReply, StatvfsRequest, WriteMdataFileSizeRequest,
    WriteMdataRequest, WriteRequest,
};
use crate::proto::{Envelope, OpCode, ProtoError};
use crate::rpc::stream::{read_full, recv_chunk_header, send_chunk_header, send_envelope, write_full};
use crate::rpc::RpcError;

const ENAMETOOLONG: i32 = 36;

pub async fn dispatch<S>(
    envelope: &Envelope,
    stream: &mut S,
    backend: &dyn FsBackend,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match envelope.op {
        OpCode::OpenFile => open(envelope, stream, backend).await,
        OpCode::CreatFile => creat(envelope, stream, backend).await,
        OpCode::ReadFile => read(envelope, stream, backend).await,
        OpCode::WriteFile => write(envelope, stream, backend).await,
        OpCode::CloseFile => close(envelope, stream, backend).await,
        OpCode::RmFile => remove(envelope, stream, backend, true).await,
        OpCode::RmFileAsync => remove(envelope, stream, backend, false).await,
        OpCode::RenameFile => rename(envelope, stream, backend).await,
        OpCode::GetattrFile => getattr(envelope, stream, backend).await,
        OpCode::SetattrFile => setattr(envelope, stream, backend).await,
        OpCode::MkdirDir => mkdir(envelope, stream, backend).await,
        OpCode::OpendirDir => opendir(envelope, stream, backend).await,
        OpCode::ReaddirDir => readdir(envelope, stream, backend).await,
        OpCode::ClosedirDir => closedir(envelope, stream, backend).await,
        OpCode::RmdirDir => rmdir(envelope, stream, backend, true).await,
        OpCode::RmdirDirAsync => rmdir(envelope, stream, backend, false).await,
        OpCode::StatvfsDir => statvfs(envelope, stream, backend).await,
        OpCode::ReadMdata => read_mdata(envelope, stream, backend).await,
        OpCode::WriteMdata => write_mdata(envelope, stream, backend).await,
        OpCode::WriteMdataFileSize => write_mdata_file_size(envelope, stream, backend).await,
        // Session control is the dispatch loop's business, not a handler's.
        OpCode::Disconnect | OpCode::Finalize => Ok(()),
    }
}

/// Read the overflow frame (if any) and reassemble the full path.
async fn read_path<S>(stream: &mut S, field: &PathField) -> Result<String, RpcError>
where
    S: AsyncRead + Unpin,
{
    let mut overflow = vec![0u8; field.overflow_len()];
    if !overflow.is_empty() {
        read_full(stream, &mut overflow).await?;
    }
    Ok(field.resolve(&overflow)?)
}

async fn reply<S, T>(stream: &mut S, op: OpCode, tag: u64, body: &T) -> Result<(), RpcError>
where
    S: AsyncWrite + Unpin,
    T: IntoBytes + Immutable,
{
    send_envelope(stream, &Envelope::new(op, tag, body)).await
}

fn status_of(result: io::Result<i64>) -> StatusReply {
    match result {
        Ok(ret) => StatusReply::ok(ret),
        Err(e) => StatusReply::err(errno_of(&e)),
    }
}

async fn open<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: OpenRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = match backend.open(&path, req.flags.get(), req.mode.get()).await {
        // Without a session the open only validates the path; no
        // descriptor survives the request.
        Ok(fd) if req.session.get() == 0 => backend.close(fd).await.map(|_| 0),
        other => other,
    };
    reply(stream, OpCode::OpenFile, env.tag, &status_of(result)).await
}

async fn creat<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: CreatRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = match backend.create(&path, req.mode.get()).await {
        Ok(fd) if req.session.get() == 0 => backend.close(fd).await.map(|_| 0),
        other => other,
    };
    reply(stream, OpCode::CreatFile, env.tag, &status_of(result)).await
}

async fn read<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: ReadRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let mut offset = req.offset.get();
    let mut remaining = req.size.get().max(0);
    let mut buf = vec![0u8; MAX_FRAME_SIZE.min(remaining as usize)];

    while remaining > 0 {
        let want = (remaining as usize).min(MAX_FRAME_SIZE);
        let file = if req.session.get() != 0 {
            FileRef::Fd(req.fd.get())
        } else {
            FileRef::Path(&path)
        };
        match backend.pread(file, offset, &mut buf[..want]).await {
            Ok(n) => {
                send_chunk_header(stream, &RwChunkHeader::data(n as i64)).await?;
                if n == 0 {
                    break; // EOF record ends the loop on both sides
                }
                write_full(stream, &buf[..n]).await?;
                offset += n as i64;
                remaining -= n as i64;
            }
            Err(e) => {
                send_chunk_header(stream, &RwChunkHeader::err(errno_of(&e))).await?;
                break;
            }
        }
        stream.flush().await.map_err(RpcError::Transport)?;
    }
    stream.flush().await.map_err(RpcError::Transport)?;
    Ok(())
}

async fn write<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: WriteRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let mut offset = req.offset.get();
    let mut remaining = req.size.get().max(0);
    let mut total: i64 = 0;
    let mut failure: Option<i32> = None;
    let mut buf = vec![0u8; MAX_FRAME_SIZE.min(remaining as usize)];

    while remaining > 0 {
        let header = recv_chunk_header(stream).await?;
        let size = header.size.get();
        if size <= 0 {
            break;
        }
        let size = size as usize;
        if size > MAX_FRAME_SIZE || size as i64 > remaining {
            return Err(RpcError::Proto(ProtoError::Oversize {
                len: size,
                capacity: MAX_FRAME_SIZE,
            }));
        }
        read_full(stream, &mut buf[..size]).await?;
        // After a failure the remaining frames are drained so the stream
        // stays framed, but nothing more hits the backend.
        if failure.is_none() {
            let file = if req.session.get() != 0 {
                FileRef::Fd(req.fd.get())
            } else {
                FileRef::Path(&path)
            };
            match backend.pwrite(file, offset, &buf[..size]).await {
                Ok(n) => {
                    total += n as i64;
                    offset += n as i64;
                    if n < size {
                        failure = Some(5); // EIO: backend stopped short
                    }
                }
                Err(e) => failure = Some(errno_of(&e)),
            }
        }
        remaining -= size as i64;
    }

    let status = match failure {
        None => StatusReply::ok(total),
        Some(errno) => StatusReply::err(errno),
    };
    reply(stream, OpCode::WriteFile, env.tag, &status).await
}

async fn close<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: CloseRequest = env.decode_payload()?;
    let result = backend.close(req.fd.get()).await.map(|_| 0);
    reply(stream, OpCode::CloseFile, env.tag, &status_of(result)).await
}

async fn remove<S>(
    env: &Envelope,
    stream: &mut S,
    backend: &dyn FsBackend,
    respond: bool,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: RemoveRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = backend.remove(&path).await.map(|_| 0);
    if !respond {
        if let Err(e) = &result {
            tracing::warn!("async remove of {} failed: {}", path, e);
        }
        return Ok(());
    }
    reply(stream, OpCode::RmFile, env.tag, &status_of(result)).await
}

async fn rename<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: RenameRequest = env.decode_payload()?;
    // Overflow frames arrive in field order: old path, then new path.
    let old_path = read_path(stream, &req.old_path).await?;
    let new_path = read_path(stream, &req.new_path).await?;
    let result = backend.rename(&old_path, &new_path).await.map(|_| 0);
    reply(stream, OpCode::RenameFile, env.tag, &status_of(result)).await
}

async fn getattr<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: GetattrRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let body = match backend.getattr(&path).await {
        Ok(attr) => AttrReply {
            status: StatusReply::ok(0),
            attr,
        },
        Err(e) => AttrReply {
            status: StatusReply::err(errno_of(&e)),
            attr: FileAttr::default(),
        },
    };
    reply(stream, OpCode::GetattrFile, env.tag, &body).await
}

async fn setattr<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: SetattrRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = backend.setattr(&path, &req.attr).await.map(|_| 0);
    reply(stream, OpCode::SetattrFile, env.tag, &status_of(result)).await
}

async fn mkdir<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: MkdirRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = backend.mkdir(&path, req.mode.get()).await.map(|_| 0);
    reply(stream, OpCode::MkdirDir, env.tag, &status_of(result)).await
}

async fn opendir<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: OpendirRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = if req.session.get() != 0 {
        backend.opendir(&path).await
    } else {
        // Stateless directory streams cursor by cookie; validate the path
        // now so the caller learns about a missing directory at opendir.
        backend.readdir(DirRef::Path(&path), 0).await.map(|_| 0)
    };
    reply(stream, OpCode::OpendirDir, env.tag, &status_of(result)).await
}

async fn readdir<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: ReaddirRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let dir = if req.session.get() != 0 {
        DirRef::Handle(req.dir_handle.get())
    } else {
        DirRef::Path(&path)
    };
    let body = match backend.readdir(dir, req.cookie.get()).await {
        // A name the dirent frame cannot carry whole is an error, not a
        // silently clipped entry.
        Ok(Some((name, _))) if name.len() > NAME_MAX => {
            tracing::debug!("readdir entry of {} bytes exceeds the wire limit", name.len());
            DirentReply {
                status: StatusReply::err(ENAMETOOLONG),
                ..DirentReply::end_of_stream(req.cookie.get())
            }
        }
        Ok(Some((name, next))) => DirentReply::entry(&name, next),
        Ok(None) => DirentReply::end_of_stream(req.cookie.get()),
        Err(e) => DirentReply {
            status: StatusReply::err(errno_of(&e)),
            ..DirentReply::end_of_stream(req.cookie.get())
        },
    };
    reply(stream, OpCode::ReaddirDir, env.tag, &body).await
}

async fn closedir<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: ClosedirRequest = env.decode_payload()?;
    let result = backend.closedir(req.dir_handle.get()).await.map(|_| 0);
    reply(stream, OpCode::ClosedirDir, env.tag, &status_of(result)).await
}

async fn rmdir<S>(
    env: &Envelope,
    stream: &mut S,
    backend: &dyn FsBackend,
    respond: bool,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: RmdirRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = backend.rmdir(&path).await.map(|_| 0);
    if !respond {
        if let Err(e) = &result {
            tracing::warn!("async rmdir of {} failed: {}", path, e);
        }
        return Ok(());
    }
    reply(stream, OpCode::RmdirDir, env.tag, &status_of(result)).await
}

async fn statvfs<S>(env: &Envelope, stream: &mut S, backend: &dyn FsBackend) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: StatvfsRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let body = match backend.statvfs(&path).await {
        Ok(stats) => StatvfsReply {
            status: StatusReply::ok(0),
            bsize: stats.bsize.into(),
            blocks: stats.blocks.into(),
            bfree: stats.bfree.into(),
            bavail: stats.bavail.into(),
            files: stats.files.into(),
            ffree: stats.ffree.into(),
        },
        Err(e) => StatvfsReply {
            status: StatusReply::err(errno_of(&e)),
            bsize: 0.into(),
            blocks: 0.into(),
            bfree: 0.into(),
            bavail: 0.into(),
            files: 0.into(),
            ffree: 0.into(),
        },
    };
    reply(stream, OpCode::StatvfsDir, env.tag, &body).await
}

async fn read_mdata<S>(
    env: &Envelope,
    stream: &mut S,
    backend: &dyn FsBackend,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: ReadMdataRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let body = match backend.read_mdata(&path).await {
        // An absent record is not an error: the zeroed record fails the
        // magic check on the client, meaning "no stripefs metadata".
        Ok(record) => MdataReply {
            status: StatusReply::ok(0),
            mdata: record.unwrap_or(zeroed_record()),
        },
        Err(e) => MdataReply {
            status: StatusReply::err(errno_of(&e)),
            mdata: zeroed_record(),
        },
    };
    reply(stream, OpCode::ReadMdata, env.tag, &body).await
}

async fn write_mdata<S>(
    env: &Envelope,
    stream: &mut S,
    backend: &dyn FsBackend,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: WriteMdataRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = backend.write_mdata(&path, &req.mdata).await.map(|_| 0);
    reply(stream, OpCode::WriteMdata, env.tag, &status_of(result)).await
}

async fn write_mdata_file_size<S>(
    env: &Envelope,
    stream: &mut S,
    backend: &dyn FsBackend,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req: WriteMdataFileSizeRequest = env.decode_payload()?;
    let path = read_path(stream, &req.path).await?;
    let result = backend
        .write_mdata_file_size(&path, req.size.get())
        .await
        .map(|_| 0);
    reply(stream, OpCode::WriteMdataFileSize, env.tag, &status_of(result)).await
}

fn zeroed_record() -> MetadataRecord {
    MetadataRecord {
        magic: 0.into(),
        file_size: 0.into(),
        block_size: 0.into(),
        replication_level: 0.into(),
    }
}
