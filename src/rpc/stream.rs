//! Short-transfer-safe stream primitives
//!
//! A single `read`/`write` call on a stream socket may move fewer bytes than
//! requested. Every transfer in the protocol goes through these loops, which
//! retry until the full size has moved and fail immediately on a zero-length
//! result instead of spinning forever.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{FromBytes, IntoBytes};

use super::RpcError;
use crate::proto::messages::RwChunkHeader;
use crate::proto::{Envelope, HEADER_SIZE};

/// Write the whole buffer, looping over partial writes.
pub async fn write_full<W>(writer: &mut W, buf: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < buf.len() {
        let n = writer.write(&buf[sent..]).await?;
        if n == 0 {
            return Err(RpcError::ShortTransfer {
                transferred: sent,
                requested: buf.len(),
            });
        }
        sent += n;
    }
    Ok(())
}

/// Fill the whole buffer, looping over partial reads.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(RpcError::ShortTransfer {
                transferred: got,
                requested: buf.len(),
            });
        }
        got += n;
    }
    Ok(())
}

/// Send a complete envelope: fixed header then the declared payload.
pub async fn send_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    write_full(writer, &envelope.header_bytes()).await?;
    write_full(writer, envelope.payload()).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a complete envelope, validating the declared payload length
/// against the envelope capacity before reading it.
pub async fn recv_envelope<R>(reader: &mut R) -> Result<Envelope, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    read_full(reader, &mut header).await?;
    let (op, len, tag) = Envelope::parse_header(&header)?;
    let mut envelope = Envelope::for_receive(op, tag, len)?;
    read_full(reader, envelope.payload_mut()).await?;
    Ok(envelope)
}

/// Send the size/status record preceding a data frame.
pub async fn send_chunk_header<W>(writer: &mut W, header: &RwChunkHeader) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    write_full(writer, header.as_bytes()).await
}

/// Receive the size/status record preceding a data frame.
pub async fn recv_chunk_header<R>(reader: &mut R) -> Result<RwChunkHeader, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; RwChunkHeader::SIZE];
    read_full(reader, &mut buf).await?;
    RwChunkHeader::read_from_bytes(&buf).map_err(|_| RpcError::ShortTransfer {
        transferred: 0,
        requested: RwChunkHeader::SIZE,
    })
}
