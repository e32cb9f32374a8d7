//! Framed Transport (C2): length-prefixed send/receive over a reliable byte
//! stream, with timeouts.

use crate::error::{CoordinatorError, Result};
use coordinator_protocol::{decode_header, encode_header, Header, MessageType, HEADER_SIZE};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Write a header followed by its payload. A single call is one atomic
/// frame; callers serialize concurrent `send`s on the same worker by
/// holding the write half behind a mutex.
pub async fn send(
    writer: &mut OwnedWriteHalf,
    msg_type: MessageType,
    worker_id: u8,
    payload: &[u8],
) -> Result<()> {
    let header = encode_header(msg_type, worker_id, payload.len() as u32);
    writer
        .write_all(&header)
        .await
        .map_err(CoordinatorError::TransportFailed)?;
    if !payload.is_empty() {
        writer
            .write_all(payload)
            .await
            .map_err(CoordinatorError::TransportFailed)?;
    }
    writer
        .flush()
        .await
        .map_err(CoordinatorError::TransportFailed)?;
    Ok(())
}

/// Read exactly one frame: a 16-byte header under `header_timeout`, then
/// exactly `payload_len` bytes under `payload_timeout`.
pub async fn recv(
    reader: &mut OwnedReadHalf,
    header_timeout: Duration,
    payload_timeout: Duration,
) -> Result<(Header, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    match tokio::time::timeout(header_timeout, reader.read_exact(&mut header_buf)).await {
        Err(_) => return Err(CoordinatorError::Timeout("message header".to_string())),
        Ok(Err(e)) => return Err(CoordinatorError::TransportFailed(e)),
        Ok(Ok(_)) => {}
    }

    let header = decode_header(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        match tokio::time::timeout(payload_timeout, reader.read_exact(&mut payload)).await {
            Err(_) => return Err(CoordinatorError::Timeout("message payload".to_string())),
            Ok(Err(e)) => return Err(CoordinatorError::TransportFailed(e)),
            Ok(Ok(_)) => {}
        }
    }

    Ok((header, payload))
}
