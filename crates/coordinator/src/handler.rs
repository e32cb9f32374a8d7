//! Connection Handler (C4): per-worker accept/registration handshake.
//!
//! Runs once per accepted stream, then returns — no standing receive loop.
//! The dispatch engine initiates every subsequent exchange with a given
//! worker, which avoids races between a per-worker receiver and the
//! dispatcher awaiting a specific RESULT (see spec.md §4.4/§9).

use crate::registry::{log_registered, WorkerRegistry};
use crate::transport;
use coordinator_protocol::messages::RegisterPayload;
use coordinator_protocol::MessageType;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, warn};

/// Handle one freshly-accepted stream: register it, mark it IDLE, and
/// return. Any handshake failure removes the worker from the registry.
pub async fn handle_connection(
    registry: Arc<WorkerRegistry>,
    stream: TcpStream,
    registration_timeout: Duration,
) {
    let handle = registry.add(stream).await;
    let provisional_id = handle.id();

    let (header, payload) = {
        let mut reader = handle.reader.lock().await;
        match transport::recv(&mut reader, registration_timeout, registration_timeout).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(worker_id = provisional_id, error = %e, "registration failed");
                registry.remove(provisional_id).await;
                return;
            }
        }
    };

    if header.msg_type != MessageType::Register {
        error!(
            worker_id = provisional_id,
            got = ?header.msg_type,
            "expected REGISTER, got a different message type"
        );
        registry.remove(provisional_id).await;
        return;
    }

    let register = match RegisterPayload::decode(&payload) {
        Ok(r) => r,
        Err(e) => {
            error!(worker_id = provisional_id, error = %e, "malformed REGISTER payload");
            registry.remove(provisional_id).await;
            return;
        }
    };

    // The header's worker_id is the hardware-assigned identity; the
    // registry's own counter was only a placeholder until now.
    let assigned_id = header.worker_id;
    if let Err(e) = registry
        .rekey(provisional_id, assigned_id, register.clock_mhz)
        .await
    {
        error!(worker_id = provisional_id, error = %e, "failed to register worker");
        registry.remove(provisional_id).await;
        return;
    }

    let ack = coordinator_protocol::messages::RegisterAckPayload {
        status: 0,
        assigned_id,
    }
    .encode();

    {
        let mut writer = handle.writer.lock().await;
        if let Err(e) =
            transport::send(&mut writer, MessageType::RegisterAck, assigned_id, &ack).await
        {
            warn!(worker_id = assigned_id, error = %e, "failed to send REGISTER_ACK");
            registry.remove(assigned_id).await;
            return;
        }
    }

    registry.mark_idle(assigned_id).await;
    log_registered(assigned_id, register.clock_mhz);
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_protocol::messages::RegisterAckPayload;
    use coordinator_protocol::decode_header;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_registers_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(WorkerRegistry::new());

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = RegisterPayload { clock_mhz: 240 }.encode();
            let header = coordinator_protocol::encode_header(
                MessageType::Register,
                9,
                payload.len() as u32,
            );
            stream.write_all(&header).await.unwrap();
            stream.write_all(&payload).await.unwrap();

            let mut header_buf = [0u8; coordinator_protocol::HEADER_SIZE];
            stream.read_exact(&mut header_buf).await.unwrap();
            let header = decode_header(&header_buf).unwrap();
            let mut ack_buf = vec![0u8; header.payload_len as usize];
            stream.read_exact(&mut ack_buf).await.unwrap();
            (header, RegisterAckPayload::decode(&ack_buf).unwrap())
        });

        let (stream, _) = listener.accept().await.unwrap();
        handle_connection(registry.clone(), stream, Duration::from_secs(1)).await;

        let (ack_header, ack) = client.await.unwrap();
        assert_eq!(ack_header.msg_type, MessageType::RegisterAck);
        assert_eq!(ack.status, 0);
        assert_eq!(ack.assigned_id, 9);

        let snapshot = registry.snapshot_workers().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), 9);
        assert_eq!(snapshot[0].clock_mhz(), 240);
    }

    #[tokio::test]
    async fn non_register_first_message_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(WorkerRegistry::new());

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let header = coordinator_protocol::encode_header(MessageType::Heartbeat, 1, 0);
            stream.write_all(&header).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        handle_connection(registry.clone(), stream, Duration::from_secs(1)).await;
        client.await.unwrap();

        assert_eq!(registry.snapshot_workers().await.len(), 0);
    }
}
