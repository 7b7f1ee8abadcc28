//! MLLP listener (C4): TCP server framing HL7 v2 messages, emitting ACK/NAK (§4.3).

use interop_core::config::MllpListenerConfig;
use interop_core::envelope::{Body, BodyContent, Envelope, Header};
use interop_core::error::EngineResult;
use interop_core::net::{Connection, Server};
use interop_core::queue::Queue;
use interop_hl7::mllp::{build_ack, build_nak, encode, FrameDecoder};
use interop_hl7::parser::parse_message;
use interop_hl7::validator::validate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Binds `addr` and publishes each framed message to `ingest_queue`, replying ACK/NAK on the same
/// connection. Runs until `shutdown` fires. `config.max_connections` caps how many connections are
/// serviced concurrently; connections beyond the cap are accepted and closed immediately rather
/// than queued, matching the "reject beyond capacity" reading of §6's `max_connections` option.
pub async fn run(
    config: &MllpListenerConfig,
    ingest_queue: Arc<dyn Queue<Envelope>>,
    shutdown: mpsc::Receiver<()>,
) -> EngineResult<()> {
    let server = Server::bind(&config.bind).await?;
    let local_addr = server.local_addr();
    debug!(%local_addr, max_connections = config.max_connections, "MLLP listener bound");
    let buffer_size = config.buffer_size;
    let permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
    server
        .serve(shutdown, move |conn| {
            let ingest_queue = Arc::clone(&ingest_queue);
            let permits = Arc::clone(&permits);
            async move {
                let permit = match permits.try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(peer = %conn.peer_addr, "MLLP connection cap reached, closing");
                        return;
                    }
                };
                handle_connection(conn, ingest_queue, buffer_size).await;
                drop(permit);
            }
        })
        .await;
    Ok(())
}

/// Feeds bytes one at a time into a [`FrameDecoder`], matching the IDLE/READING_PAYLOAD/EXPECT_CR
/// state machine from §4.3 directly rather than trying to delimit frames by scanning for `CR`
/// (the ER7 payload itself contains `\r` segment terminators, so a delimiter-based read would
/// stop mid-payload).
async fn handle_connection(mut conn: Connection, ingest_queue: Arc<dyn Queue<Envelope>>, buffer_size: usize) {
    let mut decoder = FrameDecoder::with_max_payload(buffer_size);
    loop {
        let byte = match tokio::time::timeout(READ_DEADLINE, conn.read_byte()).await {
            Ok(Ok(b)) => b,
            Ok(Err(_)) => return,
            Err(_) => {
                debug!(peer = %conn.peer_addr, "MLLP read deadline exceeded, closing");
                return;
            }
        };
        let payload = match decoder.feed(byte) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(peer = %conn.peer_addr, error = %e, "malformed MLLP framing, closing connection");
                return;
            }
        };

        let reply = process_payload(&payload, &ingest_queue).await;
        if conn.write_all(&encode(reply.as_bytes())).await.is_err() {
            return;
        }
    }
}

/// Parses `payload`'s MSH, validates it, publishes an envelope to the ingest queue, and builds
/// the ACK/NAK text to write back. Never fails outward: a parse, validation, or publish error
/// becomes a NAK (§4.3/S2 — a parseable-but-invalid message must NAK synchronously, not ACK).
async fn process_payload(payload: &[u8], ingest_queue: &Arc<dyn Queue<Envelope>>) -> String {
    let parsed = match parse_message(payload) {
        Ok(m) => m,
        Err(e) => {
            // Can't build a proper ACK without a parsed MSH to swap fields from; best effort.
            return format!("MSH|^~\\&|||||\rMSA|AE||{}\r", e.message);
        }
    };
    let control_id = parsed.message_control_id().unwrap_or_default().to_string();

    if let Err(e) = validate(&parsed) {
        return build_nak(&parsed, &control_id, &e.message);
    }

    let header = Header::new(
        parsed.message_type().unwrap_or_default().to_string(),
        "application/hl7-v2+er7",
        "mllp://inbound",
    );
    let mut body = Body::from_raw("application/hl7-v2+er7", payload.to_vec());
    body.content = BodyContent::Hl7(interop_hl7::flatten(&parsed));
    let envelope = Envelope::new(header, body);

    match ingest_queue.publish(envelope).await {
        Ok(()) => build_ack(&parsed, &control_id),
        Err(e) => build_nak(&parsed, &control_id, &e.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_core::queue::QueueManager;
    use interop_hl7::mllp::encode as mllp_encode;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const ADT_A01: &[u8] = b"MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230629120000||ADT^A01|MSG00001|P|2.3\rEVN|A01|20230629120000\rPID|1||12345||Doe^John||19700101|M\rPV1|1|O\r";
    const ADT_A01_MISSING_PID: &[u8] = b"MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230629120000||ADT^A01|MSG00002|P|2.3\rEVN|A01|20230629120000\r";

    async fn spawn_listener(
        ingest: Arc<dyn Queue<Envelope>>,
    ) -> (SocketAddr, mpsc::Sender<()>, tokio::task::JoinHandle<()>) {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = server.local_addr();
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            server
                .serve(rx, move |conn| {
                    let ingest = Arc::clone(&ingest);
                    async move { handle_connection(conn, ingest, 4096).await }
                })
                .await;
        });
        (addr, tx, handle)
    }

    #[tokio::test]
    async fn s1_happy_path_ack_and_ingest_publish() {
        let queues = QueueManager::<Envelope>::new(interop_core::queue::QueueConfig::default());
        let ingest = queues.queue("raw_messages").await;
        let (addr, tx, listener) = spawn_listener(ingest.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&mllp_encode(ADT_A01)).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(reply.contains("MSA|AA|MSG00001"));
        assert_eq!(ingest.len().await, 1);

        let _ = tx.send(()).await;
        let _ = listener.await;
    }

    #[tokio::test]
    async fn s2_missing_pid_naks_on_the_wire_and_is_not_ingested() {
        let queues = QueueManager::<Envelope>::new(interop_core::queue::QueueConfig::default());
        let ingest = queues.queue("raw_messages").await;
        let (addr, tx, listener) = spawn_listener(ingest.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&mllp_encode(ADT_A01_MISSING_PID)).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(reply.contains("MSA|AE"));
        assert!(reply.contains("Missing required segment: PID"));
        assert_eq!(ingest.len().await, 0);

        let _ = tx.send(()).await;
        let _ = listener.await;
    }
}
