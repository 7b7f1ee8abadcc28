//! MLLP client sender (§4.9): a single long-lived connection, reopened on the next `send()` call
//! when dropped. Retries are stage-local (§7): a connect or write failure here is returned to the
//! caller as-is, and it is the orchestrator's per-message retry loop that requeues with an
//! incremented `retry_count` — this sender never retries a send on its own.

use interop_core::envelope::Envelope;
use interop_core::error::{EngineError, EngineResult, ErrorKind};
use interop_core::net::Connection;
use interop_hl7::mllp::{encode, parse_ack};
use interop_hl7::parser::parse_message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const ACK_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the single outbound connection; every send serializes through `conn`'s mutex (§5 "the
/// MLLP sender's write mutex").
pub struct MllpSender {
    addr: String,
    conn: Mutex<Option<Connection>>,
}

impl MllpSender {
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(MllpSender { addr: addr.into(), conn: Mutex::new(None) })
    }

    async fn ensure_connected(&self, guard: &mut Option<Connection>) -> EngineResult<()> {
        if guard.is_some() {
            return Ok(());
        }
        match Connection::connect(&self.addr).await {
            Ok(conn) => {
                *guard = Some(conn);
                Ok(())
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "MLLP reconnect failed");
                Err(e)
            }
        }
    }

    /// Sends one envelope's raw HL7 body, parses the ACK, and returns `Ok(())` on `AA`/`CA`.
    /// Drops the connection on any transport failure so the next call reconnects.
    pub async fn send(&self, envelope: &Envelope) -> EngineResult<()> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard).await?;
        let conn = guard.as_mut().expect("connected above");

        let framed = encode(&envelope.body.raw_content);
        if let Err(e) = conn.write_all(&framed).await {
            *guard = None;
            return Err(e);
        }

        let read = tokio::time::timeout(ACK_READ_TIMEOUT, read_frame(conn)).await;
        let payload = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                *guard = None;
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                return Err(EngineError::transport("timed out awaiting MLLP ACK"));
            }
        };

        let ack_msg = parse_message(&payload)?;
        let (code, reason) = parse_ack(&ack_msg)?;
        match code.as_str() {
            "AA" | "CA" => {
                info!(addr = %self.addr, "MLLP send acknowledged");
                Ok(())
            }
            _ => Err(EngineError::new(
                ErrorKind::ApplicationReject,
                reason.unwrap_or_else(|| format!("MSA-1 {code}")),
            )),
        }
    }
}

async fn read_frame(conn: &mut Connection) -> EngineResult<Vec<u8>> {
    let mut decoder = interop_hl7::mllp::FrameDecoder::new();
    loop {
        let byte = conn.read_byte().await?;
        if let Some(payload) = decoder.feed(byte)? {
            return Ok(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_core::envelope::{Body, Header};
    use interop_hl7::mllp::{build_ack, decode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_and_parses_positive_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let framed = &buf[..n];
            let payload = decode(framed).unwrap();
            let msg = parse_message(payload).unwrap();
            let ack = build_ack(&msg, "MSG00001");
            stream.write_all(&encode(ack.as_bytes())).await.unwrap();
        });

        let sender = MllpSender::new(addr.to_string());
        let raw = b"MSH|^~\\&|A|B|C|D||ADT^A01|MSG00001|P|2.3\r";
        let header = Header::new("ADT^A01", "application/hl7-v2+er7", "test://");
        let body = Body::from_raw("application/hl7-v2+er7", raw.to_vec());
        let envelope = Envelope::new(header, body);

        sender.send(&envelope).await.unwrap();
        server_task.await.unwrap();
    }
}
