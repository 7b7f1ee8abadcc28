//! HTTP/FHIR ingest listener: accepts FHIR resources and Bundles over REST, publishing each as
//! an envelope the same way the MLLP listener and file watcher do (§3 data flow: "Ingest (C4/C5
//! + HTTP FHIR)").

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use interop_core::envelope::{Body, BodyContent, Envelope, Header};
use interop_core::error::EngineResult;
use interop_core::queue::Queue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone)]
struct IngestState {
    queue: Arc<dyn Queue<Envelope>>,
}

/// Binds `addr` and serves `POST /{resourceType}` (and `/Bundle` for `$process-message`-style
/// batches), publishing each accepted body to `ingest_queue` as a FHIR envelope. Runs until
/// `shutdown` fires.
pub async fn run(
    addr: &str,
    ingest_queue: Arc<dyn Queue<Envelope>>,
    mut shutdown: mpsc::Receiver<()>,
) -> EngineResult<()> {
    let state = IngestState { queue: ingest_queue };
    let app = Router::new()
        .route("/{resource_type}", post(ingest_resource))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| interop_core::error::EngineError::transport(format!("binding {addr}: {e}")))?;
    debug!(%addr, "HTTP FHIR listener bound");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await;
        })
        .await
        .map_err(|e| interop_core::error::EngineError::transport(e.to_string()))
}

async fn ingest_resource(
    State(state): State<IngestState>,
    AxumPath(resource_type): AxumPath<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let message_type = body
        .get("resourceType")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or(resource_type);

    let header = Header::new(message_type, "application/fhir+json", "http://inbound");
    let mut envelope_body = Body::from_raw("application/fhir+json", body.to_string().into_bytes());
    envelope_body.content = BodyContent::Fhir(body);
    let envelope = Envelope::new(header, envelope_body);

    match state.queue.publish(envelope).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!(error = %e, "HTTP ingest publish failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_core::queue::QueueManager;
    use std::time::Duration;

    #[tokio::test]
    async fn accepted_resource_is_published_as_fhir_envelope() {
        let queues = QueueManager::<Envelope>::new(Default::default());
        let ingest = queues.queue("raw_messages").await;
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let addr_string = addr.to_string();
        let ingest_clone = ingest.clone();
        let server = tokio::spawn(async move { run(&addr_string, ingest_clone, stop_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/Patient"))
            .json(&serde_json::json!({ "resourceType": "Patient", "id": "42" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

        assert_eq!(ingest.len().await, 1);
        let (_, envelope) = ingest.consume().await.unwrap().unwrap();
        assert_eq!(envelope.header.message_type, "Patient");

        let _ = stop_tx.send(()).await;
        let _ = server.await;
    }
}
